// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 U.S. Federal Government (in countries where recognized)
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end coverage of the DMS state machine over the in-memory store and
//! the scripted CA.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::http::StatusCode;
use base64::{engine::general_purpose, Engine as _};
use common::{csr_base64, MemStore, StubCa};
use der::Decode;
use x509_cert::Certificate;

use dms_enroller::error::EnrollerError;
use dms_enroller::models::{DmsStatus, DmsSubject, KeyRequest, KeyStrength, KeyType};
use dms_enroller::service::{DmsService, Enroller};
use dms_enroller::store::DmsStore;

const CA_NAME: &str = "Lamassu-DMS-Enroller";

fn setup() -> (Arc<MemStore>, Arc<StubCa>, Enroller) {
    let store = Arc::new(MemStore::new());
    let ca = Arc::new(StubCa::new(CA_NAME));
    let enroller = Enroller::new(store.clone(), ca.clone());
    (store, ca, enroller)
}

#[tokio::test]
async fn test_create_dms_lands_pending() {
    let (_, _, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();

    assert_eq!(dms.status, DmsStatus::PendingApproval);
    assert!(dms.serial_number.is_empty());
    assert!(dms.authorized_cas.is_empty());
    assert_eq!(dms.key_metadata.key_type, KeyType::Ec);
    assert_eq!(dms.key_metadata.key_bits, 256);
    assert_eq!(dms.key_metadata.key_strength, KeyStrength::High);
}

#[tokio::test]
async fn test_create_rejects_empty_name_and_bad_csr() {
    let (_, _, enroller) = setup();

    let err = enroller.create_dms(&csr_base64("x"), "  ").await.unwrap_err();
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

    let err = enroller
        .create_dms("not even base64 !!!", "dms-1")
        .await
        .unwrap_err();
    assert!(matches!(err, EnrollerError::InvalidCsr(_)));
}

#[tokio::test]
async fn test_duplicate_name_conflicts() {
    let (_, _, enroller) = setup();

    enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();
    let err = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_approve_signs_and_binds() {
    let (_, ca, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();
    let approved = enroller
        .update_dms_status(&dms.id, DmsStatus::Approved, vec![CA_NAME.to_string()])
        .await
        .unwrap();

    assert_eq!(approved.status, DmsStatus::Approved);
    assert!(!approved.serial_number.is_empty());
    assert_eq!(approved.authorized_cas, vec![CA_NAME.to_string()]);
    // Enriched from the CA on read.
    assert_eq!(approved.subject.common_name, "dms-1");
    assert!(approved.certificate_base64.is_some());

    let calls = ca.calls.lock().unwrap();
    assert!(calls
        .iter()
        .any(|c| c == &format!("sign:{}:dmsenroller", CA_NAME)));
}

#[tokio::test]
async fn test_approve_requires_authorized_ca() {
    let (store, _, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();
    let err = enroller
        .update_dms_status(&dms.id, DmsStatus::Approved, vec![])
        .await
        .unwrap_err();

    assert!(matches!(err, EnrollerError::InvalidApproveOp(_)));
    let after = store.select_by_id(&dms.id).await.unwrap();
    assert_eq!(after.status, DmsStatus::PendingApproval);
    assert!(after.authorized_cas.is_empty());
}

#[tokio::test]
async fn test_approve_ca_failure_leaves_pending() {
    let (store, ca, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();
    ca.fail_sign.store(true, Ordering::SeqCst);

    let err = enroller
        .update_dms_status(&dms.id, DmsStatus::Approved, vec![CA_NAME.to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

    let after = store.select_by_id(&dms.id).await.unwrap();
    assert_eq!(after.status, DmsStatus::PendingApproval);
    assert!(after.serial_number.is_empty());
    assert!(after.authorized_cas.is_empty());
}

#[tokio::test]
async fn test_lost_approve_commit_revokes_orphaned_serial() {
    let (store, ca, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();
    store.fail_approve_commit.store(true, Ordering::SeqCst);

    let err = enroller
        .update_dms_status(&dms.id, DmsStatus::Approved, vec![CA_NAME.to_string()])
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

    // The certificate was issued but the commit never landed, so the serial
    // must have been revoked again.
    assert_eq!(ca.revoked.lock().unwrap().len(), 1);
    let after = store.select_by_id(&dms.id).await.unwrap();
    assert_eq!(after.status, DmsStatus::PendingApproval);
}

#[tokio::test]
async fn test_deny_then_delete() {
    let (store, _, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();
    let denied = enroller
        .update_dms_status(&dms.id, DmsStatus::Denied, vec![])
        .await
        .unwrap();
    assert_eq!(denied.status, DmsStatus::Denied);

    enroller.delete_dms(&dms.id).await.unwrap();
    assert!(store.select_by_id(&dms.id).await.is_err());
    assert!(store
        .select_all_authorized_cas()
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_delete_gating() {
    let (store, _, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();

    let err = enroller.delete_dms(&dms.id).await.unwrap_err();
    assert!(matches!(err, EnrollerError::InvalidDeleteOp(_)));
    assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);

    enroller
        .update_dms_status(&dms.id, DmsStatus::Approved, vec![CA_NAME.to_string()])
        .await
        .unwrap();
    let err = enroller.delete_dms(&dms.id).await.unwrap_err();
    assert!(matches!(err, EnrollerError::InvalidDeleteOp(_)));
    assert!(store.select_by_id(&dms.id).await.is_ok());
}

#[tokio::test]
async fn test_revoke_propagates_to_ca() {
    let (store, ca, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();
    let approved = enroller
        .update_dms_status(&dms.id, DmsStatus::Approved, vec![CA_NAME.to_string()])
        .await
        .unwrap();

    let revoked = enroller
        .update_dms_status(&dms.id, DmsStatus::Revoked, vec![])
        .await
        .unwrap();
    assert_eq!(revoked.status, DmsStatus::Revoked);
    // Authorized CAs are preserved through revocation.
    assert_eq!(revoked.authorized_cas, vec![CA_NAME.to_string()]);

    let calls = ca.calls.lock().unwrap();
    assert!(calls.iter().any(|c| c
        == &format!(
            "revoke:{}:{}:dmsenroller",
            CA_NAME, approved.serial_number
        )));
    drop(calls);
    let after = store.select_by_id(&dms.id).await.unwrap();
    assert_eq!(after.serial_number, approved.serial_number);
}

#[tokio::test]
async fn test_revoke_ca_failure_keeps_approved() {
    let (store, ca, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();
    enroller
        .update_dms_status(&dms.id, DmsStatus::Approved, vec![CA_NAME.to_string()])
        .await
        .unwrap();

    ca.fail_revoke.store(true, Ordering::SeqCst);
    let err = enroller
        .update_dms_status(&dms.id, DmsStatus::Revoked, vec![])
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);

    // CA still believes the certificate is valid, so the record must too.
    let after = store.select_by_id(&dms.id).await.unwrap();
    assert_eq!(after.status, DmsStatus::Approved);
}

#[tokio::test]
async fn test_illegal_transitions_rejected() {
    let (_, _, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();

    // PENDING -> REVOKED is not a legal edge.
    let err = enroller
        .update_dms_status(&dms.id, DmsStatus::Revoked, vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, EnrollerError::InvalidRevokeOp(_)));

    let denied = enroller
        .update_dms_status(&dms.id, DmsStatus::Denied, vec![])
        .await
        .unwrap();
    assert_eq!(denied.status, DmsStatus::Denied);

    // DENIED is terminal apart from deletion.
    let err = enroller
        .update_dms_status(&dms.id, DmsStatus::Approved, vec![CA_NAME.to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, EnrollerError::InvalidApproveOp(_)));
}

#[tokio::test]
async fn test_form_generates_rsa_key_once() {
    let (_, _, enroller) = setup();

    let subject = DmsSubject {
        common_name: "dms-2".to_string(),
        country: "ES".to_string(),
        ..Default::default()
    };
    let key = KeyRequest {
        key_type: KeyType::Rsa,
        bits: 2048,
    };

    let (priv_key_b64, dms) = enroller
        .create_dms_form(subject.clone(), key.clone(), "dms-2")
        .await
        .unwrap();

    let key_pem = String::from_utf8(general_purpose::STANDARD.decode(priv_key_b64).unwrap()).unwrap();
    assert!(key_pem.contains("RSA PRIVATE KEY"));
    assert_eq!(dms.status, DmsStatus::PendingApproval);
    assert_eq!(dms.key_metadata.key_type, KeyType::Rsa);
    assert_eq!(dms.key_metadata.key_bits, 2048);

    // A second registration under the same name conflicts.
    let err = enroller
        .create_dms_form(subject, key, "dms-2")
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_form_rejects_weak_keys_before_side_effects() {
    let (store, _, enroller) = setup();

    for (key_type, bits) in [(KeyType::Rsa, 1024), (KeyType::Ec, 192)] {
        let err = enroller
            .create_dms_form(
                DmsSubject::default(),
                KeyRequest { key_type, bits },
                "dms-weak",
            )
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    assert!(store.select_all().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_get_certificate() {
    let (_, _, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();

    // No certificate while pending.
    let err = enroller.get_dms_certificate(&dms.id).await.unwrap_err();
    assert!(matches!(err, EnrollerError::GetCert(_)));

    enroller
        .update_dms_status(&dms.id, DmsStatus::Approved, vec![CA_NAME.to_string()])
        .await
        .unwrap();

    let cert_der = enroller.get_dms_certificate(&dms.id).await.unwrap();
    Certificate::from_der(&cert_der).unwrap();
    let identity = dms_enroller::csr::cert_identity(&cert_der).unwrap();
    assert_eq!(identity.subject.common_name, "dms-1");
}

#[tokio::test]
async fn test_listing_survives_enrichment_failure() {
    let (store, _, enroller) = setup();

    let dms = enroller
        .create_dms(&csr_base64("dms-1"), "dms-1")
        .await
        .unwrap();
    enroller
        .update_dms_status(&dms.id, DmsStatus::Approved, vec![CA_NAME.to_string()])
        .await
        .unwrap();

    // Point the record at a serial the CA has never heard of.
    store
        .update_status(&dms.id, DmsStatus::Approved, DmsStatus::Approved, "de-ad")
        .await
        .unwrap();

    let all = enroller.get_dmss().await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(all[0].subject.common_name.is_empty());
    assert!(all[0].certificate_base64.is_none());
}
