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

//! The enrollment business core: DMS lifecycle over store + CA client.
//!
//! Transition ordering is chosen so that a failed CA side effect never leaves
//! the record in a state that contradicts the CA's view:
//!
//! - approve signs first and commits the status/serial/CA bindings in one
//!   store transaction afterwards; a lost commit triggers a best-effort
//!   revoke of the just-issued serial;
//! - revoke calls the CA first and only then writes the status, so a CA
//!   failure leaves the DMS `APPROVED` while the certificate is still valid.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use der::Decode;
use x509_cert::Certificate;

use crate::ca::CaClient;
use crate::csr;
use crate::error::{EnrollerError, Result};
use crate::models::{format_serial, Dms, DmsStatus, DmsSubject, KeyRequest};
use crate::store::DmsStore;

/// Signing profile under which this service operates at the CA.
pub const ENROLLER_PROFILE: &str = "dmsenroller";

/// The DMS enrollment operations exposed to the transport layer. Logging and
/// metrics decorators wrap this trait without touching domain payloads.
#[async_trait]
pub trait DmsService: Send + Sync {
    /// Register a DMS from a client-supplied base64 PEM CSR.
    async fn create_dms(&self, csr_base64: &str, name: &str) -> Result<Dms>;

    /// Register a DMS, generating the key pair server-side. Returns the
    /// base64 PEM private key (exactly once) and the stored record.
    async fn create_dms_form(
        &self,
        subject: DmsSubject,
        key: KeyRequest,
        name: &str,
    ) -> Result<(String, Dms)>;

    /// Drive the status state machine; `authorized_cas` only matters on the
    /// transition to `APPROVED`.
    async fn update_dms_status(
        &self,
        id: &str,
        new_status: DmsStatus,
        authorized_cas: Vec<String>,
    ) -> Result<Dms>;

    /// Delete a DMS; only legal from `DENIED` or `REVOKED`.
    async fn delete_dms(&self, id: &str) -> Result<()>;

    /// All DMS records, subject and certificate enriched best-effort.
    async fn get_dmss(&self) -> Result<Vec<Dms>>;

    /// One DMS record, enriched best-effort.
    async fn get_dms_by_id(&self, id: &str) -> Result<Dms>;

    /// The issued certificate (DER) for an approved DMS.
    async fn get_dms_certificate(&self, id: &str) -> Result<Vec<u8>>;
}

/// Core implementation over a store and a CA client.
pub struct Enroller {
    store: Arc<dyn DmsStore>,
    ca: Arc<dyn CaClient>,
}

impl Enroller {
    pub fn new(store: Arc<dyn DmsStore>, ca: Arc<dyn CaClient>) -> Self {
        Self { store, ca }
    }

    /// Fill in subject and certificate from the CA. Failures are logged and
    /// leave the fields empty; a broken CA must not break listings.
    async fn enrich(&self, dms: &mut Dms) {
        if dms.serial_number.is_empty() {
            return;
        }
        let Some(ca_name) = dms.authorized_cas.first() else {
            return;
        };
        match self
            .ca
            .get_cert(ca_name, &dms.serial_number, ENROLLER_PROFILE)
            .await
        {
            Ok(cert_der) => match csr::cert_identity(&cert_der) {
                Ok(identity) => {
                    dms.subject = identity.subject;
                    dms.certificate_base64 = Some(
                        general_purpose::STANDARD
                            .encode(pem::encode(&pem::Pem::new("CERTIFICATE", cert_der))),
                    );
                }
                Err(e) => {
                    tracing::warn!(id = %dms.id, error = %e, "issued certificate did not decode");
                }
            },
            Err(e) => {
                tracing::warn!(id = %dms.id, error = %e, "certificate enrichment failed");
            }
        }
    }

    async fn approve(&self, id: &str, authorized_cas: Vec<String>) -> Result<Dms> {
        let dms = self.store.select_by_id(id).await?;
        if dms.status != DmsStatus::PendingApproval {
            return Err(EnrollerError::InvalidApproveOp(format!(
                "DMS {} is {}, not PENDING_APPROVAL",
                id, dms.status
            )));
        }
        let Some(ca_name) = authorized_cas.first().cloned() else {
            return Err(EnrollerError::InvalidApproveOp(
                "approval requires at least one authorized CA".to_string(),
            ));
        };

        let parsed = csr::parse_base64_pem(&dms.csr_base64)?;
        let cert_der = self
            .ca
            .sign_certificate_request(&ca_name, &parsed.der, ENROLLER_PROFILE, true)
            .await?;

        let cert = Certificate::from_der(&cert_der)
            .map_err(|e| EnrollerError::ca_client(format!("issued certificate did not decode: {}", e)))?;
        let serial = format_serial(cert.tbs_certificate.serial_number.as_bytes());

        match self.store.approve(id, &serial, &authorized_cas).await {
            Ok(mut updated) => {
                self.enrich(&mut updated).await;
                Ok(updated)
            }
            Err(store_err) => {
                // The certificate exists at the CA but the approval did not
                // commit. Revoke it so no valid certificate is left dangling.
                if let Err(revoke_err) = self
                    .ca
                    .revoke_cert(&ca_name, &serial, ENROLLER_PROFILE)
                    .await
                {
                    tracing::error!(
                        id = %id,
                        serial = %serial,
                        error = %revoke_err,
                        "orphaned certificate could not be revoked after failed approval commit"
                    );
                }
                Err(store_err)
            }
        }
    }

    async fn deny(&self, id: &str) -> Result<Dms> {
        let dms = self.store.select_by_id(id).await?;
        if dms.status != DmsStatus::PendingApproval {
            return Err(EnrollerError::InvalidDenyOp(format!(
                "DMS {} is {}, not PENDING_APPROVAL",
                id, dms.status
            )));
        }
        self.store
            .update_status(id, DmsStatus::PendingApproval, DmsStatus::Denied, "")
            .await
    }

    async fn revoke(&self, id: &str) -> Result<Dms> {
        let dms = self.store.select_by_id(id).await?;
        if dms.status != DmsStatus::Approved || dms.serial_number.is_empty() {
            return Err(EnrollerError::InvalidRevokeOp(format!(
                "DMS {} is {} (serial '{}')",
                id, dms.status, dms.serial_number
            )));
        }
        let Some(ca_name) = dms.authorized_cas.first() else {
            return Err(EnrollerError::InvalidRevokeOp(format!(
                "DMS {} has no authorized CA to revoke against",
                id
            )));
        };

        // CA first; on failure the record stays APPROVED and the certificate
        // remains valid, which is the consistent pair.
        self.ca
            .revoke_cert(ca_name, &dms.serial_number, ENROLLER_PROFILE)
            .await?;

        self.store
            .update_status(id, DmsStatus::Approved, DmsStatus::Revoked, &dms.serial_number)
            .await
    }
}

#[async_trait]
impl DmsService for Enroller {
    async fn create_dms(&self, csr_base64: &str, name: &str) -> Result<Dms> {
        if name.trim().is_empty() {
            return Err(EnrollerError::EmptyDmsName);
        }

        let parsed = csr::parse_base64_pem(csr_base64)?;
        let id = uuid::Uuid::new_v4().to_string();
        let dms = Dms::pending(id.clone(), name.to_string(), parsed.key, csr_base64.to_string());

        self.store.insert(&dms).await?;
        self.store.select_by_id(&id).await
    }

    async fn create_dms_form(
        &self,
        subject: DmsSubject,
        key: KeyRequest,
        name: &str,
    ) -> Result<(String, Dms)> {
        if name.trim().is_empty() {
            return Err(EnrollerError::EmptyDmsName);
        }

        let generated = csr::generate_csr(&subject, &key)?;
        let csr_base64 = general_purpose::STANDARD.encode(&generated.csr_pem);
        let dms = self.create_dms(&csr_base64, name).await?;

        // The key is encoded once for the response and not retained.
        let key_base64 = general_purpose::STANDARD.encode(&generated.private_key_pem);
        Ok((key_base64, dms))
    }

    async fn update_dms_status(
        &self,
        id: &str,
        new_status: DmsStatus,
        authorized_cas: Vec<String>,
    ) -> Result<Dms> {
        match new_status {
            DmsStatus::Approved => self.approve(id, authorized_cas).await,
            DmsStatus::Denied => self.deny(id).await,
            DmsStatus::Revoked => self.revoke(id).await,
            DmsStatus::PendingApproval => Err(EnrollerError::invalid_operation(
                "cannot transition back to PENDING_APPROVAL",
            )),
        }
    }

    async fn delete_dms(&self, id: &str) -> Result<()> {
        let dms = self.store.select_by_id(id).await?;
        if !dms.status.deletable() {
            return Err(EnrollerError::InvalidDeleteOp(format!(
                "DMS {} is {}; only DENIED or REVOKED can be deleted",
                id, dms.status
            )));
        }
        self.store.delete(id).await
    }

    async fn get_dmss(&self) -> Result<Vec<Dms>> {
        let mut all = self.store.select_all().await?;
        for dms in &mut all {
            self.enrich(dms).await;
        }
        Ok(all)
    }

    async fn get_dms_by_id(&self, id: &str) -> Result<Dms> {
        let mut dms = self.store.select_by_id(id).await?;
        self.enrich(&mut dms).await;
        Ok(dms)
    }

    async fn get_dms_certificate(&self, id: &str) -> Result<Vec<u8>> {
        let dms = self.store.select_by_id(id).await?;
        if dms.serial_number.is_empty() {
            return Err(EnrollerError::GetCert(format!(
                "DMS {} has no issued certificate",
                id
            )));
        }
        let Some(ca_name) = dms.authorized_cas.first() else {
            return Err(EnrollerError::GetCert(format!(
                "DMS {} has no authorized CA",
                id
            )));
        };

        let cert_der = self
            .ca
            .get_cert(ca_name, &dms.serial_number, ENROLLER_PROFILE)
            .await
            .map_err(|e| EnrollerError::GetCert(e.to_string()))?;

        // Validate the payload decodes before handing it out.
        Certificate::from_der(&cert_der)
            .map_err(|e| EnrollerError::GetCert(format!("certificate did not decode: {}", e)))?;

        Ok(cert_der)
    }
}
