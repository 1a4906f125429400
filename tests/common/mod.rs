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

//! Shared test doubles: an in-memory store with the same guard semantics as
//! the Postgres implementation, and a scripted CA backed by a real rcgen
//! issuer so issued certificates parse and verify like production ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls_pki_types::CertificateSigningRequestDer;

use dms_enroller::ca::{CaClient, CaInfo};
use dms_enroller::error::{EnrollerError, Result};
use dms_enroller::models::{format_serial, Dms, DmsStatus, DmsSubject, KeyRequest, KeyType};
use dms_enroller::store::DmsStore;

/// In-memory [`DmsStore`] with row-guard semantics.
#[derive(Default)]
pub struct MemStore {
    rows: Mutex<HashMap<String, Dms>>,
    pairs: Mutex<Vec<(String, String)>>,
    /// When set, `approve` fails after its guard check without mutating,
    /// simulating a lost commit.
    pub fail_approve_commit: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn load(&self, id: &str) -> Result<Dms> {
        let rows = self.rows.lock().unwrap();
        let mut dms = rows
            .get(id)
            .cloned()
            .ok_or_else(|| EnrollerError::not_found(id))?;
        dms.authorized_cas = self
            .pairs
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == id)
            .map(|(_, ca)| ca.clone())
            .collect();
        Ok(dms)
    }
}

#[async_trait]
impl DmsStore for MemStore {
    async fn insert(&self, dms: &Dms) -> Result<String> {
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&dms.id) || rows.values().any(|d| d.name == dms.name) {
            return Err(EnrollerError::duplicate(dms.name.clone()));
        }
        rows.insert(dms.id.clone(), dms.clone());
        Ok(dms.id.clone())
    }

    async fn select_all(&self) -> Result<Vec<Dms>> {
        let ids: Vec<String> = self.rows.lock().unwrap().keys().cloned().collect();
        ids.iter().map(|id| self.load(id)).collect()
    }

    async fn select_by_id(&self, id: &str) -> Result<Dms> {
        self.load(id)
    }

    async fn select_by_serial(&self, serial: &str) -> Result<Dms> {
        let id = self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|d| d.serial_number == serial)
            .map(|d| d.id.clone())
            .ok_or_else(|| EnrollerError::not_found(serial))?;
        self.load(&id)
    }

    async fn update_status(
        &self,
        id: &str,
        expected: DmsStatus,
        new_status: DmsStatus,
        serial: &str,
    ) -> Result<Dms> {
        {
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| EnrollerError::not_found(id))?;
            if row.status != expected {
                return Err(EnrollerError::invalid_operation(format!(
                    "no rows updated: DMS {} is not in status {}",
                    id, expected
                )));
            }
            row.status = new_status;
            row.serial_number = serial.to_string();
            row.modification_ts = chrono::Utc::now();
        }
        self.load(id)
    }

    async fn approve(&self, id: &str, serial: &str, authorized_cas: &[String]) -> Result<Dms> {
        {
            let mut rows = self.rows.lock().unwrap();
            let row = rows
                .get_mut(id)
                .ok_or_else(|| EnrollerError::not_found(id))?;
            if row.status != DmsStatus::PendingApproval {
                return Err(EnrollerError::invalid_operation(format!(
                    "no rows updated: DMS {} is not pending approval",
                    id
                )));
            }
            if self.fail_approve_commit.load(Ordering::SeqCst) {
                return Err(EnrollerError::store("commit failed"));
            }
            row.status = DmsStatus::Approved;
            row.serial_number = serial.to_string();
            row.modification_ts = chrono::Utc::now();
        }
        let mut pairs = self.pairs.lock().unwrap();
        for ca in authorized_cas {
            pairs.push((id.to_string(), ca.clone()));
        }
        drop(pairs);
        self.load(id)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.pairs.lock().unwrap().retain(|(d, _)| d != id);
        self.rows
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| EnrollerError::not_found(id))
    }

    async fn insert_authorized_cas(&self, dms_id: &str, ca_names: &[String]) -> Result<()> {
        let mut pairs = self.pairs.lock().unwrap();
        for ca in ca_names {
            pairs.push((dms_id.to_string(), ca.clone()));
        }
        Ok(())
    }

    async fn delete_authorized_cas(&self, dms_id: &str) -> Result<()> {
        self.pairs.lock().unwrap().retain(|(d, _)| d != dms_id);
        Ok(())
    }

    async fn select_authorized_cas(&self, dms_id: &str) -> Result<Vec<String>> {
        Ok(self
            .pairs
            .lock()
            .unwrap()
            .iter()
            .filter(|(d, _)| d == dms_id)
            .map(|(_, ca)| ca.clone())
            .collect())
    }

    async fn select_all_authorized_cas(&self) -> Result<Vec<(String, String)>> {
        Ok(self.pairs.lock().unwrap().clone())
    }
}

/// Scripted CA with a real rcgen issuer key.
pub struct StubCa {
    name: String,
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    counter: AtomicU8,
    issued: Mutex<HashMap<String, Vec<u8>>>,
    pub revoked: Mutex<Vec<String>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_sign: AtomicBool,
    pub fail_revoke: AtomicBool,
}

impl StubCa {
    pub fn new(name: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, name);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_cert = params.self_signed(&ca_key).unwrap();

        Self {
            name: name.to_string(),
            ca_cert,
            ca_key,
            counter: AtomicU8::new(0),
            issued: Mutex::new(HashMap::new()),
            revoked: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            fail_sign: AtomicBool::new(false),
            fail_revoke: AtomicBool::new(false),
        }
    }

    /// Issue a client certificate directly, bypassing the EST flow. Used to
    /// fabricate mTLS peers.
    pub fn issue_client_cert(&self, cn: &str, san: Option<&str>) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = match san {
            Some(dns) => CertificateParams::new(vec![dns.to_string()]).unwrap(),
            None => CertificateParams::default(),
        };
        params.distinguished_name.push(DnType::CommonName, cn);
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        cert.der().to_vec()
    }

    fn next_serial(&self) -> Vec<u8> {
        // Keep the first byte below 0x80 so the DER INTEGER has no sign pad.
        vec![0x1a, self.counter.fetch_add(1, Ordering::SeqCst) + 1]
    }
}

#[async_trait]
impl CaClient for StubCa {
    async fn get_cas(&self, profile: &str) -> Result<Vec<CaInfo>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("get_cas:{}", profile));
        Ok(vec![CaInfo {
            name: self.name.clone(),
            cert_der: self.ca_cert.der().to_vec(),
        }])
    }

    async fn get_cert(&self, ca_name: &str, serial: &str, profile: &str) -> Result<Vec<u8>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("get_cert:{}:{}:{}", ca_name, serial, profile));
        self.issued
            .lock()
            .unwrap()
            .get(serial)
            .cloned()
            .ok_or_else(|| EnrollerError::ca_client(format!("unknown serial {}", serial)))
    }

    async fn sign_certificate_request(
        &self,
        ca_name: &str,
        csr_der: &[u8],
        profile: &str,
        _sign_verbatim: bool,
    ) -> Result<Vec<u8>> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("sign:{}:{}", ca_name, profile));
        if self.fail_sign.load(Ordering::SeqCst) {
            return Err(EnrollerError::ca_client("sign rejected"));
        }

        let wrapped = CertificateSigningRequestDer::from(csr_der.to_vec());
        let csr = rcgen::CertificateSigningRequestParams::from_der(&wrapped)
            .map_err(|e| EnrollerError::ca_client(format!("bad CSR: {}", e)))?;

        let serial_bytes = self.next_serial();
        let mut params = csr.params;
        params.serial_number = Some(rcgen::SerialNumber::from(serial_bytes.clone()));

        let cert = params
            .signed_by(&csr.public_key, &self.ca_cert, &self.ca_key)
            .map_err(|e| EnrollerError::ca_client(format!("sign failed: {}", e)))?;

        let der = cert.der().to_vec();
        self.issued
            .lock()
            .unwrap()
            .insert(format_serial(&serial_bytes), der.clone());
        Ok(der)
    }

    async fn revoke_cert(&self, ca_name: &str, serial: &str, profile: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("revoke:{}:{}:{}", ca_name, serial, profile));
        if self.fail_revoke.load(Ordering::SeqCst) {
            return Err(EnrollerError::ca_client("revoke rejected"));
        }
        self.revoked.lock().unwrap().push(serial.to_string());
        Ok(())
    }
}

/// Base64 PEM CSR for a P-256 key with the given CN, as the admin plane
/// accepts it.
pub fn csr_base64(cn: &str) -> String {
    let generated = dms_enroller::csr::generate_csr(
        &DmsSubject {
            common_name: cn.to_string(),
            ..Default::default()
        },
        &KeyRequest {
            key_type: KeyType::Ec,
            bits: 256,
        },
    )
    .unwrap();
    general_purpose::STANDARD.encode(generated.csr_pem)
}

/// DER CSR with the given CN and optional dNSName SAN, as the EST plane
/// accepts it after transfer decoding.
pub fn csr_der(cn: &str, san: Option<&str>) -> Vec<u8> {
    let key = KeyPair::generate().unwrap();
    let mut params = match san {
        Some(dns) => CertificateParams::new(vec![dns.to_string()]).unwrap(),
        None => CertificateParams::default(),
    };
    params.distinguished_name.push(DnType::CommonName, cn);
    params.serialize_request(&key).unwrap().der().to_vec()
}
