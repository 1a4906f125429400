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

//! EST (RFC 7030) verbs over the CA client.
//!
//! The transport layer terminates TLS and hands the raw peer certificate to
//! this adapter; chain validation happened during the handshake. Re-enrollment
//! enforces identity invariance by comparing the raw DER of the subject Name
//! and of the SubjectAltName extension value, with no canonicalization: if the
//! bytes differ, the request is rejected.

use std::sync::Arc;

use async_trait::async_trait;
use x509_cert::Certificate;

use crate::ca::CaClient;
use crate::csr::{self, CertIdentity, ParsedCsr};
use crate::error::{EnrollerError, Result};
use crate::models::DmsStatus;
use crate::service::ENROLLER_PROFILE;
use crate::store::DmsStore;

/// EST operations exposed to the transport layer.
#[async_trait]
pub trait EstService: Send + Sync {
    /// CA certificates, filtered to the CA named by `aps` when non-empty.
    async fn cacerts(&self, aps: &str) -> Result<Vec<Certificate>>;

    /// Enroll a DER CSR under the CA named by `aps`. Returns the issued
    /// certificate DER.
    async fn enroll(&self, aps: &str, csr_der: &[u8], peer_cert_der: Option<&[u8]>)
        -> Result<Vec<u8>>;

    /// Re-enroll against the CA that issued the presented client certificate.
    async fn reenroll(&self, csr_der: &[u8], peer_cert_der: Option<&[u8]>) -> Result<Vec<u8>>;

    /// Enroll with a server-generated key. Returns the issued certificate DER
    /// and the new private key as PKCS#8 DER.
    async fn serverkeygen(
        &self,
        aps: &str,
        csr_der: &[u8],
        peer_cert_der: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Vec<u8>)>;

    /// CSR attributes. `None` means the server imposes no attributes.
    async fn csrattrs(&self, aps: &str) -> Result<Option<Vec<u8>>>;
}

/// EST adapter over the CA client and the DMS store.
pub struct EstAdapter {
    ca: Arc<dyn CaClient>,
    store: Arc<dyn DmsStore>,
}

impl EstAdapter {
    pub fn new(ca: Arc<dyn CaClient>, store: Arc<dyn DmsStore>) -> Self {
        Self { ca, store }
    }

    fn peer_identity(peer_cert_der: Option<&[u8]>) -> Result<CertIdentity> {
        let der = peer_cert_der.ok_or(EnrollerError::PeerCertificateMissing)?;
        csr::cert_identity(der)
    }

    /// The peer must act on behalf of an approved DMS that is authorized for
    /// the CA named by `aps`. The DMS is matched by its name against the
    /// peer certificate CN.
    async fn authorize_enroll(&self, aps: &str, peer: &CertIdentity) -> Result<()> {
        let cn = &peer.subject.common_name;
        if cn.is_empty() {
            return Err(EnrollerError::unauthorized(
                "client certificate has no common name",
            ));
        }

        let all = self.store.select_all().await?;
        let authorized = all.iter().any(|dms| {
            dms.name == *cn
                && dms.status == DmsStatus::Approved
                && dms.authorized_cas.iter().any(|ca| ca == aps)
        });

        if !authorized {
            return Err(EnrollerError::unauthorized(format!(
                "'{}' is not authorized for CA '{}'",
                cn, aps
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EstService for EstAdapter {
    async fn cacerts(&self, aps: &str) -> Result<Vec<Certificate>> {
        use der::Decode;

        let cas = self.ca.get_cas(ENROLLER_PROFILE).await?;
        let mut certs = Vec::new();
        for ca in cas {
            if !aps.is_empty() && ca.name != aps {
                continue;
            }
            let cert = Certificate::from_der(&ca.cert_der)
                .map_err(|e| EnrollerError::GetCert(format!("CA certificate did not decode: {}", e)))?;
            certs.push(cert);
        }
        Ok(certs)
    }

    async fn enroll(
        &self,
        aps: &str,
        csr_der: &[u8],
        peer_cert_der: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let peer = Self::peer_identity(peer_cert_der)?;
        self.authorize_enroll(aps, &peer).await?;

        let parsed = csr::parse_der(csr_der)?;
        self.ca
            .sign_certificate_request(aps, &parsed.der, ENROLLER_PROFILE, true)
            .await
    }

    async fn reenroll(&self, csr_der: &[u8], peer_cert_der: Option<&[u8]>) -> Result<Vec<u8>> {
        let peer = Self::peer_identity(peer_cert_der)?;
        let parsed = csr::parse_der(csr_der)?;

        check_identity_invariance(&parsed, &peer)?;

        if peer.issuer_common_name.is_empty() {
            return Err(EnrollerError::unauthorized(
                "client certificate issuer has no common name",
            ));
        }
        self.ca
            .sign_certificate_request(&peer.issuer_common_name, &parsed.der, ENROLLER_PROFILE, true)
            .await
    }

    async fn serverkeygen(
        &self,
        aps: &str,
        csr_der: &[u8],
        peer_cert_der: Option<&[u8]>,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let peer = Self::peer_identity(peer_cert_der)?;
        self.authorize_enroll(aps, &peer).await?;

        let parsed = csr::parse_der(csr_der)?;
        let (new_csr_der, private_key_der) = csr::regenerate_with_fresh_key(&parsed)?;

        let cert_der = self
            .ca
            .sign_certificate_request(aps, &new_csr_der, ENROLLER_PROFILE, true)
            .await?;

        Ok((cert_der, private_key_der))
    }

    async fn csrattrs(&self, _aps: &str) -> Result<Option<Vec<u8>>> {
        // No attribute requirements are imposed on clients.
        Ok(None)
    }
}

/// The re-enrollment rule: subject Name DER and SubjectAltName extension
/// bytes must be identical between the CSR and the presented certificate.
pub(crate) fn check_identity_invariance(parsed: &ParsedCsr, peer: &CertIdentity) -> Result<()> {
    if parsed.subject_der != peer.subject_der {
        return Err(EnrollerError::SubjectChanged);
    }
    if parsed.san_der != peer.san_der {
        return Err(EnrollerError::SubjectChanged);
    }
    Ok(())
}
