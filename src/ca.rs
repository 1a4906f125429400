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

//! Outbound client for the external CA.
//!
//! The CA owns key custody, signing and revocation; this module only consumes
//! its HTTP interface. Errors from the CA are surfaced verbatim to callers so
//! the enrollment service can decide how a failed side effect maps onto the
//! DMS state machine.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{EnrollerError, Result};

/// A CA known to the external authority: its name and certificate (DER).
#[derive(Debug, Clone)]
pub struct CaInfo {
    pub name: String,
    pub cert_der: Vec<u8>,
}

/// Contract against the external CA.
#[async_trait]
pub trait CaClient: Send + Sync {
    /// List CAs registered under the given profile.
    async fn get_cas(&self, profile: &str) -> Result<Vec<CaInfo>>;

    /// Fetch an issued certificate (DER) by CA name and grouped serial.
    async fn get_cert(&self, ca_name: &str, serial: &str, profile: &str) -> Result<Vec<u8>>;

    /// Sign a DER CSR under the named CA. Returns the issued certificate DER.
    async fn sign_certificate_request(
        &self,
        ca_name: &str,
        csr_der: &[u8],
        profile: &str,
        sign_verbatim: bool,
    ) -> Result<Vec<u8>>;

    /// Revoke a certificate by CA name and grouped serial.
    async fn revoke_cert(&self, ca_name: &str, serial: &str, profile: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct CaEntry {
    name: String,
    crt: String,
}

#[derive(Debug, Deserialize)]
struct CertResponse {
    crt: String,
}

#[derive(Debug, Serialize)]
struct SignRequest<'a> {
    csr: String,
    sign_verbatim: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    ocsp_server: Option<&'a str>,
}

/// HTTP client for the Lamassu CA service.
pub struct LamassuCaClient {
    http: reqwest::Client,
    base_url: String,
    ocsp_server: Option<String>,
}

impl LamassuCaClient {
    /// Build the client from service configuration: optional CA trust root
    /// plus the service's own certificate and key as the mTLS identity.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();

        if let Some(ca_file) = &config.lamassu_ca_cert_file {
            let pem = std::fs::read(ca_file)?;
            let cert = reqwest::Certificate::from_pem(&pem)?;
            builder = builder.add_root_certificate(cert);
        }

        let mut identity_pem = std::fs::read(&config.cert_file)?;
        identity_pem.extend_from_slice(&std::fs::read(&config.key_file)?);
        builder = builder.identity(reqwest::Identity::from_pem(&identity_pem)?);

        let ocsp_server = if config.ocsp_server.is_empty() {
            None
        } else {
            Some(config.ocsp_server.clone())
        };

        Ok(Self {
            http: builder.build()?,
            base_url: config.lamassu_ca_address.trim_end_matches('/').to_string(),
            ocsp_server,
        })
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(EnrollerError::ca_client(format!(
            "CA returned {}: {}",
            status, body
        )))
    }
}

#[async_trait]
impl CaClient for LamassuCaClient {
    async fn get_cas(&self, profile: &str) -> Result<Vec<CaInfo>> {
        let url = format!("{}/v1/{}", self.base_url, profile);
        let response = self.http.get(&url).send().await?;
        let entries: Vec<CaEntry> = self.check(response).await?.json().await?;

        entries
            .into_iter()
            .map(|entry| {
                Ok(CaInfo {
                    name: entry.name,
                    cert_der: general_purpose::STANDARD.decode(entry.crt)?,
                })
            })
            .collect()
    }

    async fn get_cert(&self, ca_name: &str, serial: &str, profile: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/v1/{}/{}/cert/{}",
            self.base_url, profile, ca_name, serial
        );
        let response = self.http.get(&url).send().await?;
        let body: CertResponse = self.check(response).await?.json().await?;
        Ok(general_purpose::STANDARD.decode(body.crt)?)
    }

    async fn sign_certificate_request(
        &self,
        ca_name: &str,
        csr_der: &[u8],
        profile: &str,
        sign_verbatim: bool,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/v1/{}/{}/sign", self.base_url, profile, ca_name);
        let request = SignRequest {
            csr: general_purpose::STANDARD.encode(csr_der),
            sign_verbatim,
            ocsp_server: self.ocsp_server.as_deref(),
        };
        let response = self.http.post(&url).json(&request).send().await?;
        let body: CertResponse = self.check(response).await?.json().await?;
        Ok(general_purpose::STANDARD.decode(body.crt)?)
    }

    async fn revoke_cert(&self, ca_name: &str, serial: &str, profile: &str) -> Result<()> {
        let url = format!(
            "{}/v1/{}/{}/cert/{}",
            self.base_url, profile, ca_name, serial
        );
        let response = self.http.delete(&url).send().await?;
        self.check(response).await?;
        Ok(())
    }
}
