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

//! Caller identity: Keycloak bearer tokens on the admin plane, client
//! certificates on the EST plane.
//!
//! The realm's RS256 public key is fetched from the identity provider and
//! cached with a short TTL; a stale or missing cache entry triggers a fetch
//! on the next verification.

use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::config::KeycloakConfig;
use crate::error::{EnrollerError, Result};

const KEY_CACHE_TTL: Duration = Duration::from_secs(300);

/// Peer certificate chain captured at TLS termination, DER-encoded, attached
/// to requests as an extension. The first entry is the leaf.
#[derive(Debug, Clone)]
pub struct PeerCertificates(pub Vec<Vec<u8>>);

impl PeerCertificates {
    pub fn leaf(&self) -> Option<&[u8]> {
        self.0.first().map(|c| c.as_slice())
    }
}

/// Roles granted by the realm.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RealmAccess {
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Token claims the service acts on.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub realm_access: RealmAccess,
}

impl Claims {
    /// Admin role grants select-all on listings.
    pub fn is_admin(&self) -> bool {
        self.realm_access.roles.iter().any(|r| r == "admin")
    }

    pub fn username(&self) -> &str {
        self.preferred_username.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Deserialize)]
struct RealmInfo {
    public_key: String,
}

struct CachedKey {
    key: DecodingKey,
    fetched_at: Instant,
}

/// RS256 bearer-token verifier against a Keycloak realm.
pub struct KeycloakVerifier {
    http: reqwest::Client,
    realm_url: String,
    cached: RwLock<Option<CachedKey>>,
}

impl KeycloakVerifier {
    pub fn from_config(config: &KeycloakConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(ca_file) = &config.ca {
            let pem = std::fs::read(ca_file)?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            http: builder.build()?,
            realm_url: config.realm_url(),
            cached: RwLock::new(None),
        })
    }

    /// Verify a bearer token and return its claims.
    pub async fn verify(&self, token: &str) -> Result<Claims> {
        {
            let cached = self.cached.read().await;
            if let Some(entry) = cached.as_ref() {
                if entry.fetched_at.elapsed() < KEY_CACHE_TTL {
                    return verify_with_key(token, &entry.key);
                }
            }
        }

        let key = self.fetch_realm_key().await?;
        let claims = verify_with_key(token, &key);
        *self.cached.write().await = Some(CachedKey {
            key,
            fetched_at: Instant::now(),
        });
        claims
    }

    async fn fetch_realm_key(&self) -> Result<DecodingKey> {
        let response = self
            .http
            .get(&self.realm_url)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| EnrollerError::unauthorized(format!("realm key fetch failed: {}", e)))?;
        let info: RealmInfo = response.json().await?;

        DecodingKey::from_rsa_pem(wrap_public_key_pem(&info.public_key).as_bytes())
            .map_err(|e| EnrollerError::unauthorized(format!("realm key did not parse: {}", e)))
    }
}

/// Verify a token against a known RS256 public key.
pub fn verify_with_key(token: &str, key: &DecodingKey) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_aud = false;

    jsonwebtoken::decode::<Claims>(token, key, &validation)
        .map(|data| data.claims)
        .map_err(|e| EnrollerError::unauthorized(format!("token rejected: {}", e)))
}

/// Keycloak serves the realm key as bare base64; wrap it into an SPKI PEM.
fn wrap_public_key_pem(raw: &str) -> String {
    let wrapped: Vec<&str> = raw
        .as_bytes()
        .chunks(64)
        .map(|c| std::str::from_utf8(c).unwrap_or_default())
        .collect();
    format!(
        "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
        wrapped.join("\n")
    )
}
