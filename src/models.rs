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

//! Domain types for the DMS enrollment workflow.
//!
//! The central type is [`Dms`], the record a Device Management System leaves
//! behind from registration through revocation. Status is modeled as a tagged
//! variant with explicit transition checks so illegal pairs are refused before
//! any side effect runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EnrollerError, Result};

/// Lifecycle status of a DMS registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DmsStatus {
    /// Created, waiting for an administrator decision.
    ///
    /// The legacy misspelling `PENDIG_APPROVAL` is accepted on read for
    /// compatibility with rows written by older deployments.
    #[serde(rename = "PENDING_APPROVAL", alias = "PENDIG_APPROVAL")]
    PendingApproval,
    /// Approved and holding a certificate issued by an authorized CA.
    #[serde(rename = "APPROVED")]
    Approved,
    /// Rejected by an administrator; terminal apart from deletion.
    #[serde(rename = "DENIED")]
    Denied,
    /// Certificate revoked at the CA; terminal apart from deletion.
    #[serde(rename = "REVOKED")]
    Revoked,
}

impl DmsStatus {
    /// Canonical wire/storage spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "PENDING_APPROVAL",
            Self::Approved => "APPROVED",
            Self::Denied => "DENIED",
            Self::Revoked => "REVOKED",
        }
    }

    /// Parse a status string, accepting the legacy misspelled pending value.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "PENDING_APPROVAL" | "PENDIG_APPROVAL" => Ok(Self::PendingApproval),
            "APPROVED" => Ok(Self::Approved),
            "DENIED" => Ok(Self::Denied),
            "REVOKED" => Ok(Self::Revoked),
            other => Err(EnrollerError::validation(format!(
                "unknown DMS status '{}'",
                other
            ))),
        }
    }

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition(&self, to: DmsStatus) -> bool {
        matches!(
            (self, to),
            (Self::PendingApproval, Self::Approved)
                | (Self::PendingApproval, Self::Denied)
                | (Self::Approved, Self::Revoked)
        )
    }

    /// Whether a DMS in this status may be deleted.
    pub fn deletable(&self) -> bool {
        matches!(self, Self::Denied | Self::Revoked)
    }
}

impl std::fmt::Display for DmsStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Public key algorithm carried by a CSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "EC")]
    Ec,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl KeyType {
    /// Parse a key type string from a request or a store row.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "RSA" => Ok(Self::Rsa),
            "EC" => Ok(Self::Ec),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(EnrollerError::validation(format!(
                "unknown key type '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsa => "RSA",
            Self::Ec => "EC",
            Self::Unknown => "UNKNOWN",
        }
    }
}

/// Coarse strength label derived from key type and bit length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStrength {
    #[serde(rename = "low")]
    Low,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "high")]
    High,
}

impl KeyStrength {
    /// Derive the strength label from the classification table:
    /// RSA `< 2048 / [2048,3072) / >= 3072` and EC `< 224 / [224,256) / >= 256`
    /// map to low / medium / high respectively.
    pub fn classify(key_type: KeyType, bits: i32) -> Self {
        match key_type {
            KeyType::Rsa => {
                if bits < 2048 {
                    Self::Low
                } else if bits < 3072 {
                    Self::Medium
                } else {
                    Self::High
                }
            }
            KeyType::Ec => {
                if bits < 224 {
                    Self::Low
                } else if bits < 256 {
                    Self::Medium
                } else {
                    Self::High
                }
            }
            KeyType::Unknown => Self::Low,
        }
    }
}

/// Key algorithm metadata derived from a CSR public key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMetadata {
    #[serde(rename = "type")]
    pub key_type: KeyType,
    #[serde(rename = "bits")]
    pub key_bits: i32,
    #[serde(rename = "strength")]
    pub key_strength: KeyStrength,
}

impl KeyMetadata {
    /// Build metadata for a classified key, deriving the strength label.
    pub fn new(key_type: KeyType, key_bits: i32) -> Self {
        Self {
            key_type,
            key_bits,
            key_strength: KeyStrength::classify(key_type, key_bits),
        }
    }

    /// Metadata for a public key algorithm the service does not classify.
    pub fn unknown() -> Self {
        Self {
            key_type: KeyType::Unknown,
            key_bits: -1,
            key_strength: KeyStrength::Low,
        }
    }
}

/// Requested key parameters for server-side generation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyRequest {
    #[serde(rename = "type")]
    pub key_type: KeyType,
    pub bits: i32,
}

impl KeyRequest {
    /// Validate the requested parameters before any key material is produced.
    ///
    /// RSA requires `bits >= 2048` and a multiple of 1024; EC accepts the
    /// NIST field sizes 224, 256, 384 and 521.
    pub fn validate(&self) -> Result<()> {
        match self.key_type {
            KeyType::Rsa => {
                if self.bits < 2048 || self.bits % 1024 != 0 {
                    return Err(EnrollerError::validation(format!(
                        "invalid RSA key length {}: must be >= 2048 and a multiple of 1024",
                        self.bits
                    )));
                }
            }
            KeyType::Ec => {
                if !matches!(self.bits, 224 | 256 | 384 | 521) {
                    return Err(EnrollerError::validation(format!(
                        "invalid EC key length {}: must be one of 224, 256, 384, 521",
                        self.bits
                    )));
                }
            }
            KeyType::Unknown => {
                return Err(EnrollerError::validation(
                    "key type must be RSA or EC for server-side generation",
                ));
            }
        }
        Ok(())
    }
}

/// X.501 subject fields carried by a CSR or certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmsSubject {
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub organization: String,
    #[serde(default)]
    pub organization_unit: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub locality: String,
}

/// A Device Management System registration record.
#[derive(Debug, Clone, Serialize)]
pub struct Dms {
    pub id: String,
    pub name: String,
    pub status: DmsStatus,
    /// Hyphen-grouped hexadecimal certificate serial; empty until approved.
    pub serial_number: String,
    pub key_metadata: KeyMetadata,
    /// Populated lazily from the CA on read; never persisted.
    pub subject: DmsSubject,
    #[serde(rename = "csr")]
    pub csr_base64: String,
    /// Populated lazily from the CA on read; never persisted.
    #[serde(rename = "certificate", skip_serializing_if = "Option::is_none")]
    pub certificate_base64: Option<String>,
    #[serde(default)]
    pub authorized_cas: Vec<String>,
    #[serde(rename = "creation_timestamp")]
    pub creation_ts: DateTime<Utc>,
    #[serde(rename = "modification_timestamp")]
    pub modification_ts: DateTime<Utc>,
}

impl Dms {
    /// Create a fresh pending registration with store-assigned timestamps.
    pub fn pending(id: String, name: String, key_metadata: KeyMetadata, csr_base64: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            status: DmsStatus::PendingApproval,
            serial_number: String::new(),
            key_metadata,
            subject: DmsSubject::default(),
            csr_base64,
            certificate_base64: None,
            authorized_cas: Vec::new(),
            creation_ts: now,
            modification_ts: now,
        }
    }
}

/// Format raw big-endian serial bytes as lowercase hyphen-grouped hex pairs.
///
/// An empty input yields an empty string; a single byte is zero-padded so the
/// grouping is always of even-length pairs.
pub fn format_serial(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join("-")
}

/// Parse a grouped serial back into raw bytes, accepting `:` or `-` between
/// pairs (both spellings occur in stored rows and CA responses).
pub fn parse_serial(serial: &str) -> Result<Vec<u8>> {
    let hex: String = serial.chars().filter(|c| *c != ':' && *c != '-').collect();
    if hex.len() % 2 != 0 {
        return Err(EnrollerError::validation(format!(
            "odd-length serial number '{}'",
            serial
        )));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| {
                EnrollerError::validation(format!("invalid serial number '{}'", serial))
            })
        })
        .collect()
}
