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

//! Error types for the DMS enrollment service.
//!
//! All fallible operations in the crate return [`Result`]. The taxonomy is
//! deliberately flat: the transport layer performs a single central mapping
//! from error variant to HTTP status via [`EnrollerError::status_code`].

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias using [`EnrollerError`].
pub type Result<T> = std::result::Result<T, EnrollerError>;

/// Errors that can occur during DMS enrollment operations.
#[derive(Debug, Error)]
pub enum EnrollerError {
    /// Input failed validation (bad key bits, unknown status value, ...).
    #[error("validation error: {0}")]
    Validation(String),

    /// DMS name was empty on creation.
    #[error("DMS name cannot be empty")]
    EmptyDmsName,

    /// Supplied CSR could not be decoded or parsed.
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Requested status transition is not allowed by the state machine.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Approval attempted from a non-pending state or without authorized CAs.
    #[error("invalid approve operation: {0}")]
    InvalidApproveOp(String),

    /// Revocation attempted from a non-approved state or without a serial.
    #[error("invalid revoke operation: {0}")]
    InvalidRevokeOp(String),

    /// Denial attempted from a non-pending state.
    #[error("invalid deny operation: {0}")]
    InvalidDenyOp(String),

    /// Deletion attempted while not DENIED or REVOKED.
    #[error("invalid delete operation: {0}")]
    InvalidDeleteOp(String),

    /// Referenced DMS does not exist.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Insert collided with an existing row (duplicate id or name).
    #[error("duplicate resource: {0}")]
    Duplicate(String),

    /// Request carried an unsupported media type.
    #[error("unsupported media type: expected '{expected}', got '{actual}'")]
    IncorrectType {
        /// Expected content-type.
        expected: String,
        /// Actual content-type received.
        actual: String,
    },

    /// Bearer token missing, malformed, expired or signed with the wrong key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No client certificate was presented on an mTLS-gated route.
    #[error("peer certificate missing from TLS session")]
    PeerCertificateMissing,

    /// Re-enrollment CSR does not match the presented client certificate.
    #[error("subject or SubjectAltName changed between certificate and CSR")]
    SubjectChanged,

    /// Issued certificate could not be retrieved or decoded.
    #[error("failed to fetch certificate: {0}")]
    GetCert(String),

    /// Outbound CA call failed; the upstream message is surfaced verbatim.
    #[error("CA client error: {0}")]
    CaClient(String),

    /// Storage engine failure.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration could not be read from the environment.
    #[error("configuration error: {0}")]
    Config(String),

    /// HTTP client error talking to a collaborator service.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Base64 decoding error.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// DER encoding/decoding error.
    #[error("DER error: {0}")]
    Der(#[from] der::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EnrollerError {
    /// Create a validation error with the given message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an invalid-CSR error with the given message.
    pub fn invalid_csr(msg: impl Into<String>) -> Self {
        Self::InvalidCsr(msg.into())
    }

    /// Create an invalid-operation error with the given message.
    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create a not-found error for the given id.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound(id.into())
    }

    /// Create a duplicate-resource error with the given message.
    pub fn duplicate(msg: impl Into<String>) -> Self {
        Self::Duplicate(msg.into())
    }

    /// Create an unauthorized error with the given message.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a CA client error with the given message.
    pub fn ca_client(msg: impl Into<String>) -> Self {
        Self::CaClient(msg.into())
    }

    /// Create a store error with the given message.
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create an incorrect-type error with expected and actual media types.
    pub fn incorrect_type(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::IncorrectType {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Map this error to the HTTP status code the transport layer emits.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_)
            | Self::EmptyDmsName
            | Self::InvalidCsr(_)
            | Self::InvalidOperation(_)
            | Self::InvalidApproveOp(_)
            | Self::InvalidRevokeOp(_)
            | Self::InvalidDenyOp(_)
            | Self::InvalidDeleteOp(_)
            | Self::SubjectChanged => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Duplicate(_) => StatusCode::CONFLICT,
            Self::IncorrectType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Unauthorized(_) | Self::PeerCertificateMissing => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns true if the error is an internal (5xx) failure whose message
    /// must be redacted from the response body.
    pub fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}
