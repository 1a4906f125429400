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

//! EST-plane handlers: RFC 7030 media types over the adapter.
//!
//! Requests carry `application/pkcs10` bodies with base64 transfer encoding;
//! certificate responses are `application/pkcs7-mime; smime-type=certs-only`.
//! `serverkeygen` responds `multipart/mixed` with the PKCS#8 key part first,
//! per RFC 7030 section 4.4.2.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use der::Decode;
use x509_cert::Certificate;

use crate::auth::PeerCertificates;
use crate::error::{EnrollerError, Result};
use crate::pkcs7;
use crate::server::AppState;

const PKCS10: &str = "application/pkcs10";
const TRANSFER_ENCODING_HEADER: axum::http::HeaderName =
    axum::http::HeaderName::from_static("content-transfer-encoding");
const PKCS7_CERTS_ONLY: &str = "application/pkcs7-mime; smime-type=certs-only";
const MULTIPART_BOUNDARY: &str = "estServerKeyGenBoundary";

pub(super) async fn cacerts(State(state): State<AppState>) -> Result<Response> {
    let certs = state.est.cacerts("").await?;
    certs_only_response(&certs)
}

pub(super) async fn cacerts_labeled(
    State(state): State<AppState>,
    Path(aps): Path<String>,
) -> Result<Response> {
    let certs = state.est.cacerts(&aps).await?;
    certs_only_response(&certs)
}

pub(super) async fn simpleenroll(
    State(state): State<AppState>,
    Path(aps): Path<String>,
    peer: Option<Extension<PeerCertificates>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    require_pkcs10(&headers)?;
    let csr_der = pkcs7::decode_base64(&body)?;

    let cert_der = state
        .est
        .enroll(&aps, &csr_der, leaf(&peer))
        .await?;

    certs_only_response(&[decode_cert(&cert_der)?])
}

pub(super) async fn simplereenroll(
    State(state): State<AppState>,
    peer: Option<Extension<PeerCertificates>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    require_pkcs10(&headers)?;
    let csr_der = pkcs7::decode_base64(&body)?;

    let cert_der = state.est.reenroll(&csr_der, leaf(&peer)).await?;

    certs_only_response(&[decode_cert(&cert_der)?])
}

pub(super) async fn serverkeygen(
    State(state): State<AppState>,
    Path(aps): Path<String>,
    peer: Option<Extension<PeerCertificates>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    require_pkcs10(&headers)?;
    let csr_der = pkcs7::decode_base64(&body)?;

    let (cert_der, key_der) = state
        .est
        .serverkeygen(&aps, &csr_der, leaf(&peer))
        .await?;

    let certs_body = pkcs7::encode_certs_only_base64(&[decode_cert(&cert_der)?])?;
    let key_body = pkcs7::encode_base64_wrapped(&key_der, 64);

    let body = format!(
        "--{boundary}\r\n\
         Content-Type: application/pkcs8\r\n\
         Content-Transfer-Encoding: base64\r\n\r\n\
         {key}\r\n\
         --{boundary}\r\n\
         Content-Type: {certs_type}\r\n\
         Content-Transfer-Encoding: base64\r\n\r\n\
         {certs}\r\n\
         --{boundary}--\r\n",
        boundary = MULTIPART_BOUNDARY,
        key = key_body,
        certs_type = PKCS7_CERTS_ONLY,
        certs = certs_body,
    );

    Ok((
        [(
            CONTENT_TYPE,
            format!("multipart/mixed; boundary={}", MULTIPART_BOUNDARY),
        )],
        body,
    )
        .into_response())
}

pub(super) async fn csrattrs(State(state): State<AppState>) -> Result<Response> {
    csrattrs_common(&state, "").await
}

pub(super) async fn csrattrs_labeled(
    State(state): State<AppState>,
    Path(aps): Path<String>,
) -> Result<Response> {
    csrattrs_common(&state, &aps).await
}

async fn csrattrs_common(state: &AppState, aps: &str) -> Result<Response> {
    match state.est.csrattrs(aps).await? {
        Some(der) => Ok((
            [
                (CONTENT_TYPE, "application/csrattrs".to_string()),
                (TRANSFER_ENCODING_HEADER, "base64".to_string()),
            ],
            pkcs7::encode_base64_wrapped(&der, 64),
        )
            .into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

fn require_pkcs10(headers: &HeaderMap) -> Result<()> {
    let actual = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    // Parameters after the media type (charset etc.) are tolerated.
    if !actual.starts_with(PKCS10) {
        return Err(EnrollerError::incorrect_type(PKCS10, actual));
    }
    Ok(())
}

fn leaf<'a>(peer: &'a Option<Extension<PeerCertificates>>) -> Option<&'a [u8]> {
    peer.as_ref().and_then(|Extension(p)| p.leaf())
}

fn decode_cert(cert_der: &[u8]) -> Result<Certificate> {
    Certificate::from_der(cert_der)
        .map_err(|e| EnrollerError::GetCert(format!("issued certificate did not decode: {}", e)))
}

fn certs_only_response(certs: &[Certificate]) -> Result<Response> {
    let body = pkcs7::encode_certs_only_base64(certs)?;
    Ok((
        [
            (CONTENT_TYPE, PKCS7_CERTS_ONLY),
            (TRANSFER_ENCODING_HEADER, "base64"),
        ],
        body,
    )
        .into_response())
}
