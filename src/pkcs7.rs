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

//! PKCS#7/CMS certs-only encoding for EST responses.
//!
//! RFC 7030 carries certificates as a degenerate CMS SignedData: no signers,
//! no digest algorithms, just a certificate set. This module builds and parses
//! that structure and handles the base64 Content-Transfer-Encoding the
//! protocol mandates.

use base64::prelude::*;
use cms::cert::CertificateChoices;
use cms::content_info::{CmsVersion, ContentInfo};
use cms::signed_data::{CertificateSet, EncapsulatedContentInfo, SignedData, SignerInfos};
use der::asn1::{ObjectIdentifier, SetOfVec};
use der::{Any, Decode, Encode};
use x509_cert::Certificate;

use crate::error::{EnrollerError, Result};

const OID_ID_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.1");
const OID_ID_SIGNED_DATA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.7.2");

/// Build a certs-only SignedData wrapping the given certificates.
///
/// Returns the DER of the outer ContentInfo.
pub fn encode_certs_only(certs: &[Certificate]) -> Result<Vec<u8>> {
    let mut cert_set = SetOfVec::new();
    for cert in certs {
        cert_set
            .insert(CertificateChoices::Certificate(cert.clone()))
            .map_err(|e| EnrollerError::GetCert(format!("certificate set build failed: {}", e)))?;
    }

    let signed_data = SignedData {
        version: CmsVersion::V1,
        digest_algorithms: SetOfVec::new(),
        encap_content_info: EncapsulatedContentInfo {
            econtent_type: OID_ID_DATA,
            econtent: None,
        },
        certificates: Some(CertificateSet(cert_set)),
        crls: None,
        signer_infos: SignerInfos(SetOfVec::new()),
    };

    let content_info = ContentInfo {
        content_type: OID_ID_SIGNED_DATA,
        content: Any::encode_from(&signed_data)
            .map_err(|e| EnrollerError::GetCert(format!("SignedData encode failed: {}", e)))?,
    };

    content_info
        .to_der()
        .map_err(|e| EnrollerError::GetCert(format!("ContentInfo encode failed: {}", e)))
}

/// Encode certificates as the base64 transfer-encoded certs-only body EST
/// responses carry, wrapped at 64 columns.
pub fn encode_certs_only_base64(certs: &[Certificate]) -> Result<String> {
    let der = encode_certs_only(certs)?;
    Ok(encode_base64_wrapped(&der, 64))
}

/// Parse a base64 transfer-encoded certs-only body into certificates.
pub fn parse_certs_only(body: &[u8]) -> Result<Vec<Certificate>> {
    let der_bytes = decode_base64(body)?;

    let content_info = ContentInfo::from_der(&der_bytes)
        .map_err(|e| EnrollerError::GetCert(format!("ContentInfo decode failed: {}", e)))?;

    if content_info.content_type != OID_ID_SIGNED_DATA {
        return Err(EnrollerError::GetCert(format!(
            "expected SignedData content type, got {}",
            content_info.content_type
        )));
    }

    let content = content_info
        .content
        .to_der()
        .map_err(|e| EnrollerError::GetCert(format!("content re-encode failed: {}", e)))?;
    let signed_data = SignedData::from_der(&content)
        .map_err(|e| EnrollerError::GetCert(format!("SignedData decode failed: {}", e)))?;

    let Some(cert_set) = &signed_data.certificates else {
        return Ok(Vec::new());
    };

    let mut certificates = Vec::new();
    for choice in cert_set.0.iter() {
        // Only plain X.509 entries are surfaced; attribute certificates and
        // the obsolete extended form are skipped.
        let der = choice
            .to_der()
            .map_err(|e| EnrollerError::GetCert(format!("certificate re-encode failed: {}", e)))?;
        match Certificate::from_der(&der) {
            Ok(cert) => certificates.push(cert),
            Err(e) => {
                tracing::warn!(error = %e, "skipping non-X.509 entry in certs-only payload");
            }
        }
    }

    Ok(certificates)
}

/// Decode base64 data, tolerating any whitespace the transfer encoding added.
pub fn decode_base64(data: &[u8]) -> Result<Vec<u8>> {
    let cleaned: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    BASE64_STANDARD.decode(&cleaned).map_err(EnrollerError::Base64)
}

/// Encode DER data to base64 with line wrapping, per the EST transfer
/// encoding convention.
pub fn encode_base64_wrapped(data: &[u8], line_length: usize) -> String {
    let encoded = BASE64_STANDARD.encode(data);

    encoded
        .as_bytes()
        .chunks(line_length)
        .map(|chunk| std::str::from_utf8(chunk).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\r\n")
}
