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

//! PKCS#10 parsing, public-key classification, and CSR generation.
//!
//! Parsing goes through `x509-cert`/`der`; generation uses `rcgen`, with the
//! `rsa` crate supplying RSA key material (rcgen itself only generates EC and
//! Ed25519 keys). Subject and SubjectAltName bytes are kept in raw DER form so
//! the re-enrollment comparison can be done without canonicalization.

use base64::{engine::general_purpose, Engine as _};
use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use rcgen::{CertificateParams, DnType, KeyPair, SanType};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::EncodePrivateKey;
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use x509_cert::attr::AttributeTypeAndValue;
use x509_cert::ext::pkix::name::GeneralName;
use x509_cert::ext::pkix::SubjectAltName;
use x509_cert::ext::Extensions;
use x509_cert::name::Name;
use x509_cert::request::CertReq;
use x509_cert::Certificate;

use crate::error::{EnrollerError, Result};
use crate::models::{DmsSubject, KeyMetadata, KeyRequest, KeyType};

const OID_RSA_ENCRYPTION: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_SECP224R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.33");
const OID_PRIME256V1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");
const OID_SECP521R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.35");

const OID_EXTENSION_REQUEST: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.9.14");
const OID_SUBJECT_ALT_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.17");

const OID_COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
const OID_COUNTRY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.6");
const OID_LOCALITY: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.7");
const OID_STATE: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.8");
const OID_ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");
const OID_ORGANIZATIONAL_UNIT: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.11");

/// A decoded certification request with the pieces the service acts on.
#[derive(Debug, Clone)]
pub struct ParsedCsr {
    /// Raw DER of the full CertificationRequest.
    pub der: Vec<u8>,
    /// Subject fields, decoded to strings.
    pub subject: DmsSubject,
    /// DER encoding of the subject Name, verbatim.
    pub subject_der: Vec<u8>,
    /// Raw `extnValue` bytes of the SubjectAltName extension request, if any.
    pub san_der: Option<Vec<u8>>,
    /// Classified public-key metadata.
    pub key: KeyMetadata,
}

impl ParsedCsr {
    /// Re-encode as PEM (`CERTIFICATE REQUEST` block).
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE REQUEST", self.der.clone()))
    }
}

/// Identity facts extracted from an X.509 certificate, used to authenticate
/// EST peers and to enforce re-enrollment identity invariance.
#[derive(Debug, Clone)]
pub struct CertIdentity {
    /// Subject fields, decoded to strings.
    pub subject: DmsSubject,
    /// DER encoding of the subject Name, verbatim.
    pub subject_der: Vec<u8>,
    /// Raw `extnValue` bytes of the SubjectAltName extension, if present.
    pub san_der: Option<Vec<u8>>,
    /// CN of the issuer Name.
    pub issuer_common_name: String,
}

/// Output of server-side key + CSR generation. The private key appears here
/// and nowhere else; callers must hand it to the requester and drop it.
pub struct GeneratedCsr {
    pub csr_pem: String,
    pub private_key_pem: String,
}

// The key must stay out of logs and error output, so Debug redacts it.
impl std::fmt::Debug for GeneratedCsr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedCsr")
            .field("csr_pem", &self.csr_pem)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// Parse a base64-encoded PEM CSR (the admin-plane wire form).
pub fn parse_base64_pem(csr_b64: &str) -> Result<ParsedCsr> {
    let pem_bytes = general_purpose::STANDARD
        .decode(csr_b64.trim())
        .map_err(|e| EnrollerError::invalid_csr(format!("base64 decode failed: {}", e)))?;
    let pem_text = String::from_utf8(pem_bytes)
        .map_err(|_| EnrollerError::invalid_csr("CSR PEM is not valid UTF-8"))?;
    parse_pem(&pem_text)
}

/// Parse a PEM-encoded CSR.
pub fn parse_pem(pem_text: &str) -> Result<ParsedCsr> {
    let block = pem::parse(pem_text)
        .map_err(|e| EnrollerError::invalid_csr(format!("PEM decode failed: {}", e)))?;
    if !block.tag().contains("CERTIFICATE REQUEST") {
        return Err(EnrollerError::invalid_csr(format!(
            "unexpected PEM block '{}'",
            block.tag()
        )));
    }
    parse_der(block.contents())
}

/// Parse a DER-encoded CSR (the EST wire form, after base64 transfer decode).
pub fn parse_der(der_bytes: &[u8]) -> Result<ParsedCsr> {
    let req = CertReq::from_der(der_bytes)
        .map_err(|e| EnrollerError::invalid_csr(format!("DER decode failed: {}", e)))?;

    let subject = subject_fields(&req.info.subject);
    let subject_der = req
        .info
        .subject
        .to_der()
        .map_err(|e| EnrollerError::invalid_csr(format!("subject re-encode failed: {}", e)))?;
    let san_der = requested_san(&req)?;

    let key = classify_public_key(
        &req.info.public_key.algorithm.oid,
        req.info.public_key.algorithm.parameters.as_ref(),
        req.info
            .public_key
            .subject_public_key
            .as_bytes()
            .unwrap_or_default(),
    );

    Ok(ParsedCsr {
        der: der_bytes.to_vec(),
        subject,
        subject_der,
        san_der,
        key,
    })
}

/// Extract identity facts from a DER-encoded X.509 certificate.
pub fn cert_identity(cert_der: &[u8]) -> Result<CertIdentity> {
    let cert = Certificate::from_der(cert_der)
        .map_err(|e| EnrollerError::validation(format!("certificate decode failed: {}", e)))?;

    let subject = subject_fields(&cert.tbs_certificate.subject);
    let subject_der = cert
        .tbs_certificate
        .subject
        .to_der()
        .map_err(|e| EnrollerError::validation(format!("subject re-encode failed: {}", e)))?;

    let san_der = cert.tbs_certificate.extensions.as_ref().and_then(|exts| {
        exts.iter()
            .find(|ext| ext.extn_id == OID_SUBJECT_ALT_NAME)
            .map(|ext| ext.extn_value.as_bytes().to_vec())
    });

    let issuer_common_name = subject_fields(&cert.tbs_certificate.issuer).common_name;

    Ok(CertIdentity {
        subject,
        subject_der,
        san_der,
        issuer_common_name,
    })
}

/// Classify an SPKI into `(key_type, bits)` metadata.
///
/// RSA bit length is the modulus length; EC bit length is the field size of
/// the named curve. Anything else is `UNKNOWN` with `bits = -1`.
pub fn classify_public_key(
    alg_oid: &ObjectIdentifier,
    parameters: Option<&der::Any>,
    public_key_bytes: &[u8],
) -> KeyMetadata {
    if *alg_oid == OID_RSA_ENCRYPTION {
        if let Ok(rsa_key) = pkcs1::RsaPublicKey::from_der(public_key_bytes) {
            let modulus = rsa_key.modulus.as_bytes();
            if let Some(first) = modulus.first() {
                let bits = modulus.len() as i32 * 8 - first.leading_zeros() as i32;
                return KeyMetadata::new(KeyType::Rsa, bits);
            }
        }
        return KeyMetadata::unknown();
    }

    if *alg_oid == OID_EC_PUBLIC_KEY {
        let curve = parameters.and_then(|p| p.decode_as::<ObjectIdentifier>().ok());
        let bits = match curve {
            Some(oid) if oid == OID_SECP224R1 => 224,
            Some(oid) if oid == OID_PRIME256V1 => 256,
            Some(oid) if oid == OID_SECP384R1 => 384,
            Some(oid) if oid == OID_SECP521R1 => 521,
            _ => return KeyMetadata::unknown(),
        };
        return KeyMetadata::new(KeyType::Ec, bits);
    }

    KeyMetadata::unknown()
}

/// Generate a key pair and a matching CSR for the given subject.
///
/// RSA keys come from the `rsa` crate, bridged into rcgen through PKCS#8, and
/// sign the CSR with SHA-512. The RSA private key is returned in PKCS#1 PEM
/// form (`RSA PRIVATE KEY`); EC keys are rcgen-native PKCS#8 (`PRIVATE KEY`).
pub fn generate_csr(subject: &DmsSubject, key: &KeyRequest) -> Result<GeneratedCsr> {
    key.validate()?;

    let (key_pair, private_key_pem) = match key.key_type {
        KeyType::Rsa => {
            let private_key = rsa::RsaPrivateKey::new(&mut rand::rngs::OsRng, key.bits as usize)
                .map_err(|e| EnrollerError::validation(format!("RSA key generation failed: {}", e)))?;
            let pkcs1_pem = private_key
                .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
                .map_err(|e| EnrollerError::validation(format!("PKCS#1 encode failed: {}", e)))?;
            let pkcs8 = private_key
                .to_pkcs8_der()
                .map_err(|e| EnrollerError::validation(format!("PKCS#8 encode failed: {}", e)))?;
            let key_der = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(pkcs8.as_bytes()));
            let key_pair = KeyPair::from_der_and_sign_algo(&key_der, &rcgen::PKCS_RSA_SHA512)
                .map_err(|e| EnrollerError::validation(format!("key import failed: {}", e)))?;
            (key_pair, pkcs1_pem.to_string())
        }
        KeyType::Ec => {
            let key_pair = match key.bits {
                256 => KeyPair::generate(),
                384 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384),
                521 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P521_SHA512),
                // The signing backend has no P-224 support.
                other => {
                    return Err(EnrollerError::validation(format!(
                        "EC-{} key generation is not supported",
                        other
                    )))
                }
            }
            .map_err(|e| EnrollerError::validation(format!("EC key generation failed: {}", e)))?;
            let pem = key_pair.serialize_pem();
            (key_pair, pem)
        }
        KeyType::Unknown => {
            return Err(EnrollerError::validation(
                "key type must be RSA or EC for server-side generation",
            ))
        }
    };

    let params = params_for_subject(subject);
    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| EnrollerError::validation(format!("CSR serialization failed: {}", e)))?;
    let csr_pem = csr
        .pem()
        .map_err(|e| EnrollerError::validation(format!("CSR PEM encode failed: {}", e)))?;

    Ok(GeneratedCsr {
        csr_pem,
        private_key_pem,
    })
}

/// Rebuild a CSR with a freshly generated P-256 key, preserving the subject
/// and the requested SubjectAltNames. Returns the new CSR DER and the new
/// private key as PKCS#8 DER.
pub fn regenerate_with_fresh_key(csr: &ParsedCsr) -> Result<(Vec<u8>, Vec<u8>)> {
    let key_pair = KeyPair::generate()
        .map_err(|e| EnrollerError::validation(format!("EC key generation failed: {}", e)))?;

    let mut params = params_for_subject(&csr.subject);
    if let Some(san_der) = &csr.san_der {
        params.subject_alt_names = rebuild_sans(san_der)?;
    }

    let new_csr = params
        .serialize_request(&key_pair)
        .map_err(|e| EnrollerError::validation(format!("CSR serialization failed: {}", e)))?;

    Ok((new_csr.der().to_vec(), key_pair.serialize_der()))
}

fn params_for_subject(subject: &DmsSubject) -> CertificateParams {
    let mut params = CertificateParams::default();
    let dn = &mut params.distinguished_name;
    if !subject.common_name.is_empty() {
        dn.push(DnType::CommonName, subject.common_name.clone());
    }
    if !subject.organization.is_empty() {
        dn.push(DnType::OrganizationName, subject.organization.clone());
    }
    if !subject.organization_unit.is_empty() {
        dn.push(DnType::OrganizationalUnitName, subject.organization_unit.clone());
    }
    if !subject.country.is_empty() {
        dn.push(DnType::CountryName, subject.country.clone());
    }
    if !subject.state.is_empty() {
        dn.push(DnType::StateOrProvinceName, subject.state.clone());
    }
    if !subject.locality.is_empty() {
        dn.push(DnType::LocalityName, subject.locality.clone());
    }
    params
}

fn rebuild_sans(san_der: &[u8]) -> Result<Vec<SanType>> {
    let san = SubjectAltName::from_der(san_der)
        .map_err(|e| EnrollerError::invalid_csr(format!("SAN decode failed: {}", e)))?;

    let mut out = Vec::new();
    for name in san.0 {
        match name {
            GeneralName::DnsName(dns) => {
                let value = dns.to_string().try_into().map_err(|_| {
                    EnrollerError::invalid_csr("SAN dNSName is not valid IA5")
                })?;
                out.push(SanType::DnsName(value));
            }
            GeneralName::Rfc822Name(mail) => {
                let value = mail.to_string().try_into().map_err(|_| {
                    EnrollerError::invalid_csr("SAN rfc822Name is not valid IA5")
                })?;
                out.push(SanType::Rfc822Name(value));
            }
            GeneralName::UniformResourceIdentifier(uri) => {
                let value = uri.to_string().try_into().map_err(|_| {
                    EnrollerError::invalid_csr("SAN URI is not valid IA5")
                })?;
                out.push(SanType::URI(value));
            }
            GeneralName::IpAddress(octets) => {
                let bytes = octets.as_bytes();
                let addr: std::net::IpAddr = match bytes.len() {
                    4 => {
                        let arr: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
                        std::net::IpAddr::from(arr)
                    }
                    16 => {
                        let mut arr = [0u8; 16];
                        arr.copy_from_slice(bytes);
                        std::net::IpAddr::from(arr)
                    }
                    _ => {
                        return Err(EnrollerError::invalid_csr(
                            "SAN iPAddress has invalid length",
                        ))
                    }
                };
                out.push(SanType::IpAddress(addr));
            }
            // Other GeneralName forms are not carried over.
            _ => {}
        }
    }
    Ok(out)
}

fn subject_fields(name: &Name) -> DmsSubject {
    let mut subject = DmsSubject::default();
    for rdn in name.0.iter() {
        for atv in rdn.0.iter() {
            let Some(value) = atv_string(atv) else { continue };
            if atv.oid == OID_COMMON_NAME {
                subject.common_name = value;
            } else if atv.oid == OID_ORGANIZATION {
                subject.organization = value;
            } else if atv.oid == OID_ORGANIZATIONAL_UNIT {
                subject.organization_unit = value;
            } else if atv.oid == OID_COUNTRY {
                subject.country = value;
            } else if atv.oid == OID_STATE {
                subject.state = value;
            } else if atv.oid == OID_LOCALITY {
                subject.locality = value;
            }
        }
    }
    subject
}

// DN attribute values are PrintableString or UTF8String in everything the CA
// emits; both carry the raw string bytes as the DER value.
fn atv_string(atv: &AttributeTypeAndValue) -> Option<String> {
    std::str::from_utf8(atv.value.value()).ok().map(String::from)
}

fn requested_san(req: &CertReq) -> Result<Option<Vec<u8>>> {
    for attr in req.info.attributes.iter() {
        if attr.oid != OID_EXTENSION_REQUEST {
            continue;
        }
        let Some(value) = attr.values.iter().next() else {
            continue;
        };
        let extensions = value
            .decode_as::<Extensions>()
            .map_err(|e| EnrollerError::invalid_csr(format!("extensionRequest decode failed: {}", e)))?;
        for ext in extensions {
            if ext.extn_id == OID_SUBJECT_ALT_NAME {
                return Ok(Some(ext.extn_value.as_bytes().to_vec()));
            }
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::KeyStrength;

    fn subject() -> DmsSubject {
        DmsSubject {
            common_name: "dms-unit".into(),
            organization: "Acme".into(),
            organization_unit: "PKI".into(),
            country: "ES".into(),
            state: "Gipuzkoa".into(),
            locality: "Donostia".into(),
        }
    }

    #[test]
    fn test_generate_and_parse_ec_round_trip() {
        let generated = generate_csr(
            &subject(),
            &KeyRequest {
                key_type: KeyType::Ec,
                bits: 256,
            },
        )
        .unwrap();

        assert!(generated.private_key_pem.contains("PRIVATE KEY"));

        let parsed = parse_pem(&generated.csr_pem).unwrap();
        assert_eq!(parsed.subject, subject());
        assert_eq!(parsed.key.key_type, KeyType::Ec);
        assert_eq!(parsed.key.key_bits, 256);
        assert_eq!(parsed.key.key_strength, KeyStrength::High);
    }

    #[test]
    fn test_generate_ec_521() {
        let generated = generate_csr(
            &subject(),
            &KeyRequest {
                key_type: KeyType::Ec,
                bits: 521,
            },
        )
        .unwrap();

        let parsed = parse_pem(&generated.csr_pem).unwrap();
        assert_eq!(parsed.key.key_type, KeyType::Ec);
        assert_eq!(parsed.key.key_bits, 521);
        assert_eq!(parsed.key.key_strength, KeyStrength::High);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let generated = generate_csr(
            &subject(),
            &KeyRequest {
                key_type: KeyType::Ec,
                bits: 256,
            },
        )
        .unwrap();

        let rendered = format!("{:?}", generated);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_generate_rsa_returns_pkcs1_pem() {
        let generated = generate_csr(
            &subject(),
            &KeyRequest {
                key_type: KeyType::Rsa,
                bits: 2048,
            },
        )
        .unwrap();

        assert!(generated.private_key_pem.contains("RSA PRIVATE KEY"));

        let parsed = parse_pem(&generated.csr_pem).unwrap();
        assert_eq!(parsed.key.key_type, KeyType::Rsa);
        assert_eq!(parsed.key.key_bits, 2048);
        assert_eq!(parsed.key.key_strength, KeyStrength::Medium);
    }

    #[test]
    fn test_invalid_bits_rejected_before_generation() {
        let err = generate_csr(
            &subject(),
            &KeyRequest {
                key_type: KeyType::Rsa,
                bits: 1024,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid RSA key length"));

        assert!(generate_csr(
            &subject(),
            &KeyRequest {
                key_type: KeyType::Ec,
                bits: 192,
            },
        )
        .is_err());
    }

    #[test]
    fn test_parse_base64_pem_rejects_garbage() {
        assert!(parse_base64_pem("!!!not-base64!!!").is_err());

        let not_a_csr = general_purpose::STANDARD.encode("hello world");
        assert!(parse_base64_pem(&not_a_csr).is_err());
    }

    #[test]
    fn test_regenerate_swaps_key_keeps_subject() {
        let generated = generate_csr(
            &subject(),
            &KeyRequest {
                key_type: KeyType::Ec,
                bits: 256,
            },
        )
        .unwrap();
        let parsed = parse_pem(&generated.csr_pem).unwrap();

        let (new_der, key_der) = regenerate_with_fresh_key(&parsed).unwrap();
        assert!(!key_der.is_empty());

        let reparsed = parse_der(&new_der).unwrap();
        assert_eq!(reparsed.subject, parsed.subject);
        assert_eq!(reparsed.subject_der, parsed.subject_der);
        // Fresh key means a different CSR body.
        assert_ne!(reparsed.der, parsed.der);
    }
}
