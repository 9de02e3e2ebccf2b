//! PEM encoding and decoding of certificates and keys.
//!
//! Generation goes through `rcgen`; reading back stored material goes through
//! `x509-parser`, which gives us the validity window, subject, issuer and the
//! extensions the rotation logic compares against.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use ::pem::{EncodeConfig, LineEnding, Pem};
use rcgen::KeyPair;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use crate::error::{Error, Result};

const CERTIFICATE_TAG: &str = "CERTIFICATE";

/// A PEM certificate with its PEM private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// The parts of a certificate that rotation decisions look at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub serial: String,
    pub common_name: String,
    pub organizations: Vec<String>,
    pub issuer_common_name: String,
    /// DNS names and normalized IP literals.
    pub subject_alt_names: BTreeSet<String>,
    pub server_auth: bool,
    pub client_auth: bool,
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Parse the first certificate in a PEM buffer.
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let block = ::pem::parse(pem_data)
            .map_err(|e| Error::ParseError(format!("failed to parse PEM: {e}")))?;
        if block.tag() != CERTIFICATE_TAG {
            return Err(Error::ParseError(format!(
                "expected CERTIFICATE block, found {}",
                block.tag()
            )));
        }
        Self::from_der(block.contents())
    }

    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::ParseError(format!("failed to parse certificate: {e}")))?;

        let not_before = timestamp(cert.validity().not_before.timestamp())?;
        let not_after = timestamp(cert.validity().not_after.timestamp())?;

        let common_name = first_common_name(cert.subject());
        let issuer_common_name = first_common_name(cert.issuer());
        let organizations = cert
            .subject()
            .iter_organization()
            .filter_map(|o| o.as_str().ok())
            .map(str::to_string)
            .collect();

        let mut subject_alt_names = BTreeSet::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => {
                        subject_alt_names.insert(dns.to_string());
                    }
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            subject_alt_names.insert(ip.to_string());
                        }
                    }
                    _ => {}
                }
            }
        }

        let (server_auth, client_auth) = match cert.extended_key_usage() {
            Ok(Some(eku)) => (eku.value.server_auth, eku.value.client_auth),
            _ => (false, false),
        };

        let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);

        Ok(Self {
            not_before,
            not_after,
            serial: cert.raw_serial_as_string(),
            common_name,
            organizations,
            issuer_common_name,
            subject_alt_names,
            server_auth,
            client_auth,
            is_ca,
        })
    }
}

fn first_common_name(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string()
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::ParseError(format!("certificate time {secs} out of range")))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Canonical form of a SAN entry: IP literals are re-rendered so that
/// `0:0:0:0:0:0:0:1` and `::1` compare equal.
pub fn normalize_san(entry: &str) -> String {
    match entry.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => entry.to_string(),
    }
}

/// Load a PEM private key, failing if it is not usable for signing.
pub fn parse_key_pair(key_pem: &str) -> Result<KeyPair> {
    KeyPair::from_pem(key_pem)
        .map_err(|e| Error::ParseError(format!("failed to parse private key: {e}")))
}

/// Split a buffer of concatenated PEM certificates into individual
/// LF-terminated PEM blocks. Non-certificate blocks are rejected.
pub fn split_certificates(data: &[u8]) -> Result<Vec<String>> {
    let blocks = ::pem::parse_many(data)
        .map_err(|e| Error::ParseError(format!("failed to parse PEM bundle: {e}")))?;
    if blocks.is_empty() && !data.iter().all(u8::is_ascii_whitespace) {
        return Err(Error::ParseError(
            "certificate bundle contains no PEM blocks".to_string(),
        ));
    }
    blocks
        .into_iter()
        .map(|block| {
            if block.tag() != CERTIFICATE_TAG {
                return Err(Error::ParseError(format!(
                    "unexpected {} block in certificate bundle",
                    block.tag()
                )));
            }
            Ok(encode_block(&block))
        })
        .collect()
}

fn encode_block(block: &Pem) -> String {
    ::pem::encode_config(block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}

/// Decode a stored field as UTF-8 PEM text.
pub fn pem_text(field: &str, data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec())
        .map_err(|_| Error::ParseError(format!("{field} is not valid UTF-8 PEM")))
}
