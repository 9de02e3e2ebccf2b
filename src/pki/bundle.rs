//! Trust bundles: ordered, deduplicated sets of CA certificates.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::authority::SigningAuthority;
use super::codec::{split_certificates, CertificateInfo};
use crate::error::Result;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustBundle {
    certs: Vec<String>,
}

impl TrustBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a persisted bundle of concatenated PEM certificates.
    pub fn from_pem_bytes(data: &[u8]) -> Result<Self> {
        let mut bundle = Self::new();
        for cert in split_certificates(data)? {
            bundle.push_pem(cert);
        }
        Ok(bundle)
    }

    /// Append a certificate unless a byte-identical one is already present.
    /// Returns whether it was added.
    pub fn push_pem(&mut self, cert_pem: impl Into<String>) -> bool {
        let cert_pem = cert_pem.into();
        if self.certs.contains(&cert_pem) {
            return false;
        }
        self.certs.push(cert_pem);
        true
    }

    pub fn extend(&mut self, other: &TrustBundle) {
        for cert in &other.certs {
            self.push_pem(cert.clone());
        }
    }

    /// Drop certificates that have expired or cannot be parsed.
    pub fn retain_valid(&mut self, now: DateTime<Utc>) {
        self.certs.retain(|cert| match CertificateInfo::from_pem(cert.as_bytes()) {
            Ok(info) if info.not_after > now => true,
            Ok(info) => {
                debug!(common_name = %info.common_name, "Dropping expired certificate from bundle");
                false
            }
            Err(e) => {
                debug!("Dropping unparseable certificate from bundle: {}", e);
                false
            }
        });
    }

    pub fn contains(&self, cert_pem: &str) -> bool {
        self.certs.iter().any(|c| c == cert_pem)
    }

    pub fn certificates(&self) -> &[String] {
        &self.certs
    }

    pub fn len(&self) -> usize {
        self.certs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }

    /// Concatenated PEM, no separator beyond the blocks' own END markers.
    pub fn to_pem_bytes(&self) -> Vec<u8> {
        self.certs.concat().into_bytes()
    }
}

/// Bundle of the given authorities' certificates in first-seen order.
pub fn build_bundle<'a>(authorities: impl IntoIterator<Item = &'a SigningAuthority>) -> TrustBundle {
    let mut bundle = TrustBundle::new();
    for authority in authorities {
        bundle.push_pem(authority.cert_pem());
    }
    bundle
}
