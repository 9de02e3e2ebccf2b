//! Signing authority lifecycle: create, keep, or rotate a self-signed CA.
//!
//! The outgoing authority of a rotation is handed back to the caller in
//! [`SignerSlots::previous`] so the trust bundle written in the same pass
//! still contains it.

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};

use super::codec::{parse_key_pair, CertificateInfo};
use super::constants::ValidityPolicy;
use super::{random_serial, to_offset_datetime};
use crate::error::{Error, Result};

/// A self-signed CA certificate and its private key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningAuthority {
    cert_pem: String,
    key_pem: String,
    info: CertificateInfo,
    refresh_threshold: DateTime<Utc>,
}

impl SigningAuthority {
    /// Generate a fresh authority valid from `now`.
    pub fn generate(signer_name: &str, now: DateTime<Utc>, policy: ValidityPolicy) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(
            DnType::CommonName,
            format!("{}@{}", signer_name, now.timestamp()),
        );
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params.not_before = to_offset_datetime(now)?;
        params.not_after = to_offset_datetime(now + policy.validity())?;
        params.serial_number = Some(random_serial());

        let key_pair = KeyPair::generate().map_err(|e| {
            Error::KeyGeneration(format!("failed to generate key for {signer_name}: {e}"))
        })?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            Error::CertificateError(format!("failed to self-sign {signer_name}: {e}"))
        })?;

        Self::from_pem(&cert.pem(), &key_pair.serialize_pem(), policy)
    }

    /// Load a stored authority. Fails if either half cannot be parsed or the
    /// certificate is not a CA.
    pub fn from_pem(cert_pem: &str, key_pem: &str, policy: ValidityPolicy) -> Result<Self> {
        parse_key_pair(key_pem)?;
        let info = CertificateInfo::from_pem(cert_pem.as_bytes())?;
        if !info.is_ca {
            return Err(Error::ParseError(format!(
                "certificate {} is not a certificate authority",
                info.common_name
            )));
        }
        let refresh_threshold = info.not_after - policy.refresh_margin();

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            info,
            refresh_threshold,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    pub fn common_name(&self) -> &str {
        &self.info.common_name
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.info.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.info.not_after
    }

    pub fn refresh_threshold(&self) -> DateTime<Utc> {
        self.refresh_threshold
    }

    pub fn needs_rotation(&self, now: DateTime<Utc>) -> bool {
        now >= self.refresh_threshold
    }

    pub(crate) fn key_pair(&self) -> Result<KeyPair> {
        parse_key_pair(&self.key_pem)
    }
}

/// What [`AuthorityManager::ensure`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthorityAction {
    Unchanged,
    Created,
    Rotated,
}

/// The active authority plus, during the pass that rotated it, its predecessor.
#[derive(Clone, Debug)]
pub struct SignerSlots {
    pub current: SigningAuthority,
    pub previous: Option<SigningAuthority>,
}

impl SignerSlots {
    pub fn authorities(&self) -> impl Iterator<Item = &SigningAuthority> {
        std::iter::once(&self.current).chain(self.previous.iter())
    }
}

/// Rotation policy for one named signer.
#[derive(Clone, Debug)]
pub struct AuthorityManager {
    signer_name: String,
    policy: ValidityPolicy,
}

impl AuthorityManager {
    /// `signer_name` becomes the CN prefix, e.g. `openshift-etcd_etcd-signer`.
    pub fn new(signer_name: impl Into<String>) -> Self {
        Self {
            signer_name: signer_name.into(),
            policy: ValidityPolicy::CA,
        }
    }

    pub fn policy(&self) -> ValidityPolicy {
        self.policy
    }

    /// Decide whether `current` can stay, and mint a replacement if not.
    pub fn ensure(
        &self,
        current: Option<&SigningAuthority>,
        now: DateTime<Utc>,
    ) -> Result<(SigningAuthority, AuthorityAction)> {
        match current {
            None => Ok((
                SigningAuthority::generate(&self.signer_name, now, self.policy)?,
                AuthorityAction::Created,
            )),
            Some(existing) if !existing.needs_rotation(now) => {
                Ok((existing.clone(), AuthorityAction::Unchanged))
            }
            Some(_) => Ok((
                SigningAuthority::generate(&self.signer_name, now, self.policy)?,
                AuthorityAction::Rotated,
            )),
        }
    }

    /// Like [`ensure`](Self::ensure) but keeps the outgoing authority in the
    /// returned slots when a rotation happened.
    pub fn ensure_slots(
        &self,
        current: Option<SigningAuthority>,
        now: DateTime<Utc>,
    ) -> Result<(SignerSlots, AuthorityAction)> {
        let (authority, action) = self.ensure(current.as_ref(), now)?;
        let previous = match action {
            AuthorityAction::Rotated => current,
            _ => None,
        };
        Ok((
            SignerSlots {
                current: authority,
                previous,
            },
            action,
        ))
    }
}
