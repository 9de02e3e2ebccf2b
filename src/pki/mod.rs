//! Certificate material for etcd: signing authorities, leaf certificates,
//! trust bundles and the helpers that encode them.

pub mod authority;
pub mod bundle;
pub mod ciphers;
pub mod codec;
pub mod constants;
pub mod issuer;
pub mod offline;

pub use authority::{AuthorityAction, AuthorityManager, SignerSlots, SigningAuthority};
pub use bundle::{build_bundle, TrustBundle};
pub use ciphers::filter_supported;
pub use codec::{CertKeyPair, CertificateInfo};
pub use constants::ValidityPolicy;
pub use issuer::{issue_leaf, CertRole, LeafSpec};
pub use offline::{
    create_combined_cert_key, create_metric_cert_key, create_peer_cert_key, create_server_cert_key,
};

use chrono::{DateTime, Utc};
use rand::Rng;
use rcgen::SerialNumber;

use crate::error::{Error, Result};

/// Random positive 128-bit serial, unique per issuance.
pub(crate) fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes[..]);
    // Keep the DER INTEGER positive and at full length.
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    SerialNumber::from_slice(&bytes)
}

pub(crate) fn to_offset_datetime(at: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(at.timestamp())
        .map_err(|e| Error::CertificateError(format!("invalid certificate time {at}: {e}")))
}
