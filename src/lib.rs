//! etcd-pki-operator: keeps etcd's certificates and trust bundles current.
//!
//! The [`controller`] module rotates the etcd signers, issues per-node
//! peer/serving/metrics certificates and client certificates, and mirrors CA
//! bundles and client keypairs into the namespaces that consume them. The
//! [`pki`] module holds the certificate logic and can be used offline.

pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod pki;

pub use crate::error::{Error, Result};
