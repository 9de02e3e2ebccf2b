//! Leaf certificate specifications and issuance.
//!
//! A [`LeafSpec`] is a plain value computed per call from the role and the
//! node's current addresses. Two issuances from the same [`LeafSpec`] differ
//! only in validity window, serial and key.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};

use super::authority::SigningAuthority;
use super::codec::{normalize_san, CertKeyPair};
use super::constants::{
    ValidityPolicy, METRICS_ORG, PEER_ORG, SERVER_HOSTNAMES, SERVER_ORG,
};
use super::{random_serial, to_offset_datetime};
use crate::error::{Error, Result};

const ORGANIZATION_NAME_OID: &[u64] = &[2, 5, 4, 10];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CertRole {
    Peer,
    Server,
    MetricsServer,
    Client,
    MetricsClient,
}

impl CertRole {
    /// Fixed subject organization of serving-class roles.
    pub fn organization(&self) -> Option<&'static str> {
        match self {
            CertRole::Peer => Some(PEER_ORG),
            CertRole::Server => Some(SERVER_ORG),
            CertRole::MetricsServer => Some(METRICS_ORG),
            CertRole::Client | CertRole::MetricsClient => None,
        }
    }

    pub fn is_serving(&self) -> bool {
        self.organization().is_some()
    }
}

impl std::fmt::Display for CertRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CertRole::Peer => "peer",
            CertRole::Server => "server",
            CertRole::MetricsServer => "metrics-server",
            CertRole::Client => "client",
            CertRole::MetricsClient => "metrics-client",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyUsage {
    ServerAuth,
    ClientAuth,
}

/// Everything needed to mint one leaf certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafSpec {
    pub role: CertRole,
    pub organizations: Vec<String>,
    pub common_name: String,
    pub hostnames: Vec<String>,
    pub usages: BTreeSet<KeyUsage>,
    pub policy: ValidityPolicy,
}

/// SANs for every serving role: fixed service names and loopback, then node IPs.
pub fn server_hostnames(node_internal_ips: &[String]) -> Vec<String> {
    SERVER_HOSTNAMES
        .iter()
        .map(|h| h.to_string())
        .chain(node_internal_ips.iter().cloned())
        .collect()
}

impl LeafSpec {
    /// Serving certificate for `role`, identified as `identity`.
    ///
    /// The common name is the organization with its plural `s` dropped,
    /// followed by the identity: `system:etcd-server:<identity>`.
    pub fn serving(role: CertRole, identity: &str, node_internal_ips: &[String]) -> Result<Self> {
        let org = role.organization().ok_or_else(|| {
            Error::CertificateError(format!("{role} is not a serving certificate role"))
        })?;
        let base = org.strip_suffix('s').unwrap_or(org);

        Ok(Self {
            role,
            organizations: vec![org.to_string()],
            common_name: format!("{base}:{identity}"),
            hostnames: server_hostnames(node_internal_ips),
            usages: BTreeSet::from([KeyUsage::ClientAuth, KeyUsage::ServerAuth]),
            policy: ValidityPolicy::LEAF,
        })
    }

    /// Client certificate for a user and its groups. Carries no SANs.
    pub fn client(role: CertRole, user: &str, groups: &[&str]) -> Result<Self> {
        if role.is_serving() {
            return Err(Error::CertificateError(format!(
                "{role} is not a client certificate role"
            )));
        }
        Ok(Self {
            role,
            organizations: groups.iter().map(|g| g.to_string()).collect(),
            common_name: user.to_string(),
            hostnames: Vec::new(),
            usages: BTreeSet::from([KeyUsage::ClientAuth]),
            policy: ValidityPolicy::LEAF,
        })
    }

    /// Normalized SAN set, comparable with [`CertificateInfo::subject_alt_names`].
    ///
    /// [`CertificateInfo::subject_alt_names`]: super::codec::CertificateInfo
    pub fn san_set(&self) -> BTreeSet<String> {
        self.hostnames.iter().map(|h| normalize_san(h)).collect()
    }
}

/// Mint a leaf for `spec`, signed by `authority`, valid from `now`.
pub fn issue_leaf(
    authority: &SigningAuthority,
    spec: &LeafSpec,
    now: DateTime<Utc>,
) -> Result<CertKeyPair> {
    let mut params = CertificateParams::new(spec.hostnames.clone()).map_err(|e| {
        Error::CertificateError(format!("invalid SAN for {}: {e}", spec.common_name))
    })?;

    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, spec.common_name.as_str());
    match spec.organizations.as_slice() {
        [] => {}
        [org] => params
            .distinguished_name
            .push(DnType::OrganizationName, org.as_str()),
        // One entry per DnType, so the second O= goes in under its raw OID.
        [first, second] => {
            params
                .distinguished_name
                .push(DnType::OrganizationName, first.as_str());
            params
                .distinguished_name
                .push(DnType::CustomDnType(ORGANIZATION_NAME_OID.to_vec()), second.as_str());
        }
        orgs => {
            return Err(Error::CertificateError(format!(
                "{} has {} organizations, at most 2 are supported",
                spec.common_name,
                orgs.len()
            )))
        }
    }

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = spec
        .usages
        .iter()
        .map(|usage| match usage {
            KeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
            KeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
        })
        .collect();
    params.use_authority_key_identifier_extension = true;
    params.not_before = to_offset_datetime(now)?;
    params.not_after = to_offset_datetime(now + spec.policy.validity())?;
    params.serial_number = Some(random_serial());

    let issuer_key = authority.key_pair()?;
    let issuer = CertificateParams::from_ca_cert_pem(authority.cert_pem())
        .and_then(|ca_params| ca_params.self_signed(&issuer_key))
        .map_err(|e| {
            Error::CertificateError(format!(
                "failed to load signer {}: {e}",
                authority.common_name()
            ))
        })?;

    let key_pair = KeyPair::generate().map_err(|e| {
        Error::KeyGeneration(format!("failed to generate key for {}: {e}", spec.common_name))
    })?;
    let cert = params
        .signed_by(&key_pair, &issuer, &issuer_key)
        .map_err(|e| {
            Error::CertificateError(format!("failed to sign {}: {e}", spec.common_name))
        })?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::authority::AuthorityManager;
    use crate::pki::codec::CertificateInfo;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn authority() -> SigningAuthority {
        AuthorityManager::new("openshift-etcd_etcd-signer")
            .ensure(None, now())
            .unwrap()
            .0
    }

    #[test]
    fn test_server_leaf_san_set_for_single_node() {
        let ca = authority();
        let spec = LeafSpec::serving(CertRole::Server, "master-0", &["10.0.0.5".to_string()])
            .unwrap();
        let leaf = issue_leaf(&ca, &spec, now()).unwrap();
        let info = CertificateInfo::from_pem(leaf.cert_pem.as_bytes()).unwrap();

        let expected: BTreeSet<String> = [
            "localhost",
            "etcd.kube-system.svc",
            "etcd.kube-system.svc.cluster.local",
            "etcd.openshift-etcd.svc",
            "etcd.openshift-etcd.svc.cluster.local",
            "127.0.0.1",
            "::1",
            "10.0.0.5",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(info.subject_alt_names, expected);
        assert_eq!(info.subject_alt_names, spec.san_set());
        assert_eq!(info.organizations, vec!["system:etcd-servers".to_string()]);
        assert_eq!(info.common_name, "system:etcd-server:master-0");
        assert_eq!(info.issuer_common_name, ca.common_name());
        assert!(info.server_auth && info.client_auth);
        assert_eq!(info.not_after - info.not_before, Duration::days(3 * 365));
    }

    #[test]
    fn test_reissue_keeps_identity_but_not_serial() {
        let ca = authority();
        let spec = LeafSpec::serving(CertRole::Peer, "master-1", &["10.0.0.6".to_string()])
            .unwrap();

        let first = issue_leaf(&ca, &spec, now()).unwrap();
        let second = issue_leaf(&ca, &spec, now() + Duration::days(10)).unwrap();
        let a = CertificateInfo::from_pem(first.cert_pem.as_bytes()).unwrap();
        let b = CertificateInfo::from_pem(second.cert_pem.as_bytes()).unwrap();

        assert_eq!(a.subject_alt_names, b.subject_alt_names);
        assert_eq!(a.organizations, b.organizations);
        assert_eq!((a.server_auth, a.client_auth), (b.server_auth, b.client_auth));
        assert_ne!(a.serial, b.serial);
    }

    #[test]
    fn test_common_name_strips_plural() {
        let metrics = LeafSpec::serving(CertRole::MetricsServer, "etcd-client", &[]).unwrap();
        assert_eq!(metrics.common_name, "system:etcd-metric:etcd-client");
        let peer = LeafSpec::serving(CertRole::Peer, "etcd-client", &[]).unwrap();
        assert_eq!(peer.common_name, "system:etcd-peer:etcd-client");
    }

    #[test]
    fn test_client_leaf_has_no_sans_and_client_auth_only() {
        let ca = authority();
        let spec =
            LeafSpec::client(CertRole::Client, "etcd-client", &["system:etcd", "etcd-client"])
                .unwrap();
        let leaf = issue_leaf(&ca, &spec, now()).unwrap();
        let info = CertificateInfo::from_pem(leaf.cert_pem.as_bytes()).unwrap();

        assert!(info.subject_alt_names.is_empty());
        assert!(info.client_auth);
        assert!(!info.server_auth);
        assert_eq!(info.common_name, "etcd-client");
        assert_eq!(
            info.organizations,
            vec!["system:etcd".to_string(), "etcd-client".to_string()]
        );
    }

    #[test]
    fn test_role_mismatch_is_rejected() {
        assert!(LeafSpec::serving(CertRole::Client, "x", &[]).is_err());
        assert!(LeafSpec::client(CertRole::Server, "x", &[]).is_err());
    }
}
