//! Offline certificate generation for bootstrap and recovery.
//!
//! These take a raw CA certificate and key instead of reading the cluster,
//! and go through the same [`LeafSpec`] constructors and [`issue_leaf`] as the
//! rotation controller so a node bootstrapped here is not re-issued later just
//! because its certificate looks different.

use chrono::{DateTime, Utc};

use super::authority::SigningAuthority;
use super::codec::pem_text;
use super::constants::{ValidityPolicy, FAKE_POD_FQDN};
use super::issuer::{issue_leaf, CertRole, LeafSpec};
use crate::error::Result;

pub fn create_peer_cert_key(
    ca_cert: &[u8],
    ca_key: &[u8],
    node_internal_ips: &[String],
) -> Result<(Vec<u8>, Vec<u8>)> {
    create_combined_cert_key(ca_cert, ca_key, CertRole::Peer, node_internal_ips, Utc::now())
}

pub fn create_server_cert_key(
    ca_cert: &[u8],
    ca_key: &[u8],
    node_internal_ips: &[String],
) -> Result<(Vec<u8>, Vec<u8>)> {
    create_combined_cert_key(ca_cert, ca_key, CertRole::Server, node_internal_ips, Utc::now())
}

pub fn create_metric_cert_key(
    ca_cert: &[u8],
    ca_key: &[u8],
    node_internal_ips: &[String],
) -> Result<(Vec<u8>, Vec<u8>)> {
    create_combined_cert_key(
        ca_cert,
        ca_key,
        CertRole::MetricsServer,
        node_internal_ips,
        Utc::now(),
    )
}

/// Issue one serving+client certificate for `role` and return the PEM
/// certificate and PEM key as separate buffers.
pub fn create_combined_cert_key(
    ca_cert: &[u8],
    ca_key: &[u8],
    role: CertRole,
    node_internal_ips: &[String],
    now: DateTime<Utc>,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let authority = SigningAuthority::from_pem(
        &pem_text("CA certificate", ca_cert)?,
        &pem_text("CA key", ca_key)?,
        ValidityPolicy::CA,
    )?;
    let spec = LeafSpec::serving(role, FAKE_POD_FQDN, node_internal_ips)?;
    let leaf = issue_leaf(&authority, &spec, now)?;
    Ok((leaf.cert_pem.into_bytes(), leaf.key_pem.into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::authority::AuthorityManager;
    use crate::pki::codec::CertificateInfo;

    fn ips() -> Vec<String> {
        vec!["10.0.0.5".to_string(), "fd00::5".to_string()]
    }

    #[test]
    fn test_offline_matches_online_structure() {
        let now = Utc::now();
        let ca = AuthorityManager::new("openshift-etcd_etcd-signer")
            .ensure(None, now)
            .unwrap()
            .0;

        for role in [CertRole::Peer, CertRole::Server, CertRole::MetricsServer] {
            let (cert, key) = create_combined_cert_key(
                ca.cert_pem().as_bytes(),
                ca.key_pem().as_bytes(),
                role,
                &ips(),
                now,
            )
            .unwrap();
            assert!(String::from_utf8(key).unwrap().contains("PRIVATE KEY"));

            let offline = CertificateInfo::from_pem(&cert).unwrap();
            let online_spec = LeafSpec::serving(role, "master-0", &ips()).unwrap();
            let online = issue_leaf(&ca, &online_spec, now).unwrap();
            let online = CertificateInfo::from_pem(online.cert_pem.as_bytes()).unwrap();

            assert_eq!(offline.organizations, online.organizations);
            assert_eq!(offline.subject_alt_names, online.subject_alt_names);
            assert_eq!(
                (offline.server_auth, offline.client_auth),
                (online.server_auth, online.client_auth)
            );
            assert_eq!(offline.issuer_common_name, ca.common_name());
            assert!(offline.common_name.ends_with(":etcd-client"));
        }
    }

    #[test]
    fn test_peer_cert_key_uses_peer_org() {
        let ca = AuthorityManager::new("signer").ensure(None, Utc::now()).unwrap().0;
        let (cert, _) =
            create_peer_cert_key(ca.cert_pem().as_bytes(), ca.key_pem().as_bytes(), &ips())
                .unwrap();
        let info = CertificateInfo::from_pem(&cert).unwrap();
        assert_eq!(info.common_name, "system:etcd-peer:etcd-client");
        assert_eq!(info.organizations, vec!["system:etcd-peers".to_string()]);
    }

    #[test]
    fn test_rejects_non_pem_ca() {
        assert!(create_server_cert_key(b"not a cert", b"not a key", &ips()).is_err());
    }
}
