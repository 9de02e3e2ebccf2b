//! Fixed names, hostnames and validity policies for etcd certificates.

use chrono::Duration;

/// Namespace the etcd pods and their certificates live in.
pub const TARGET_NAMESPACE: &str = "openshift-etcd";
/// Namespace of the operator itself.
pub const OPERATOR_NAMESPACE: &str = "openshift-etcd-operator";
/// Namespace holding user-facing copies of trust material.
pub const GLOBAL_CONFIG_NAMESPACE: &str = "openshift-config";
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

pub const PEER_ORG: &str = "system:etcd-peers";
pub const SERVER_ORG: &str = "system:etcd-servers";
pub const METRICS_ORG: &str = "system:etcd-metrics";

/// Placeholder identity for certificates minted before any node identity is known.
// TODO: replace with the real pod FQDN once the bootstrap path receives it.
pub const FAKE_POD_FQDN: &str = "etcd-client";

pub const ETCD_SIGNER_SECRET: &str = "etcd-signer";
pub const ETCD_CA_BUNDLE_CONFIGMAP: &str = "etcd-ca-bundle";
pub const ETCD_METRICS_SIGNER_SECRET: &str = "etcd-metric-signer";
pub const ETCD_METRICS_CA_BUNDLE_CONFIGMAP: &str = "etcd-metrics-ca-bundle";
pub const ETCD_ALL_CERTS_SECRET: &str = "etcd-all-certs";
pub const ETCD_CLIENT_SECRET: &str = "etcd-client";
pub const ETCD_METRICS_CLIENT_SECRET: &str = "etcd-metric-client";

/// Keypair object field holding the PEM certificate.
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Keypair object field holding the unencrypted PEM private key.
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
/// Bundle object field holding concatenated CA certificates.
pub const CA_BUNDLE_KEY: &str = "ca-bundle.crt";

/// Hostnames every serving certificate answers for, ahead of the node IPs.
/// "0:0:0:0:0:0:0:1" collapses to "::1" so it is not listed separately.
pub const SERVER_HOSTNAMES: &[&str] = &[
    "localhost",
    "etcd.kube-system.svc",
    "etcd.kube-system.svc.cluster.local",
    "etcd.openshift-etcd.svc",
    "etcd.openshift-etcd.svc.cluster.local",
    "127.0.0.1",
    "::1",
];

const HOURS_PER_YEAR: i64 = 365 * 24;

/// Lifetime of a certificate and the age after which it is renewed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidityPolicy {
    validity_hours: i64,
    refresh_hours: i64,
}

impl ValidityPolicy {
    /// Signing authorities: valid 5 years, renewed after 4.5.
    pub const CA: ValidityPolicy = ValidityPolicy {
        validity_hours: 5 * HOURS_PER_YEAR,
        refresh_hours: 9 * HOURS_PER_YEAR / 2,
    };

    /// Leaf certificates: valid 3 years, renewed after 2.5.
    pub const LEAF: ValidityPolicy = ValidityPolicy {
        validity_hours: 3 * HOURS_PER_YEAR,
        refresh_hours: 5 * HOURS_PER_YEAR / 2,
    };

    pub fn validity(&self) -> Duration {
        Duration::hours(self.validity_hours)
    }

    pub fn refresh(&self) -> Duration {
        Duration::hours(self.refresh_hours)
    }

    /// Gap between the refresh threshold and expiry.
    pub fn refresh_margin(&self) -> Duration {
        Duration::hours(self.validity_hours - self.refresh_hours)
    }
}

pub fn peer_secret_name(node_name: &str) -> String {
    format!("etcd-peer-{node_name}")
}

pub fn serving_secret_name(node_name: &str) -> String {
    format!("etcd-serving-{node_name}")
}

pub fn serving_metrics_secret_name(node_name: &str) -> String {
    format!("etcd-serving-metrics-{node_name}")
}
