//! Certificate rotation for the etcd signers and the leaves they sign.
//!
//! Each pass walks every [`SignerTarget`] in order:
//!
//! 1. keep or rotate the signer keypair,
//! 2. write the CA bundle (new signer, outgoing signer, and every
//!    still-valid signer already in the bundle),
//! 3. issue or re-issue the per-node serving leaves and the client leaves.
//!
//! The bundle is always written before any leaf signed by a new signer, so
//! verifiers trust a signer before they see certificates from it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::store::{apply_if_changed, ObjectData, ObjectKind, ResourceLocation, StoredObject};
use super::ControllerState;
use crate::error::{Error, Result};
use crate::pki::codec::{pem_text, CertKeyPair, CertificateInfo};
use crate::pki::constants::{
    peer_secret_name, serving_metrics_secret_name, serving_secret_name, CA_BUNDLE_KEY,
    ETCD_ALL_CERTS_SECRET, ETCD_CA_BUNDLE_CONFIGMAP, ETCD_CLIENT_SECRET,
    ETCD_METRICS_CA_BUNDLE_CONFIGMAP, ETCD_METRICS_CLIENT_SECRET, ETCD_METRICS_SIGNER_SECRET,
    ETCD_SIGNER_SECRET, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY,
};
use crate::pki::{
    build_bundle, issue_leaf, AuthorityAction, AuthorityManager, CertRole, LeafSpec,
    SignerSlots, SigningAuthority, TrustBundle,
};

/// A client certificate kept alongside a signer.
#[derive(Clone, Debug)]
pub struct ClientTarget {
    pub location: ResourceLocation,
    pub role: CertRole,
    pub user: &'static str,
    pub groups: &'static [&'static str],
}

/// One signing authority, its bundle, and everything it signs.
#[derive(Clone, Debug)]
pub struct SignerTarget {
    pub keypair: ResourceLocation,
    pub bundle: ResourceLocation,
    pub manager: AuthorityManager,
    /// Serving roles issued for every control-plane node.
    pub node_roles: Vec<CertRole>,
    pub clients: Vec<ClientTarget>,
}

impl SignerTarget {
    pub fn new(namespace: &str, keypair_name: &str, bundle_name: &str) -> Self {
        Self {
            keypair: ResourceLocation::new(namespace, keypair_name),
            bundle: ResourceLocation::new(namespace, bundle_name),
            manager: AuthorityManager::new(format!("{namespace}_{keypair_name}")),
            node_roles: Vec::new(),
            clients: Vec::new(),
        }
    }
}

/// The etcd signer (peer, serving, client) and the metrics signer.
pub fn default_signer_targets(namespace: &str) -> Vec<SignerTarget> {
    let mut etcd = SignerTarget::new(namespace, ETCD_SIGNER_SECRET, ETCD_CA_BUNDLE_CONFIGMAP);
    etcd.node_roles = vec![CertRole::Peer, CertRole::Server];
    etcd.clients = vec![ClientTarget {
        location: ResourceLocation::new(namespace, ETCD_CLIENT_SECRET),
        role: CertRole::Client,
        user: "etcd-client",
        groups: &["system:etcd", "etcd-client"],
    }];

    let mut metrics = SignerTarget::new(
        namespace,
        ETCD_METRICS_SIGNER_SECRET,
        ETCD_METRICS_CA_BUNDLE_CONFIGMAP,
    );
    metrics.node_roles = vec![CertRole::MetricsServer];
    metrics.clients = vec![ClientTarget {
        location: ResourceLocation::new(namespace, ETCD_METRICS_CLIENT_SECRET),
        role: CertRole::MetricsClient,
        user: "etcd-metric",
        groups: &["system:etcd", "etcd-metric"],
    }];

    vec![etcd, metrics]
}

/// Secret name of a node's serving leaf for `role`.
pub fn node_secret_name(role: CertRole, node_name: &str) -> Option<String> {
    match role {
        CertRole::Peer => Some(peer_secret_name(node_name)),
        CertRole::Server => Some(serving_secret_name(node_name)),
        CertRole::MetricsServer => Some(serving_metrics_secret_name(node_name)),
        CertRole::Client | CertRole::MetricsClient => None,
    }
}

/// Why a stored leaf gets replaced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReissueReason {
    Missing,
    Unparseable,
    Expiring,
    HostnamesChanged,
    SubjectChanged,
    UsageChanged,
    IssuerChanged,
}

impl std::fmt::Display for ReissueReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReissueReason::Missing => "certificate missing",
            ReissueReason::Unparseable => "stored certificate unparseable",
            ReissueReason::Expiring => "past refresh threshold",
            ReissueReason::HostnamesChanged => "hostnames changed",
            ReissueReason::SubjectChanged => "subject organization changed",
            ReissueReason::UsageChanged => "extended key usage changed",
            ReissueReason::IssuerChanged => "issued by a previous signer",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeafAction {
    Unchanged,
    Issued(ReissueReason),
}

/// Decide whether a stored leaf still satisfies `spec` under `authority`.
///
/// The common name is not compared: certificates minted offline carry a
/// placeholder identity and must not be churned for it.
pub fn reissue_reason(
    info: &CertificateInfo,
    spec: &LeafSpec,
    authority: &SigningAuthority,
    now: DateTime<Utc>,
) -> Option<ReissueReason> {
    if now >= info.not_after - spec.policy.refresh_margin() {
        return Some(ReissueReason::Expiring);
    }
    if info.issuer_common_name != authority.common_name() {
        return Some(ReissueReason::IssuerChanged);
    }
    if info.subject_alt_names != spec.san_set() {
        return Some(ReissueReason::HostnamesChanged);
    }
    if info.organizations != spec.organizations {
        return Some(ReissueReason::SubjectChanged);
    }
    if !info.client_auth || info.server_auth != spec.role.is_serving() {
        return Some(ReissueReason::UsageChanged);
    }
    None
}

fn keypair_data(pair: &CertKeyPair) -> ObjectData {
    let mut data = ObjectData::new();
    data.insert(TLS_CERT_KEY.to_string(), pair.cert_pem.clone().into_bytes());
    data.insert(TLS_PRIVATE_KEY_KEY.to_string(), pair.key_pem.clone().into_bytes());
    data
}

fn stored_keypair(obj: &StoredObject, location: &ResourceLocation) -> Result<CertKeyPair> {
    let field = |key: &str| {
        obj.field(key)
            .ok_or_else(|| Error::ParseError(format!("{location} has no {key} field")))
            .and_then(|data| pem_text(key, data))
    };
    Ok(CertKeyPair {
        cert_pem: field(TLS_CERT_KEY)?,
        key_pem: field(TLS_PRIVATE_KEY_KEY)?,
    })
}

/// Keep or rotate the signer stored at `target.keypair`.
///
/// A stored signer that cannot be parsed fails the pass and is never
/// overwritten.
#[instrument(skip_all, fields(signer = %target.keypair))]
pub async fn ensure_signer(state: &ControllerState, target: &SignerTarget) -> Result<SignerSlots> {
    let now = state.clock.now();
    let existing = state
        .store
        .get_optional(ObjectKind::KeyPair, &target.keypair)
        .await?;

    let current = match &existing {
        Some(obj) => {
            let pair = stored_keypair(obj, &target.keypair)?;
            Some(SigningAuthority::from_pem(
                &pair.cert_pem,
                &pair.key_pem,
                target.manager.policy(),
            )?)
        }
        None => None,
    };

    let (slots, action) = target.manager.ensure_slots(current, now)?;
    if action == AuthorityAction::Unchanged {
        debug!("Signer is current");
        return Ok(slots);
    }

    let data = keypair_data(&CertKeyPair {
        cert_pem: slots.current.cert_pem().to_string(),
        key_pem: slots.current.key_pem().to_string(),
    });
    let expected_version = existing.as_ref().and_then(|obj| obj.version.as_deref());
    state
        .store
        .create_or_update(ObjectKind::KeyPair, &target.keypair, data, expected_version)
        .await?;

    let (reason, verb) = match action {
        AuthorityAction::Created => ("SignerCreated", "Created"),
        _ => ("SignerRotated", "Rotated"),
    };
    info!(
        common_name = %slots.current.common_name(),
        not_after = %slots.current.not_after(),
        "{} signer", verb
    );
    state.recorder.record(
        reason,
        &format!(
            "{verb} signer {} valid until {}",
            target.keypair,
            slots.current.not_after()
        ),
    );
    Ok(slots)
}

/// Write the CA bundle at `location` so it holds every signer in `slots`
/// plus any still-valid signer it already held.
#[instrument(skip_all, fields(bundle = %location))]
pub async fn ensure_bundle(
    state: &ControllerState,
    location: &ResourceLocation,
    slots: &SignerSlots,
) -> Result<TrustBundle> {
    let now = state.clock.now();
    let existing = state.store.get_optional(ObjectKind::Bundle, location).await?;

    let mut bundle = build_bundle(slots.authorities());
    if let Some(data) = existing.as_ref().and_then(|obj| obj.field(CA_BUNDLE_KEY)) {
        let mut persisted = TrustBundle::from_pem_bytes(data)?;
        persisted.retain_valid(now);
        bundle.extend(&persisted);
    }

    let mut data = ObjectData::new();
    data.insert(CA_BUNDLE_KEY.to_string(), bundle.to_pem_bytes());
    let written = apply_if_changed(
        state.store.as_ref(),
        ObjectKind::Bundle,
        location,
        data,
        existing.as_ref(),
    )
    .await?;

    if written {
        info!(certificates = bundle.len(), "Updated CA bundle");
        state.recorder.record(
            "CABundleUpdated",
            &format!("CA bundle {} now holds {} certificate(s)", location, bundle.len()),
        );
    }
    Ok(bundle)
}

/// Issue the leaf at `location` if it is missing or no longer matches `spec`.
/// Returns the keypair now stored there.
#[instrument(skip_all, fields(leaf = %location, role = %spec.role))]
pub async fn ensure_leaf(
    state: &ControllerState,
    location: &ResourceLocation,
    spec: &LeafSpec,
    authority: &SigningAuthority,
) -> Result<(CertKeyPair, LeafAction)> {
    let now = state.clock.now();
    let existing = state
        .store
        .get_optional(ObjectKind::KeyPair, location)
        .await?;

    let reason = match &existing {
        None => ReissueReason::Missing,
        Some(obj) => match stored_keypair(obj, location).and_then(|pair| {
            let info = CertificateInfo::from_pem(pair.cert_pem.as_bytes())?;
            Ok((pair, info))
        }) {
            Ok((pair, info)) => match reissue_reason(&info, spec, authority, now) {
                None => return Ok((pair, LeafAction::Unchanged)),
                Some(reason) => reason,
            },
            Err(e) => {
                warn!("Replacing unreadable certificate: {}", e);
                ReissueReason::Unparseable
            }
        },
    };

    let pair = issue_leaf(authority, spec, now)?;
    let expected_version = existing.as_ref().and_then(|obj| obj.version.as_deref());
    state
        .store
        .create_or_update(
            ObjectKind::KeyPair,
            location,
            keypair_data(&pair),
            expected_version,
        )
        .await?;

    info!(reason = %reason, "Issued certificate");
    state.recorder.record(
        "CertificateIssued",
        &format!("Issued {} certificate {}: {}", spec.role, location, reason),
    );
    Ok((pair, LeafAction::Issued(reason)))
}

/// One full rotation pass over `targets`.
///
/// Failures of individual nodes or leaves are recorded and the rest of the
/// pass continues; the collected failures are returned at the end. The
/// aggregated `etcd-all-certs` secret is only rewritten when every node leaf
/// was available, so a partial pass never drops entries from it.
pub async fn reconcile_certificates(
    state: &ControllerState,
    namespace: &str,
    targets: &[SignerTarget],
) -> Result<()> {
    let mut failures = Vec::new();
    let mut complete = true;

    let mut node_ips = BTreeMap::new();
    match state.topology.control_plane_nodes().await {
        Ok(nodes) => {
            for node in nodes {
                match state.topology.internal_ips(&node).await {
                    Ok(ips) => {
                        node_ips.insert(node, ips);
                    }
                    Err(e) => {
                        state.recorder.warning(
                            "NodeAddressLookupFailed",
                            &format!("Skipping certificates for node {node}: {e}"),
                        );
                        complete = false;
                        failures.push(e);
                    }
                }
            }
        }
        Err(e) => {
            complete = false;
            failures.push(e);
        }
    }

    let mut all_certs = ObjectData::new();
    for target in targets {
        let slots = match ensure_signer(state, target).await {
            Ok(slots) => slots,
            Err(e) => {
                record_failure(state, &target.keypair, &e);
                complete = false;
                failures.push(e);
                continue;
            }
        };
        if let Err(e) = ensure_bundle(state, &target.bundle, &slots).await {
            record_failure(state, &target.bundle, &e);
            complete = false;
            failures.push(e);
            continue;
        }

        for (node, ips) in &node_ips {
            for role in &target.node_roles {
                let Some(name) = node_secret_name(*role, node) else {
                    continue;
                };
                let location = ResourceLocation::new(namespace, name);
                let result = match LeafSpec::serving(*role, node, ips) {
                    Ok(spec) => ensure_leaf(state, &location, &spec, &slots.current).await,
                    Err(e) => Err(e),
                };
                match result {
                    Ok((pair, _)) => {
                        all_certs.insert(
                            format!("{}.crt", location.name),
                            pair.cert_pem.into_bytes(),
                        );
                        all_certs.insert(
                            format!("{}.key", location.name),
                            pair.key_pem.into_bytes(),
                        );
                    }
                    Err(e) => {
                        record_failure(state, &location, &e);
                        complete = false;
                        failures.push(e);
                    }
                }
            }
        }

        for client in &target.clients {
            let result = match LeafSpec::client(client.role, client.user, client.groups) {
                Ok(spec) => ensure_leaf(state, &client.location, &spec, &slots.current).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                record_failure(state, &client.location, &e);
                failures.push(e);
            }
        }
    }

    if complete && !node_ips.is_empty() {
        let location = ResourceLocation::new(namespace, ETCD_ALL_CERTS_SECRET);
        if let Err(e) = ensure_all_certs(state, &location, all_certs).await {
            record_failure(state, &location, &e);
            failures.push(e);
        }
    }

    Error::from_failures(failures)
}

async fn ensure_all_certs(
    state: &ControllerState,
    location: &ResourceLocation,
    data: ObjectData,
) -> Result<()> {
    let existing = state
        .store
        .get_optional(ObjectKind::KeyPair, location)
        .await?;
    if apply_if_changed(
        state.store.as_ref(),
        ObjectKind::KeyPair,
        location,
        data,
        existing.as_ref(),
    )
    .await?
    {
        info!(secret = %location, "Updated aggregated node certificates");
    }
    Ok(())
}

fn record_failure(state: &ControllerState, location: &ResourceLocation, err: &Error) {
    warn!(resource = %location, class = ?err.class(), "Certificate reconcile failed: {}", err);
    state
        .recorder
        .warning("CertificateReconcileFailed", &format!("{location}: {err}"));
}
