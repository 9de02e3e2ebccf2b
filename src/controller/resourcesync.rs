//! Mirrors keypair and bundle objects between namespaces.
//!
//! A rule copies its source over its destination. A conditional rule first
//! checks that an anchor object exists and does nothing at all when it does
//! not, which lets the owner of a bundle move between namespaces without the
//! destination ever being emptied or deleted.

use std::collections::BTreeSet;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::store::{apply_if_changed, ObjectKind, ObjectStore, ResourceLocation};
use super::ControllerState;
use crate::config::OperatorConfig;
use crate::error::{Error, Result};
use crate::pki::constants::{
    ETCD_CA_BUNDLE_CONFIGMAP, ETCD_CLIENT_SECRET, ETCD_METRICS_CA_BUNDLE_CONFIGMAP,
    ETCD_METRICS_CLIENT_SECRET,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncMode {
    Unconditional,
    /// Only copy while an object of the rule's kind exists at `anchor`.
    Conditional { anchor: ResourceLocation },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncRule {
    pub kind: ObjectKind,
    pub source: ResourceLocation,
    pub destination: ResourceLocation,
    pub mode: SyncMode,
}

impl SyncRule {
    pub fn unconditional(
        kind: ObjectKind,
        source: ResourceLocation,
        destination: ResourceLocation,
    ) -> Self {
        Self {
            kind,
            source,
            destination,
            mode: SyncMode::Unconditional,
        }
    }

    pub fn conditional(
        kind: ObjectKind,
        source: ResourceLocation,
        destination: ResourceLocation,
        anchor: ResourceLocation,
    ) -> Self {
        Self {
            kind,
            source,
            destination,
            mode: SyncMode::Conditional { anchor },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Destination was created or overwritten.
    Copied,
    /// Destination already matched the source.
    UpToDate,
    /// Anchor absent; nothing was touched.
    PreconditionUnmet,
    /// Source absent; destination left as it was.
    SourceMissing,
}

/// Side-effect-free existence check for a rule's precondition.
pub async fn precondition_met(
    store: &dyn ObjectStore,
    kind: ObjectKind,
    mode: &SyncMode,
) -> Result<bool> {
    match mode {
        SyncMode::Unconditional => Ok(true),
        SyncMode::Conditional { anchor } => Ok(store.get_optional(kind, anchor).await?.is_some()),
    }
}

/// Run one rule. Errors other than a missing source are returned.
pub async fn sync_rule(store: &dyn ObjectStore, rule: &SyncRule) -> Result<SyncOutcome> {
    if !precondition_met(store, rule.kind, &rule.mode).await? {
        return Ok(SyncOutcome::PreconditionUnmet);
    }

    let Some(source) = store.get_optional(rule.kind, &rule.source).await? else {
        return Ok(SyncOutcome::SourceMissing);
    };
    let destination = store.get_optional(rule.kind, &rule.destination).await?;

    let written = apply_if_changed(
        store,
        rule.kind,
        &rule.destination,
        source.data,
        destination.as_ref(),
    )
    .await?;
    Ok(if written {
        SyncOutcome::Copied
    } else {
        SyncOutcome::UpToDate
    })
}

/// Run every rule once, stopping early (between rules) if `shutdown` fires.
///
/// A missing source is reported and skipped. Any other failure is collected
/// and the remaining rules still run; the pass then returns the failures.
pub async fn reconcile_rules(
    state: &ControllerState,
    rules: &[SyncRule],
    shutdown: &watch::Receiver<bool>,
) -> Result<Vec<SyncOutcome>> {
    let mut outcomes = Vec::with_capacity(rules.len());
    let mut failures = Vec::new();

    for rule in rules {
        if *shutdown.borrow() {
            info!("Shutdown requested, stopping resource sync between rules");
            break;
        }

        match sync_rule(state.store.as_ref(), rule).await {
            Ok(outcome) => {
                match outcome {
                    SyncOutcome::Copied => state.recorder.record(
                        "TargetUpdated",
                        &format!(
                            "Synced {} {} to {}",
                            rule.kind.as_str(),
                            rule.source,
                            rule.destination
                        ),
                    ),
                    SyncOutcome::SourceMissing => state.recorder.warning(
                        "SourceMissing",
                        &format!(
                            "{} {} does not exist yet, {} left unchanged",
                            rule.kind.as_str(),
                            rule.source,
                            rule.destination
                        ),
                    ),
                    SyncOutcome::PreconditionUnmet => {
                        debug!(destination = %rule.destination, "Sync precondition not met")
                    }
                    SyncOutcome::UpToDate => {
                        debug!(destination = %rule.destination, "Destination up to date")
                    }
                }
                outcomes.push(outcome);
            }
            Err(e) => {
                warn!(
                    source = %rule.source,
                    destination = %rule.destination,
                    "Resource sync failed: {}", e
                );
                state.recorder.warning(
                    "ResourceSyncFailed",
                    &format!("{} -> {}: {}", rule.source, rule.destination, e),
                );
                failures.push(e);
            }
        }
    }

    Error::from_failures(failures)?;
    Ok(outcomes)
}

/// Reject rule sets where two rules write the same destination or a rule
/// copies an object onto itself.
pub fn validate_rules(rules: &[SyncRule]) -> Result<()> {
    let mut destinations = BTreeSet::new();
    for rule in rules {
        if rule.source == rule.destination {
            return Err(Error::ConfigError(format!(
                "sync rule copies {} onto itself",
                rule.source
            )));
        }
        if !destinations.insert((rule.kind, rule.destination.clone())) {
            return Err(Error::ConfigError(format!(
                "more than one sync rule writes {} {}",
                rule.kind.as_str(),
                rule.destination
            )));
        }
    }
    Ok(())
}

/// The mirrors the etcd trust material needs.
pub fn default_sync_rules(config: &OperatorConfig) -> Vec<SyncRule> {
    let target = config.target_namespace.as_str();
    let operator = config.operator_namespace.as_str();
    let global = config.global_config_namespace.as_str();
    let loc = ResourceLocation::new;

    let ca_bundle = loc(target, ETCD_CA_BUNDLE_CONFIGMAP);
    let metrics_bundle = loc(target, ETCD_METRICS_CA_BUNDLE_CONFIGMAP);

    let mut rules = vec![SyncRule::unconditional(
        ObjectKind::Bundle,
        loc(config.kube_system_namespace.as_str(), "cluster-config-v1"),
        loc(target, "cluster-config-v1"),
    )];

    for destination in [
        loc(operator, ETCD_CA_BUNDLE_CONFIGMAP),
        loc(target, "etcd-peer-client-ca"),
        // etcd-serving-ca is superseded by etcd-ca-bundle but still consumed.
        loc(target, "etcd-serving-ca"),
        loc(global, "etcd-serving-ca"),
    ] {
        rules.push(SyncRule::conditional(
            ObjectKind::Bundle,
            ca_bundle.clone(),
            destination,
            ca_bundle.clone(),
        ));
    }

    for destination in [
        loc(global, "etcd-metric-serving-ca"),
        loc(target, "etcd-metrics-proxy-client-ca"),
        loc(operator, "etcd-metric-serving-ca"),
        loc(target, "etcd-metrics-proxy-serving-ca"),
    ] {
        rules.push(SyncRule::conditional(
            ObjectKind::Bundle,
            metrics_bundle.clone(),
            destination,
            metrics_bundle.clone(),
        ));
    }

    rules.push(SyncRule::unconditional(
        ObjectKind::KeyPair,
        loc(target, ETCD_METRICS_CLIENT_SECRET),
        loc(operator, ETCD_METRICS_CLIENT_SECRET),
    ));
    rules.push(SyncRule::unconditional(
        ObjectKind::KeyPair,
        loc(target, ETCD_CLIENT_SECRET),
        loc(operator, ETCD_CLIENT_SECRET),
    ));
    rules.push(SyncRule::unconditional(
        ObjectKind::KeyPair,
        loc(target, ETCD_CLIENT_SECRET),
        loc(global, ETCD_CLIENT_SECRET),
    ));

    rules
}
