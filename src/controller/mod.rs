//! Controllers for etcd certificates and trust material.
//!
//! Both controllers are plain async functions over [`ControllerState`]; the
//! cluster is only reached through the injected store, topology, recorder
//! and clock.

use std::sync::Arc;

pub mod certrotation;
pub mod events;
pub mod resourcesync;
pub mod runner;
pub mod store;
#[cfg(test)]
mod testing;
pub mod topology;

pub use certrotation::{
    default_signer_targets, ensure_bundle, ensure_leaf, ensure_signer, reconcile_certificates,
    LeafAction, ReissueReason, SignerTarget,
};
pub use events::{EventRecorder, KubeEventRecorder, LogRecorder};
pub use resourcesync::{
    default_sync_rules, reconcile_rules, sync_rule, SyncMode, SyncOutcome, SyncRule,
};
pub use runner::Operator;
pub use store::{KubeObjectStore, ObjectKind, ObjectStore, ResourceLocation, StoredObject};
pub use topology::{KubeNodeTopology, NodeTopology};

use crate::clock::Clock;

/// Collaborators shared by every controller.
pub struct ControllerState {
    pub store: Arc<dyn ObjectStore>,
    pub topology: Arc<dyn NodeTopology>,
    pub recorder: Arc<dyn EventRecorder>,
    pub clock: Arc<dyn Clock>,
}
