//! In-memory collaborators for controller tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use super::events::EventRecorder;
use super::store::{ObjectData, ObjectKind, ObjectStore, ResourceLocation, StoredObject};
use super::topology::NodeTopology;
use super::ControllerState;
use crate::clock::Clock;
use crate::error::{Error, Result};

type Key = (ObjectKind, ResourceLocation);

#[derive(Default)]
struct StoreInner {
    objects: BTreeMap<Key, StoredObject>,
    next_version: u64,
    writes: Vec<Key>,
}

/// Object store with Kubernetes-like version semantics.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
    failing_reads: Mutex<BTreeSet<Key>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object without counting it as a write.
    pub fn insert(&self, kind: ObjectKind, location: &ResourceLocation, data: ObjectData) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_version += 1;
        let version = inner.next_version.to_string();
        inner.objects.insert(
            (kind, location.clone()),
            StoredObject {
                data,
                version: Some(version),
            },
        );
    }

    pub fn object(&self, kind: ObjectKind, location: &ResourceLocation) -> Option<StoredObject> {
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&(kind, location.clone()))
            .cloned()
    }

    pub fn field(
        &self,
        kind: ObjectKind,
        location: &ResourceLocation,
        key: &str,
    ) -> Option<Vec<u8>> {
        self.object(kind, location)
            .and_then(|obj| obj.data.get(key).cloned())
    }

    pub fn write_count(&self) -> usize {
        self.inner.lock().unwrap().writes.len()
    }

    pub fn writes_to(&self, kind: ObjectKind, location: &ResourceLocation) -> usize {
        let key = (kind, location.clone());
        self.inner
            .lock()
            .unwrap()
            .writes
            .iter()
            .filter(|k| **k == key)
            .count()
    }

    pub fn fail_reads(&self, kind: ObjectKind, location: &ResourceLocation) {
        self.failing_reads
            .lock()
            .unwrap()
            .insert((kind, location.clone()));
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, kind: ObjectKind, location: &ResourceLocation) -> Result<StoredObject> {
        let key = (kind, location.clone());
        if self.failing_reads.lock().unwrap().contains(&key) {
            return Err(Error::TopologyError(format!("injected read failure for {location}")));
        }
        self.inner
            .lock()
            .unwrap()
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(kind.as_str(), &location.namespace, &location.name))
    }

    async fn create_or_update(
        &self,
        kind: ObjectKind,
        location: &ResourceLocation,
        data: ObjectData,
        expected_version: Option<&str>,
    ) -> Result<()> {
        let key = (kind, location.clone());
        let mut inner = self.inner.lock().unwrap();
        let current = inner.objects.get(&key).and_then(|obj| obj.version.clone());
        match (expected_version, current.as_deref()) {
            (None, Some(_)) => {
                return Err(Error::Conflict(format!("{location} already exists")));
            }
            (Some(_), None) => {
                return Err(Error::not_found(
                    kind.as_str(),
                    &location.namespace,
                    &location.name,
                ));
            }
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(Error::Conflict(format!(
                    "{location} is at version {actual}, not {expected}"
                )));
            }
            _ => {}
        }

        inner.next_version += 1;
        let version = inner.next_version.to_string();
        inner.objects.insert(
            key.clone(),
            StoredObject {
                data,
                version: Some(version),
            },
        );
        inner.writes.push(key);
        Ok(())
    }
}

/// Fixed node list with per-node IPs that tests can change.
#[derive(Default)]
pub struct StaticTopology {
    nodes: Mutex<BTreeMap<String, Vec<String>>>,
    fail_listing: Mutex<bool>,
}

impl StaticTopology {
    pub fn with_nodes(nodes: &[(&str, &[&str])]) -> Self {
        let topology = Self::default();
        for (name, ips) in nodes {
            topology.set_ips(name, ips);
        }
        topology
    }

    pub fn set_ips(&self, node: &str, ips: &[&str]) {
        self.nodes.lock().unwrap().insert(
            node.to_string(),
            ips.iter().map(|ip| ip.to_string()).collect(),
        );
    }

    pub fn fail_listing(&self, fail: bool) {
        *self.fail_listing.lock().unwrap() = fail;
    }
}

#[async_trait]
impl NodeTopology for StaticTopology {
    async fn control_plane_nodes(&self) -> Result<Vec<String>> {
        if *self.fail_listing.lock().unwrap() {
            return Err(Error::TopologyError("node list unavailable".to_string()));
        }
        Ok(self.nodes.lock().unwrap().keys().cloned().collect())
    }

    async fn internal_ips(&self, node_name: &str) -> Result<Vec<String>> {
        self.nodes
            .lock()
            .unwrap()
            .get(node_name)
            .cloned()
            .ok_or_else(|| Error::TopologyError(format!("unknown node {node_name}")))
    }
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

#[derive(Default)]
pub struct RecordingRecorder {
    events: Mutex<Vec<(bool, String, String)>>,
}

impl RecordingRecorder {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(warning, _, _)| *warning)
            .map(|(_, reason, _)| reason.clone())
            .collect()
    }
}

impl EventRecorder for RecordingRecorder {
    fn record(&self, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((false, reason.to_string(), message.to_string()));
    }

    fn warning(&self, reason: &str, message: &str) {
        self.events
            .lock()
            .unwrap()
            .push((true, reason.to_string(), message.to_string()));
    }
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

/// A wired-up [`ControllerState`] plus handles to its concrete parts.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub topology: Arc<StaticTopology>,
    pub recorder: Arc<RecordingRecorder>,
    pub clock: Arc<ManualClock>,
    pub state: ControllerState,
}

impl Harness {
    pub fn new(topology: StaticTopology) -> Self {
        let store = Arc::new(MemoryStore::new());
        let topology = Arc::new(topology);
        let recorder = Arc::new(RecordingRecorder::default());
        let clock = Arc::new(ManualClock::new(start_time()));
        let state = ControllerState {
            store: store.clone(),
            topology: topology.clone(),
            recorder: recorder.clone(),
            clock: clock.clone(),
        };
        Self {
            store,
            topology,
            recorder,
            clock,
            state,
        }
    }

    /// A second handle on the same collaborators, for code that wants an `Arc`.
    pub fn shared_state(&self) -> Arc<ControllerState> {
        Arc::new(ControllerState {
            store: self.store.clone(),
            topology: self.topology.clone(),
            recorder: self.recorder.clone(),
            clock: self.clock.clone(),
        })
    }
}
