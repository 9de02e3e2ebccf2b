//! Fire-and-forget event recording.

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{info, warn};

pub trait EventRecorder: Send + Sync {
    fn record(&self, reason: &str, message: &str);
    fn warning(&self, reason: &str, message: &str);
}

/// Records events to the log only.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogRecorder;

impl EventRecorder for LogRecorder {
    fn record(&self, reason: &str, message: &str) {
        info!(reason, "{}", message);
    }

    fn warning(&self, reason: &str, message: &str) {
        warn!(reason, "{}", message);
    }
}

/// Posts core/v1 Events against the operator's namespace. Each event is sent
/// from a spawned task; failures are logged and otherwise ignored.
#[derive(Clone)]
pub struct KubeEventRecorder {
    client: Client,
    namespace: String,
}

impl KubeEventRecorder {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn emit(&self, event_type: &str, reason: &str, message: &str) {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &self.namespace);
        let time = Utc::now();
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some("etcd-pki-operator-".to_string()),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Namespace".to_string()),
                name: Some(self.namespace.clone()),
                ..Default::default()
            },
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };
        let reason = reason.to_string();

        tokio::spawn(async move {
            if let Err(e) = events.create(&PostParams::default(), &event).await {
                warn!(reason = %reason, "Failed to record event: {}", e);
            }
        });
    }
}

impl EventRecorder for KubeEventRecorder {
    fn record(&self, reason: &str, message: &str) {
        info!(reason, "{}", message);
        self.emit("Normal", reason, message);
    }

    fn warning(&self, reason: &str, message: &str) {
        warn!(reason, "{}", message);
        self.emit("Warning", reason, message);
    }
}
