//! Operator configuration.
//!
//! Defaults match a standard cluster layout; a TOML file may override any
//! field. Command-line flags are applied on top by `main`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::controller::topology::DEFAULT_CONTROL_PLANE_SELECTOR;
use crate::error::{Error, Result};
use crate::pki::ciphers::filter_supported;
use crate::pki::constants::{
    GLOBAL_CONFIG_NAMESPACE, KUBE_SYSTEM_NAMESPACE, OPERATOR_NAMESPACE, TARGET_NAMESPACE,
};

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct OperatorConfig {
    /// Namespace of etcd and its certificates.
    pub target_namespace: String,
    pub operator_namespace: String,
    pub global_config_namespace: String,
    pub kube_system_namespace: String,
    /// Seconds between reconcile passes.
    pub resync_interval_secs: u64,
    /// Label selector for nodes that run etcd.
    pub control_plane_selector: String,
    /// Post Kubernetes Events in addition to logging.
    pub record_events: bool,
    /// Cipher suites requested for etcd's listeners.
    pub tls_cipher_suites: Vec<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            target_namespace: TARGET_NAMESPACE.to_string(),
            operator_namespace: OPERATOR_NAMESPACE.to_string(),
            global_config_namespace: GLOBAL_CONFIG_NAMESPACE.to_string(),
            kube_system_namespace: KUBE_SYSTEM_NAMESPACE.to_string(),
            resync_interval_secs: 60,
            control_plane_selector: DEFAULT_CONTROL_PLANE_SELECTOR.to_string(),
            record_events: true,
            tls_cipher_suites: Vec::new(),
        }
    }
}

impl OperatorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| Error::ConfigError(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.resync_interval_secs == 0 {
            return Err(Error::ConfigError(
                "resyncIntervalSecs must be greater than zero".to_string(),
            ));
        }
        for (field, value) in [
            ("targetNamespace", &self.target_namespace),
            ("operatorNamespace", &self.operator_namespace),
            ("globalConfigNamespace", &self.global_config_namespace),
            ("kubeSystemNamespace", &self.kube_system_namespace),
        ] {
            if value.is_empty() {
                return Err(Error::ConfigError(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    /// Requested cipher suites that etcd can actually use.
    pub fn etcd_cipher_suites(&self) -> Vec<String> {
        filter_supported(&self.tls_cipher_suites)
    }
}
