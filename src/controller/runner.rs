//! Periodic reconcile loop with backoff and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use super::certrotation::{reconcile_certificates, SignerTarget};
use super::resourcesync::{reconcile_rules, validate_rules, SyncRule};
use super::ControllerState;
use crate::error::Result;

const BACKOFF_BASE_SECS: u64 = 15;
const BACKOFF_MAX_SECS: u64 = 300;

pub struct Operator {
    state: Arc<ControllerState>,
    namespace: String,
    signers: Vec<SignerTarget>,
    rules: Vec<SyncRule>,
    interval: Duration,
}

impl Operator {
    pub fn new(
        state: Arc<ControllerState>,
        namespace: impl Into<String>,
        signers: Vec<SignerTarget>,
        rules: Vec<SyncRule>,
        interval: Duration,
    ) -> Result<Self> {
        validate_rules(&rules)?;
        Ok(Self {
            state,
            namespace: namespace.into(),
            signers,
            rules,
            interval,
        })
    }

    /// One pass: certificates first, then mirrors, so freshly written
    /// bundles are copied in the same pass.
    pub async fn reconcile_once(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let certs = reconcile_certificates(&self.state, &self.namespace, &self.signers).await;
        if *shutdown.borrow() {
            return certs;
        }
        let sync = reconcile_rules(&self.state, &self.rules, shutdown).await;

        match (certs, sync) {
            (Ok(()), Ok(_)) => Ok(()),
            (Err(e), Ok(_)) | (Ok(()), Err(e)) => Err(e),
            (Err(a), Err(b)) => Err(crate::Error::Reconcile(vec![a, b])),
        }
    }

    /// Delay before the next pass. Consecutive failures back off from 15s,
    /// doubling up to 300s; a success resets the count.
    fn next_delay(&self, failures: &mut u32, succeeded: bool) -> Duration {
        if succeeded {
            *failures = 0;
            return self.interval;
        }
        let exponent = (*failures).min(5);
        *failures = failures.saturating_add(1);
        Duration::from_secs((BACKOFF_BASE_SECS << exponent).min(BACKOFF_MAX_SECS))
    }

    /// Run passes until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            namespace = %self.namespace,
            signers = self.signers.len(),
            rules = self.rules.len(),
            interval_secs = self.interval.as_secs(),
            "Starting etcd PKI controllers"
        );

        let mut failures: u32 = 0;
        while !*shutdown.borrow() {
            let result = self.reconcile_once(&shutdown).await;
            let delay = self.next_delay(&mut failures, result.is_ok());
            match result {
                Ok(()) => info!("Reconcile pass complete"),
                Err(e) => warn!(
                    class = ?e.class(),
                    retry_in_secs = delay.as_secs(),
                    "Reconcile pass failed: {}", e
                ),
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        error!("Shutdown channel closed, stopping");
                        break;
                    }
                }
            }
        }

        info!("etcd PKI controllers stopped");
        Ok(())
    }
}
