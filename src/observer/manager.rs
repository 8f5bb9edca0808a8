//! Background health observation.
//!
//! One task per cluster polls `_cluster/health` on a fixed interval and
//! publishes the latest result on a `watch` channel. Reconciliation reads the
//! last value without waiting for a fresh poll.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::client::{EsClient, Health};

/// Identifies an observed cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    pub namespace: String,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

struct Observation {
    /// Changes when the client must be rebuilt (endpoint, version).
    fingerprint: String,
    latest: watch::Receiver<Option<Health>>,
    task: JoinHandle<()>,
}

/// Keeps one health observer per cluster.
pub struct ObserverManager {
    interval: Duration,
    observations: Mutex<HashMap<ClusterKey, Observation>>,
}

impl ObserverManager {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            observations: Mutex::new(HashMap::new()),
        }
    }

    fn observations(&self) -> MutexGuard<'_, HashMap<ClusterKey, Observation>> {
        self.observations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ensures an observer runs for `key` with a client matching `fingerprint`,
    /// and returns the last observed health. `None` means the cluster has not
    /// answered yet or was unreachable on the last poll.
    pub fn observe<C>(&self, key: &ClusterKey, fingerprint: &str, client: Arc<C>) -> Option<Health>
    where
        C: EsClient + 'static,
    {
        let mut observations = self.observations();
        if let Some(existing) = observations.get(key)
            && existing.fingerprint == fingerprint
            && !existing.task.is_finished()
        {
            return existing.latest.borrow().clone();
        }

        if let Some(stale) = observations.remove(key) {
            debug!(cluster = %key, "Replacing health observer");
            stale.task.abort();
        }

        info!(cluster = %key, interval = ?self.interval, "Starting health observer");
        let (tx, rx) = watch::channel(None);
        let task = tokio::spawn(poll_health(key.clone(), client, tx, self.interval));
        observations.insert(
            key.clone(),
            Observation {
                fingerprint: fingerprint.to_string(),
                latest: rx,
                task,
            },
        );
        None
    }

    /// Last observed health, if an observer runs for `key`.
    pub fn latest(&self, key: &ClusterKey) -> Option<Health> {
        self.observations()
            .get(key)
            .and_then(|o| o.latest.borrow().clone())
    }

    /// Stops observing a cluster, e.g. once it is deleted.
    pub fn stop(&self, key: &ClusterKey) {
        if let Some(observation) = self.observations().remove(key) {
            info!(cluster = %key, "Stopping health observer");
            observation.task.abort();
        }
    }

    pub fn observed_clusters(&self) -> usize {
        self.observations().len()
    }
}

impl Drop for ObserverManager {
    fn drop(&mut self) {
        for (_, observation) in self.observations().drain() {
            observation.task.abort();
        }
    }
}

async fn poll_health<C: EsClient>(
    key: ClusterKey,
    client: Arc<C>,
    tx: watch::Sender<Option<Health>>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let health = match client.get_cluster_health().await {
            Ok(health) => Some(health),
            Err(e) => {
                debug!(cluster = %key, error = %e, "Cluster health observation failed");
                None
            }
        };
        let changed = tx.borrow().as_ref().map(|h| h.status) != health.as_ref().map(|h| h.status);
        if changed {
            info!(
                cluster = %key,
                health = %health.as_ref().map(|h| h.status.to_string()).unwrap_or_else(|| "unreachable".into()),
                "Cluster health changed"
            );
        }
        if tx.send(health).is_err() {
            break;
        }
    }
}
