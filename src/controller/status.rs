//! Status management utilities.
//!
//! `ReconcileState` collects everything a pass wants to report (phase,
//! events, per-node operation progress) while planners run. It is an output
//! sink only: planners never read back from it. The reconciler turns it into
//! a status patch and Kubernetes events once the pass is over.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::crd::{
    Condition, DownscaleOperation, DownscaledNode, Elasticsearch, ElasticsearchHealth,
    ElasticsearchPhase, ElasticsearchStatus, InProgressOperations, UpgradeOperation, UpgradedNode,
};
use crate::client::ShutdownStatus;
use crate::shutdown::{NodeShutdownStatus, ShutdownObserver};

use super::results::Results;

/// Event reason for risky or degraded situations.
pub const EVENT_REASON_UNHEALTHY: &str = "Unhealthy";
/// Event reason for topology changes waiting on the cluster.
pub const EVENT_REASON_DELAYED: &str = "Delayed";
/// Event reason for topology changes that cannot make progress.
pub const EVENT_REASON_STALLED: &str = "Stalled";
/// Event reason for an invalid resource.
pub const EVENT_REASON_VALIDATION: &str = "ValidationFailed";

/// Upgrade status of a node waiting for its restart.
pub const UPGRADE_PENDING: &str = "PENDING";
/// Upgrade status of a node whose pod was deleted.
pub const UPGRADE_DELETED: &str = "DELETED";

/// Builder for managing conditions list
pub struct ConditionBuilder {
    conditions: Vec<Condition>,
}

impl ConditionBuilder {
    /// Create a new condition builder
    pub fn new() -> Self {
        Self {
            conditions: Vec::new(),
        }
    }

    /// Start from existing conditions
    pub fn from_conditions(conditions: &[Condition]) -> Self {
        Self {
            conditions: conditions.to_vec(),
        }
    }

    /// Add or update a condition. The transition time is kept when the status
    /// does not change.
    pub fn set(&mut self, mut condition: Condition) -> &mut Self {
        if let Some(existing) = self
            .conditions
            .iter_mut()
            .find(|c| c.r#type == condition.r#type)
        {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        } else {
            self.conditions.push(condition);
        }
        self
    }

    /// Set Ready condition
    pub fn ready(
        &mut self,
        ready: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::ready(ready, reason, message, generation))
    }

    /// Set ReconciliationComplete condition
    pub fn reconciliation_complete(
        &mut self,
        complete: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::reconciliation_complete(
            complete, reason, message, generation,
        ))
    }

    /// Set ElasticsearchIsReachable condition
    pub fn elasticsearch_reachable(
        &mut self,
        reachable: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> &mut Self {
        self.set(Condition::elasticsearch_reachable(
            reachable, reason, message, generation,
        ))
    }

    /// Build the conditions list
    pub fn build(self) -> Vec<Condition> {
        self.conditions
    }
}

impl Default for ConditionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "True")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Normal,
    Warning,
}

/// A Kubernetes event to publish at the end of the pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub kind: EventKind,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct StateInner {
    phase: ElasticsearchPhase,
    events: Vec<RecordedEvent>,
    operations: InProgressOperations,
    health: Option<ElasticsearchHealth>,
    available_nodes: Option<i32>,
    version: Option<String>,
}

/// Reporting sink shared by every step of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileState {
    inner: Mutex<StateInner>,
}

fn now() -> String {
    jiff::Timestamp::now().to_string()
}

impl ReconcileState {
    /// Starts from the operations recorded in the current status so that
    /// unchanged entries keep their timestamps.
    pub fn new(es: &Elasticsearch) -> Self {
        let operations = es
            .status
            .as_ref()
            .map(|s| s.in_progress_operations.clone())
            .unwrap_or_default();
        Self {
            inner: Mutex::new(StateInner {
                operations,
                ..StateInner::default()
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raises the phase; a less significant phase never overrides a more
    /// significant one within the same pass.
    pub fn update_phase(&self, phase: ElasticsearchPhase) -> &Self {
        let mut inner = self.inner();
        inner.phase = inner.phase.merge(phase);
        self
    }

    pub fn phase(&self) -> ElasticsearchPhase {
        self.inner().phase
    }

    pub fn add_event(&self, kind: EventKind, reason: &str, message: impl Into<String>) -> &Self {
        self.inner().events.push(RecordedEvent {
            kind,
            reason: reason.to_string(),
            message: message.into(),
        });
        self
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.inner().events.clone()
    }

    pub fn update_health(&self, health: ElasticsearchHealth, available_nodes: i32) -> &Self {
        let mut inner = self.inner();
        inner.health = Some(health);
        inner.available_nodes = Some(available_nodes);
        self
    }

    pub fn update_version(&self, version: impl Into<String>) -> &Self {
        self.inner().version = Some(version.into());
        self
    }

    pub fn operations(&self) -> InProgressOperations {
        self.inner().operations.clone()
    }

    /// Replaces the set of leaving nodes. Known nodes keep their last
    /// reported shutdown status.
    pub fn record_nodes_to_be_removed(&self, names: &[String]) {
        let mut sorted = names.to_vec();
        sorted.sort();
        let mut inner = self.inner();
        let current = &inner.operations.downscale;
        let nodes: Vec<DownscaledNode> = sorted
            .into_iter()
            .map(|name| {
                current
                    .nodes
                    .iter()
                    .find(|n| n.name == name)
                    .cloned()
                    .unwrap_or_else(|| DownscaledNode {
                        name,
                        shutdown_status: ShutdownStatus::NotStarted.to_string(),
                        explanation: None,
                    })
            })
            .collect();
        update_downscale(&mut inner.operations.downscale, nodes);
    }

    /// Marks nodes whose shutdown was requested as in progress. Other
    /// recorded nodes are left alone.
    pub fn record_shutdowns_started(&self, names: &[String]) {
        let mut inner = self.inner();
        let mut nodes = inner.operations.downscale.nodes.clone();
        for name in names {
            match nodes.iter_mut().find(|n| &n.name == name) {
                Some(node) => node.shutdown_status = ShutdownStatus::InProgress.to_string(),
                None => nodes.push(DownscaledNode {
                    name: name.clone(),
                    shutdown_status: ShutdownStatus::InProgress.to_string(),
                    explanation: None,
                }),
            }
        }
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        update_downscale(&mut inner.operations.downscale, nodes);
    }

    pub fn record_downscale_status(&self, name: &str, status: &NodeShutdownStatus) {
        let mut inner = self.inner();
        let mut nodes = inner.operations.downscale.nodes.clone();
        match nodes.iter_mut().find(|n| n.name == name) {
            Some(node) => {
                node.shutdown_status = status.status.to_string();
                node.explanation = status.explanation.clone();
            }
            None => nodes.push(DownscaledNode {
                name: name.to_string(),
                shutdown_status: status.status.to_string(),
                explanation: status.explanation.clone(),
            }),
        }
        update_downscale(&mut inner.operations.downscale, nodes);
    }

    /// Replaces the set of nodes waiting for a restart. Known nodes keep
    /// their status.
    pub fn record_nodes_to_be_upgraded(&self, names: &[String]) {
        let mut sorted = names.to_vec();
        sorted.sort();
        let mut inner = self.inner();
        let current = &inner.operations.upgrade;
        let nodes: Vec<UpgradedNode> = sorted
            .into_iter()
            .map(|name| {
                current
                    .nodes
                    .iter()
                    .find(|n| n.name == name)
                    .cloned()
                    .unwrap_or_else(|| UpgradedNode {
                        name,
                        status: UPGRADE_PENDING.to_string(),
                        message: None,
                        predicate: None,
                    })
            })
            .collect();
        update_upgrade(&mut inner.operations.upgrade, nodes);
    }

    pub fn record_deleted_node(&self, name: &str, message: &str) {
        let mut inner = self.inner();
        let mut nodes = inner.operations.upgrade.nodes.clone();
        let node = UpgradedNode {
            name: name.to_string(),
            status: UPGRADE_DELETED.to_string(),
            message: Some(message.to_string()),
            predicate: None,
        };
        match nodes.iter_mut().find(|n| n.name == name) {
            Some(existing) => *existing = node,
            None => nodes.push(node),
        }
        update_upgrade(&mut inner.operations.upgrade, nodes);
    }

    /// Sets the message of the given nodes still waiting for a restart.
    pub fn record_upgrade_message(&self, names: &[String], message: &str) {
        let mut inner = self.inner();
        let mut nodes = inner.operations.upgrade.nodes.clone();
        for node in nodes
            .iter_mut()
            .filter(|n| n.status == UPGRADE_PENDING && names.contains(&n.name))
        {
            node.message = Some(message.to_string());
        }
        update_upgrade(&mut inner.operations.upgrade, nodes);
    }

    /// Records, per pod, the predicate preventing its restart. Pods absent
    /// from `failures` have their previous predicate cleared.
    pub fn record_predicates_result(&self, failures: &BTreeMap<String, String>) {
        let mut inner = self.inner();
        let mut nodes = inner.operations.upgrade.nodes.clone();
        for node in nodes.iter_mut().filter(|n| n.status == UPGRADE_PENDING) {
            match failures.get(&node.name) {
                Some(predicate) => {
                    node.predicate = Some(predicate.clone());
                    node.message = Some(format!(
                        "Cannot restart node because of failed predicate: {predicate}"
                    ));
                }
                None => {
                    node.predicate = None;
                    node.message = None;
                }
            }
        }
        update_upgrade(&mut inner.operations.upgrade, nodes);
    }

    /// Builds the status to write back from the current one and the outcome
    /// of the pass.
    pub fn build_status(
        &self,
        es: &Elasticsearch,
        results: &Results,
        reachable: bool,
    ) -> ElasticsearchStatus {
        let current = es.status.clone().unwrap_or_default();
        let generation = es.metadata.generation;
        let inner = self.inner();

        let phase = if inner.phase == ElasticsearchPhase::Unknown {
            if results.is_reconciled() {
                ElasticsearchPhase::Ready
            } else {
                ElasticsearchPhase::ApplyingChanges
            }
        } else {
            inner.phase
        };

        let mut conditions = ConditionBuilder::from_conditions(&current.conditions);
        let reason = results.reason().unwrap_or_default();
        conditions
            .reconciliation_complete(
                results.is_reconciled(),
                if results.is_reconciled() {
                    "Reconciled"
                } else {
                    "InProgress"
                },
                reason,
                generation,
            )
            .ready(phase == ElasticsearchPhase::Ready, &phase.to_string(), reason, generation)
            .elasticsearch_reachable(
                reachable,
                if reachable { "Reachable" } else { "Unreachable" },
                "",
                generation,
            );

        ElasticsearchStatus {
            phase,
            health: if reachable {
                inner.health.unwrap_or(current.health)
            } else {
                ElasticsearchHealth::Unknown
            },
            available_nodes: inner.available_nodes.unwrap_or(current.available_nodes),
            version: inner.version.clone().or(current.version),
            observed_generation: generation,
            conditions: conditions.build(),
            in_progress_operations: inner.operations.clone(),
        }
    }
}

fn update_downscale(op: &mut DownscaleOperation, nodes: Vec<DownscaledNode>) {
    let stalled = nodes
        .iter()
        .any(|n| n.shutdown_status == ShutdownStatus::Stalled.to_string());
    if op.nodes != nodes {
        op.last_updated_time = Some(now());
        op.nodes = nodes;
    }
    op.stalled = stalled.then_some(true);
}

fn update_upgrade(op: &mut UpgradeOperation, nodes: Vec<UpgradedNode>) {
    if op.nodes != nodes {
        op.last_updated_time = Some(now());
        op.nodes = nodes;
    }
}

impl ShutdownObserver for ReconcileState {
    fn on_reconcile_shutdowns(&self, leaving_nodes: &[String]) {
        self.record_shutdowns_started(leaving_nodes);
    }

    fn on_shutdown_status(&self, node_name: &str, status: &NodeShutdownStatus) {
        self.record_downscale_status(node_name, status);
    }
}
