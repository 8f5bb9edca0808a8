//! Elasticsearch Custom Resource Definition.
//!
//! Describes the desired topology of an Elasticsearch cluster (one entry per
//! node set, each backed by a StatefulSet) and the change budget the operator
//! must respect while moving the cluster towards it.

use std::collections::BTreeSet;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation listing upgrade predicates whose veto should be ignored.
/// Comma-separated predicate names, or `*` for all of them.
pub const DISABLE_UPGRADE_PREDICATES_ANNOTATION: &str =
    "eck.k8s.elastic.co/disable-upgrade-predicates";

/// Annotation recording that voting config exclusions were set by the operator
/// and must eventually be cleared.
pub const VOTING_CONFIG_EXCLUSIONS_ANNOTATION: &str =
    "elasticsearch.k8s.elastic.co/voting-config-exclusions";

/// Elasticsearch is a custom resource describing an Elasticsearch cluster.
///
/// Example:
/// ```yaml
/// apiVersion: elasticsearch.k8s.elastic.co/v1
/// kind: Elasticsearch
/// metadata:
///   name: quickstart
/// spec:
///   version: 8.15.0
///   nodeSets:
///     - name: masters
///       count: 3
///       roles: [master]
///     - name: data
///       count: 4
///       roles: [data, ingest]
///   updateStrategy:
///     changeBudget:
///       maxUnavailable: 1
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "elasticsearch.k8s.elastic.co",
    version = "v1",
    kind = "Elasticsearch",
    plural = "elasticsearches",
    shortname = "es",
    status = "ElasticsearchStatus",
    namespaced,
    printcolumn = r#"{"name":"Health", "type":"string", "jsonPath":".status.health"}"#,
    printcolumn = r#"{"name":"Nodes", "type":"integer", "jsonPath":".status.availableNodes"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchSpec {
    /// Elasticsearch version (e.g. "8.15.0").
    pub version: String,

    /// Node sets making up the cluster. Each one maps to a StatefulSet.
    #[serde(default)]
    pub node_sets: Vec<NodeSetSpec>,

    /// Controls how topology changes are rolled out.
    #[serde(default)]
    pub update_strategy: UpdateStrategy,

    /// HTTP layer settings used to reach the cluster.
    #[serde(default)]
    pub http: HttpSpec,
}

/// A homogeneous group of Elasticsearch nodes.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSetSpec {
    /// Name of the node set, unique within the cluster.
    pub name: String,

    /// Number of nodes in this set.
    #[serde(default)]
    pub count: i32,

    /// Node roles. Defaults to `master` + `data` when empty.
    #[serde(default)]
    pub roles: Vec<String>,
}

impl NodeSetSpec {
    /// Whether nodes of this set are master-eligible.
    pub fn is_master(&self) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|r| r == "master")
    }

    /// Whether nodes of this set hold data.
    pub fn is_data(&self) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|r| r == "data" || r.starts_with("data_"))
    }
}

/// Update strategy settings.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStrategy {
    #[serde(default)]
    pub change_budget: ChangeBudget,
}

/// Limits on how many nodes may be unavailable during a change.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChangeBudget {
    /// Maximum number of unavailable nodes. Defaults to 1 when unset.
    /// A negative value removes the limit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<i32>,
}

/// Default value of `maxUnavailable` when the user did not set one.
pub const DEFAULT_MAX_UNAVAILABLE: i32 = 1;

impl ChangeBudget {
    /// Effective budget: `None` means unbounded.
    pub fn max_unavailable_or_default(&self) -> Option<i32> {
        match self.max_unavailable {
            None => Some(DEFAULT_MAX_UNAVAILABLE),
            Some(v) if v < 0 => None,
            Some(v) => Some(v),
        }
    }
}

/// HTTP settings for reaching the Elasticsearch API.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpSpec {
    /// Whether the HTTP layer is served over TLS (default: true).
    #[serde(default = "default_tls_enabled")]
    pub tls_enabled: bool,

    /// HTTP port (default: 9200).
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpSpec {
    fn default() -> Self {
        Self {
            tls_enabled: default_tls_enabled(),
            port: default_http_port(),
        }
    }
}

fn default_tls_enabled() -> bool {
    true
}

fn default_http_port() -> u16 {
    9200
}

impl Elasticsearch {
    /// Predicate names disabled through the annotation.
    pub fn disabled_predicates(&self) -> BTreeSet<String> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(DISABLE_UPGRADE_PREDICATES_ANNOTATION))
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether voting config exclusions were recorded by a previous pass.
    pub fn has_voting_config_exclusions(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(VOTING_CONFIG_EXCLUSIONS_ANNOTATION))
            .is_some_and(|v| v == "true")
    }

    /// Names of the StatefulSets this cluster expects, with their replica count.
    pub fn expected_groups(&self) -> Vec<crate::topology::TopologyGroup> {
        let name = self.metadata.name.as_deref().unwrap_or_default();
        self.spec
            .node_sets
            .iter()
            .map(|ns| crate::topology::TopologyGroup {
                name: crate::topology::statefulset_name(name, &ns.name),
                replicas: ns.count.max(0),
                master: ns.is_master(),
                data: ns.is_data(),
            })
            .collect()
    }

    /// Names of every master pod the desired topology will run.
    pub fn expected_master_names(&self) -> Vec<String> {
        self.expected_groups()
            .iter()
            .filter(|g| g.master)
            .flat_map(|g| g.pod_names())
            .collect()
    }
}

/// Status of an Elasticsearch cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ElasticsearchStatus {
    /// Current phase.
    #[serde(default)]
    pub phase: ElasticsearchPhase,

    /// Last observed cluster health ("green", "yellow", "red", "unknown").
    #[serde(default)]
    pub health: ElasticsearchHealth,

    /// Number of ready nodes.
    #[serde(default)]
    pub available_nodes: i32,

    /// Lowest running Elasticsearch version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// The generation most recently observed by the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Operations currently in flight.
    #[serde(default)]
    pub in_progress_operations: InProgressOperations,
}

/// Topology changes in flight.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InProgressOperations {
    #[serde(default)]
    pub downscale: DownscaleOperation,
    #[serde(default)]
    pub upgrade: UpgradeOperation,
}

/// Nodes scheduled for removal.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownscaleOperation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_time: Option<String>,
    #[serde(default)]
    pub nodes: Vec<DownscaledNode>,
    /// Set when at least one shutdown is stalled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stalled: Option<bool>,
}

/// A node leaving the cluster.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DownscaledNode {
    pub name: String,
    /// Shutdown status as reported by Elasticsearch.
    #[serde(default)]
    pub shutdown_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

/// Nodes pending a restart.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeOperation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_time: Option<String>,
    #[serde(default)]
    pub nodes: Vec<UpgradedNode>,
}

/// A node pending a restart, with the reason it is still waiting if any.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpgradedNode {
    pub name: String,
    /// "PENDING" or "DELETED".
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Name of the predicate currently preventing the restart.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<String>,
}

/// Cluster health as reported by `_cluster/health`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ElasticsearchHealth {
    Green,
    Yellow,
    Red,
    #[default]
    Unknown,
}

impl std::fmt::Display for ElasticsearchHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElasticsearchHealth::Green => write!(f, "green"),
            ElasticsearchHealth::Yellow => write!(f, "yellow"),
            ElasticsearchHealth::Red => write!(f, "red"),
            ElasticsearchHealth::Unknown => write!(f, "unknown"),
        }
    }
}

/// ElasticsearchPhase is the lifecycle phase reported in status.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ElasticsearchPhase {
    /// Nothing is known about the cluster yet.
    #[default]
    Unknown,
    /// Cluster matches the desired topology.
    Ready,
    /// Topology changes are being applied.
    ApplyingChanges,
    /// Data is being moved off leaving nodes.
    MigratingData,
    /// A node shutdown cannot make progress.
    NodeShutdownStalled,
    /// The resource is invalid.
    Invalid,
}

impl ElasticsearchPhase {
    /// Phases that should not be overwritten by a less specific one.
    fn priority(self) -> u8 {
        match self {
            ElasticsearchPhase::Unknown => 0,
            ElasticsearchPhase::Ready => 1,
            ElasticsearchPhase::ApplyingChanges => 2,
            ElasticsearchPhase::MigratingData => 3,
            ElasticsearchPhase::NodeShutdownStalled => 4,
            ElasticsearchPhase::Invalid => 5,
        }
    }

    /// Returns the more significant of two phases.
    pub fn merge(self, other: ElasticsearchPhase) -> ElasticsearchPhase {
        if other.priority() > self.priority() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for ElasticsearchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElasticsearchPhase::Unknown => write!(f, "Unknown"),
            ElasticsearchPhase::Ready => write!(f, "Ready"),
            ElasticsearchPhase::ApplyingChanges => write!(f, "ApplyingChanges"),
            ElasticsearchPhase::MigratingData => write!(f, "MigratingData"),
            ElasticsearchPhase::NodeShutdownStalled => write!(f, "NodeShutdownStalled"),
            ElasticsearchPhase::Invalid => write!(f, "Invalid"),
        }
    }
}

/// Condition describes the state of a cluster at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: ConditionType,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    pub fn ready(ready: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(ConditionType::Ready, ready, reason, message, generation)
    }

    pub fn reconciliation_complete(
        complete: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new(
            ConditionType::ReconciliationComplete,
            complete,
            reason,
            message,
            generation,
        )
    }

    pub fn elasticsearch_reachable(
        reachable: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new(
            ConditionType::ElasticsearchIsReachable,
            reachable,
            reason,
            message,
            generation,
        )
    }
}

/// Types of conditions for Elasticsearch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionType {
    /// Every node of the desired topology is ready.
    Ready,
    /// The last reconciliation pass did not need a requeue.
    ReconciliationComplete,
    /// The Elasticsearch HTTP API answered the last health observation.
    ElasticsearchIsReachable,
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConditionType::Ready => write!(f, "Ready"),
            ConditionType::ReconciliationComplete => write!(f, "ReconciliationComplete"),
            ConditionType::ElasticsearchIsReachable => write!(f, "ElasticsearchIsReachable"),
        }
    }
}
