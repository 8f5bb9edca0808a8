//! Elasticsearch API response and request types.
//!
//! Only the fields the operator reads are modelled; everything else in the
//! responses is ignored during deserialization.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

use crate::crd::ElasticsearchHealth;

/// Response of `GET /_cluster/health`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Health {
    #[serde(default)]
    pub cluster_name: String,
    #[serde(default)]
    pub status: ElasticsearchHealth,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub number_of_nodes: i32,
    #[serde(default)]
    pub number_of_data_nodes: i32,
    #[serde(default)]
    pub relocating_shards: i32,
    #[serde(default)]
    pub initializing_shards: i32,
    #[serde(default)]
    pub unassigned_shards: i32,
}

impl Health {
    pub fn is_green(&self) -> bool {
        self.status == ElasticsearchHealth::Green
    }
}

/// Response of `GET /_nodes`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Nodes {
    /// Nodes keyed by node ID.
    #[serde(default)]
    pub nodes: BTreeMap<String, Node>,
}

impl Nodes {
    /// Node names currently in the cluster.
    pub fn names(&self) -> Vec<String> {
        self.nodes.values().map(|n| n.name.clone()).collect()
    }

    /// Mapping from node name (pod name) to node ID.
    pub fn name_to_id(&self) -> HashMap<String, String> {
        self.nodes
            .iter()
            .map(|(id, node)| (node.name.clone(), id.clone()))
            .collect()
    }
}

/// One node as reported by `GET /_nodes`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct Node {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Shard allocation state.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardState {
    Started,
    Initializing,
    Relocating,
    #[default]
    Unassigned,
}

/// Shard copy kind, as reported by `_cat/shards` (`p` or `r`).
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ShardType {
    #[serde(rename = "p")]
    #[default]
    Primary,
    #[serde(rename = "r")]
    Replica,
}

/// One shard copy from `GET /_cat/shards?format=json`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Shard {
    pub index: String,
    pub shard: String,
    #[serde(default)]
    pub state: ShardState,
    /// Node holding the copy. Relocating shards are reported as
    /// `"node-a -> 10.0.0.1 id node-b"`; only the source node name is kept.
    #[serde(default, rename = "node", deserialize_with = "deserialize_node_name")]
    pub node_name: Option<String>,
    #[serde(default, rename = "prirep")]
    pub shard_type: ShardType,
}

fn deserialize_node_name<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw
        .and_then(|n| n.split(' ').next().map(str::to_string))
        .filter(|n| !n.is_empty()))
}

impl Shard {
    /// Identifies every copy of the same shard across nodes.
    pub fn key(&self) -> (&str, &str) {
        (&self.index, &self.shard)
    }
}

/// Groups shard copies by the node holding them. Unassigned copies are skipped.
pub fn shards_by_node(shards: &[Shard]) -> HashMap<String, Vec<Shard>> {
    let mut result: HashMap<String, Vec<Shard>> = HashMap::new();
    for shard in shards {
        if let Some(node) = &shard.node_name {
            result.entry(node.clone()).or_default().push(shard.clone());
        }
    }
    result
}

/// Subset of `GET /_cluster/settings` covering shard allocation.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ClusterRoutingAllocation {
    #[serde(default)]
    pub transient: AllocationSettings,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AllocationSettings {
    #[serde(default)]
    pub cluster: ClusterRoutingSettings,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ClusterRoutingSettings {
    #[serde(default)]
    pub routing: RoutingSettings,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RoutingSettings {
    #[serde(default)]
    pub allocation: RoutingAllocationSettings,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct RoutingAllocationSettings {
    #[serde(default)]
    pub exclude: AllocationExclude,
    #[serde(default)]
    pub enable: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct AllocationExclude {
    #[serde(default, rename = "_name")]
    pub name: String,
}

impl ClusterRoutingAllocation {
    /// Shard allocation is enabled unless explicitly restricted.
    pub fn is_shard_allocation_enabled(&self) -> bool {
        let enable = &self.transient.cluster.routing.allocation.enable;
        enable.is_empty() || enable == "all"
    }

    /// Current value of `cluster.routing.allocation.exclude._name`.
    pub fn excluded_names(&self) -> &str {
        &self.transient.cluster.routing.allocation.exclude.name
    }
}

/// Kind of node shutdown.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownType {
    /// The node is restarted and keeps its data.
    Restart,
    /// The node leaves the cluster for good.
    Remove,
}

impl std::fmt::Display for ShutdownType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownType::Restart => write!(f, "restart"),
            ShutdownType::Remove => write!(f, "remove"),
        }
    }
}

/// Lifecycle of a node shutdown request.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownStatus {
    /// Never expected from Elasticsearch; indicates a bug if returned.
    #[default]
    NotStarted,
    InProgress,
    Complete,
    /// Cannot make progress, e.g. no room to migrate shards to.
    Stalled,
}

impl std::fmt::Display for ShutdownStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownStatus::NotStarted => write!(f, "NOT_STARTED"),
            ShutdownStatus::InProgress => write!(f, "IN_PROGRESS"),
            ShutdownStatus::Complete => write!(f, "COMPLETE"),
            ShutdownStatus::Stalled => write!(f, "STALLED"),
        }
    }
}

/// Shard migration progress of a shutdown.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ShardMigration {
    #[serde(default)]
    pub status: ShutdownStatus,
    #[serde(default)]
    pub shard_migrations_remaining: i64,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// A registered node shutdown.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NodeShutdown {
    pub node_id: String,
    /// Shutdown type; Elasticsearch reports it upper case.
    #[serde(rename = "type")]
    pub shutdown_type: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default, rename = "shutdown_startedmillis")]
    pub shutdown_started_millis: i64,
    pub status: ShutdownStatus,
    #[serde(default)]
    pub shard_migration: ShardMigration,
}

impl NodeShutdown {
    /// Whether this shutdown is of the given type.
    pub fn is(&self, t: ShutdownType) -> bool {
        self.shutdown_type.eq_ignore_ascii_case(&t.to_string())
    }
}

/// Body of `PUT /_nodes/{id}/shutdown`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ShutdownRequest {
    #[serde(rename = "type")]
    pub shutdown_type: ShutdownType,
    pub reason: String,
}

/// Response of `GET /_nodes/shutdown`.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ShutdownResponse {
    #[serde(default)]
    pub nodes: Vec<NodeShutdown>,
}
