//! In-memory `EsClient` used by tests.
//!
//! Keeps a small model of the cluster (health, nodes, shards, allocation
//! settings and registered shutdowns) and records every call so tests can
//! assert on the exact sequence of API requests.

use std::sync::{Mutex, MutexGuard};

use super::es_client::{EsClient, EsClientError};
use super::types::{
    ClusterRoutingAllocation, Health, Node, NodeShutdown, Nodes, Shard, ShardMigration,
    ShardState, ShardType, ShutdownRequest, ShutdownResponse, ShutdownStatus,
};
use crate::crd::ElasticsearchHealth;

#[derive(Debug)]
struct FakeState {
    health: Result<Health, EsClientError>,
    nodes: Result<Nodes, EsClientError>,
    allocation: Result<ClusterRoutingAllocation, EsClientError>,
    shards: Result<Vec<Shard>, EsClientError>,
    shutdowns: Vec<NodeShutdown>,
    get_shutdown_error: Option<EsClientError>,
    new_shutdown_status: ShutdownStatus,
    synced_flush_error: Option<EsClientError>,
    voting_config_exclusions: Vec<String>,
    minimum_master_nodes: Option<i32>,
    calls: Vec<String>,
}

/// Fake Elasticsearch cluster.
#[derive(Debug)]
pub struct FakeEsClient {
    version: semver::Version,
    state: Mutex<FakeState>,
}

impl Default for FakeEsClient {
    fn default() -> Self {
        Self::new(semver::Version::new(8, 15, 0))
    }
}

impl FakeEsClient {
    /// A green, empty cluster running `version`.
    pub fn new(version: semver::Version) -> Self {
        Self {
            version,
            state: Mutex::new(FakeState {
                health: Ok(Health {
                    status: ElasticsearchHealth::Green,
                    ..Default::default()
                }),
                nodes: Ok(Nodes::default()),
                allocation: Ok(ClusterRoutingAllocation::default()),
                shards: Ok(Vec::new()),
                shutdowns: Vec::new(),
                get_shutdown_error: None,
                new_shutdown_status: ShutdownStatus::InProgress,
                synced_flush_error: None,
                voting_config_exclusions: Vec::new(),
                minimum_master_nodes: None,
                calls: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, call: impl Into<String>) {
        self.state().calls.push(call.into());
    }

    pub fn with_health(self, status: ElasticsearchHealth) -> Self {
        self.state().health = Ok(Health {
            status,
            ..Default::default()
        });
        self
    }

    pub fn with_health_error(self, error: EsClientError) -> Self {
        self.state().health = Err(error);
        self
    }

    /// Nodes in the cluster, with their node ID derived from the name.
    pub fn with_nodes(self, names: &[&str]) -> Self {
        let nodes = names
            .iter()
            .map(|name| {
                (
                    node_id(name),
                    Node {
                        name: name.to_string(),
                        version: self.version.to_string(),
                        roles: Vec::new(),
                    },
                )
            })
            .collect();
        self.state().nodes = Ok(Nodes { nodes });
        self
    }

    pub fn with_nodes_error(self, error: EsClientError) -> Self {
        self.state().nodes = Err(error);
        self
    }

    /// Adds a started copy of `index`/`shard` on `node`.
    pub fn with_shard(self, index: &str, shard: &str, node: &str) -> Self {
        if let Ok(shards) = &mut self.state().shards {
            shards.push(Shard {
                index: index.to_string(),
                shard: shard.to_string(),
                state: ShardState::Started,
                node_name: Some(node.to_string()),
                shard_type: ShardType::Primary,
            });
        }
        self
    }

    /// Adds a shard copy in any state; `node` is `None` when unassigned.
    pub fn with_shard_copy(
        self,
        index: &str,
        shard: &str,
        node: Option<&str>,
        shard_type: ShardType,
        state: ShardState,
    ) -> Self {
        if let Ok(shards) = &mut self.state().shards {
            shards.push(Shard {
                index: index.to_string(),
                shard: shard.to_string(),
                state,
                node_name: node.map(str::to_string),
                shard_type,
            });
        }
        self
    }

    pub fn with_shards_error(self, error: EsClientError) -> Self {
        self.state().shards = Err(error);
        self
    }

    pub fn with_shard_allocation_disabled(self) -> Self {
        if let Ok(allocation) = &mut self.state().allocation {
            allocation.transient.cluster.routing.allocation.enable = "primaries".into();
        }
        self
    }

    pub fn with_excluded_nodes(self, nodes: &str) -> Self {
        if let Ok(allocation) = &mut self.state().allocation {
            allocation.transient.cluster.routing.allocation.exclude.name = nodes.to_string();
        }
        self
    }

    /// Registers an existing shutdown for the node named `node`.
    pub fn with_shutdown(self, node: &str, shutdown_type: &str, status: ShutdownStatus) -> Self {
        self.state().shutdowns.push(NodeShutdown {
            node_id: node_id(node),
            shutdown_type: shutdown_type.to_string(),
            status,
            shard_migration: ShardMigration {
                status,
                ..Default::default()
            },
            ..Default::default()
        });
        self
    }

    /// Makes every `GET` on the shutdown API fail.
    pub fn with_get_shutdown_error(self, error: EsClientError) -> Self {
        self.state().get_shutdown_error = Some(error);
        self
    }

    /// Status given to shutdowns created through `put_shutdown`.
    pub fn with_new_shutdown_status(self, status: ShutdownStatus) -> Self {
        self.state().new_shutdown_status = status;
        self
    }

    pub fn with_synced_flush_error(self, error: EsClientError) -> Self {
        self.state().synced_flush_error = Some(error);
        self
    }

    /// Moves the shutdown of `node` to a new status.
    pub fn set_shutdown_status(&self, node: &str, status: ShutdownStatus, explanation: Option<&str>) {
        let id = node_id(node);
        for shutdown in self.state().shutdowns.iter_mut().filter(|s| s.node_id == id) {
            shutdown.status = status;
            shutdown.shard_migration.status = status;
            shutdown.shard_migration.explanation = explanation.map(str::to_string);
        }
    }

    /// Every call made so far, e.g. `"PUT /_nodes/node-id/shutdown"`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// HTTP methods of the shutdown API calls made so far.
    pub fn shutdown_methods(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|c| c.ends_with("/shutdown"))
            .filter_map(|c| c.split(' ').next().map(str::to_string))
            .collect()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn registered_shutdowns(&self) -> Vec<NodeShutdown> {
        self.state().shutdowns.clone()
    }

    pub fn voting_config_exclusions(&self) -> Vec<String> {
        self.state().voting_config_exclusions.clone()
    }

    pub fn minimum_master_nodes(&self) -> Option<i32> {
        self.state().minimum_master_nodes
    }

    pub fn excluded_nodes(&self) -> String {
        match &self.state().allocation {
            Ok(a) => a.excluded_names().to_string(),
            Err(_) => String::new(),
        }
    }

    pub fn shard_allocation_enabled(&self) -> bool {
        matches!(&self.state().allocation, Ok(a) if a.is_shard_allocation_enabled())
    }
}

/// Node ID the fake assigns to a node name.
pub fn node_id(name: &str) -> String {
    format!("id-{name}")
}

impl EsClient for FakeEsClient {
    fn version(&self) -> &semver::Version {
        &self.version
    }

    async fn get_cluster_health(&self) -> Result<Health, EsClientError> {
        self.record("GET /_cluster/health");
        self.state().health.clone()
    }

    async fn get_nodes(&self) -> Result<Nodes, EsClientError> {
        self.record("GET /_nodes");
        self.state().nodes.clone()
    }

    async fn get_cluster_routing_allocation(
        &self,
    ) -> Result<ClusterRoutingAllocation, EsClientError> {
        self.record("GET /_cluster/settings");
        self.state().allocation.clone()
    }

    async fn get_shards(&self) -> Result<Vec<Shard>, EsClientError> {
        self.record("GET /_cat/shards");
        self.state().shards.clone()
    }

    async fn exclude_from_shard_allocation(&self, nodes: &str) -> Result<(), EsClientError> {
        self.record(format!("PUT /_cluster/settings exclude={nodes}"));
        if let Ok(allocation) = &mut self.state().allocation {
            allocation.transient.cluster.routing.allocation.exclude.name = nodes.to_string();
        }
        Ok(())
    }

    async fn enable_shard_allocation(&self) -> Result<(), EsClientError> {
        self.record("PUT /_cluster/settings enable=all");
        if let Ok(allocation) = &mut self.state().allocation {
            allocation.transient.cluster.routing.allocation.enable = String::new();
        }
        Ok(())
    }

    async fn disable_replica_shard_allocation(&self) -> Result<(), EsClientError> {
        self.record("PUT /_cluster/settings enable=primaries");
        if let Ok(allocation) = &mut self.state().allocation {
            allocation.transient.cluster.routing.allocation.enable = "primaries".into();
        }
        Ok(())
    }

    async fn synced_flush(&self) -> Result<(), EsClientError> {
        self.record("POST /_flush/synced");
        match self.state().synced_flush_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush(&self) -> Result<(), EsClientError> {
        self.record("POST /_flush");
        Ok(())
    }

    async fn set_minimum_master_nodes(&self, count: i32) -> Result<(), EsClientError> {
        self.record(format!("PUT /_cluster/settings minimum_master_nodes={count}"));
        self.state().minimum_master_nodes = Some(count);
        Ok(())
    }

    async fn add_voting_config_exclusions(&self, node_names: &[String]) -> Result<(), EsClientError> {
        self.record(format!(
            "POST /_cluster/voting_config_exclusions {}",
            node_names.join(",")
        ));
        self.state()
            .voting_config_exclusions
            .extend(node_names.iter().cloned());
        Ok(())
    }

    async fn delete_voting_config_exclusions(
        &self,
        _wait_for_removal: bool,
    ) -> Result<(), EsClientError> {
        self.record("DELETE /_cluster/voting_config_exclusions");
        self.state().voting_config_exclusions.clear();
        Ok(())
    }

    async fn get_shutdown(&self, node_id: Option<&str>) -> Result<ShutdownResponse, EsClientError> {
        let path = match node_id {
            Some(id) => format!("GET /_nodes/{id}/shutdown"),
            None => "GET /_nodes/shutdown".to_string(),
        };
        self.record(path);
        let state = self.state();
        if let Some(e) = &state.get_shutdown_error {
            return Err(e.clone());
        }
        let nodes = state
            .shutdowns
            .iter()
            .filter(|s| node_id.is_none_or(|id| s.node_id == id))
            .cloned()
            .collect();
        Ok(ShutdownResponse { nodes })
    }

    async fn put_shutdown(
        &self,
        node_id: &str,
        request: &ShutdownRequest,
    ) -> Result<(), EsClientError> {
        self.record(format!("PUT /_nodes/{node_id}/shutdown"));
        let mut state = self.state();
        let status = state.new_shutdown_status;
        state.shutdowns.retain(|s| s.node_id != node_id);
        state.shutdowns.push(NodeShutdown {
            node_id: node_id.to_string(),
            shutdown_type: request.shutdown_type.to_string().to_uppercase(),
            reason: request.reason.clone(),
            status,
            shard_migration: ShardMigration {
                status,
                ..Default::default()
            },
            ..Default::default()
        });
        Ok(())
    }

    async fn delete_shutdown(&self, node_id: &str) -> Result<(), EsClientError> {
        self.record(format!("DELETE /_nodes/{node_id}/shutdown"));
        self.state().shutdowns.retain(|s| s.node_id != node_id);
        Ok(())
    }
}
