//! Per-reconciliation cache of cluster facts.

use std::collections::HashMap;
use std::future::Future;

use tokio::sync::OnceCell;

use crate::client::{ClusterRoutingAllocation, EsClient, EsClientError, Health, Nodes, Shard};
use crate::client::shards_by_node;

/// Computes a value at most once for the lifetime of the instance.
///
/// The first outcome is kept, including a failure: later calls replay the
/// same error instead of retrying.
#[derive(Debug)]
pub struct Memo<T> {
    cell: OnceCell<Result<T, EsClientError>>,
}

impl<T> Default for Memo<T> {
    fn default() -> Self {
        Self {
            cell: OnceCell::new(),
        }
    }
}

impl<T> Memo<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached outcome, running `fetch` if this is the first call.
    pub async fn get_or_fetch<F, Fut>(&self, fetch: F) -> Result<&T, EsClientError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EsClientError>>,
    {
        self.cell
            .get_or_init(fetch)
            .await
            .as_ref()
            .map_err(Clone::clone)
    }

    pub fn is_initialized(&self) -> bool {
        self.cell.initialized()
    }
}

/// Cluster facts fetched lazily, each at most once per instance.
///
/// Create one per reconciliation pass: facts are stale as soon as the pass
/// mutates the cluster.
pub struct EsState<'a, C> {
    client: &'a C,
    nodes: Memo<Nodes>,
    allocation: Memo<ClusterRoutingAllocation>,
    health: Memo<Health>,
    shards: Memo<Vec<Shard>>,
    shards_by_node: Memo<HashMap<String, Vec<Shard>>>,
}

impl<'a, C: EsClient> EsState<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self {
            client,
            nodes: Memo::new(),
            allocation: Memo::new(),
            health: Memo::new(),
            shards: Memo::new(),
            shards_by_node: Memo::new(),
        }
    }

    pub fn client(&self) -> &'a C {
        self.client
    }

    async fn nodes(&self) -> Result<&Nodes, EsClientError> {
        self.nodes.get_or_fetch(|| self.client.get_nodes()).await
    }

    /// Whether every given node name is currently part of the cluster.
    pub async fn nodes_in_cluster(&self, names: &[String]) -> Result<bool, EsClientError> {
        let nodes = self.nodes().await?;
        Ok(names
            .iter()
            .all(|name| nodes.nodes.values().any(|n| &n.name == name)))
    }

    /// Node name to node ID mapping of the nodes in the cluster.
    pub async fn node_name_to_id(&self) -> Result<HashMap<String, String>, EsClientError> {
        Ok(self.nodes().await?.name_to_id())
    }

    pub async fn shard_allocations_enabled(&self) -> Result<bool, EsClientError> {
        let allocation = self
            .allocation
            .get_or_fetch(|| self.client.get_cluster_routing_allocation())
            .await?;
        Ok(allocation.is_shard_allocation_enabled())
    }

    pub async fn health(&self) -> Result<&Health, EsClientError> {
        self.health
            .get_or_fetch(|| self.client.get_cluster_health())
            .await
    }

    pub async fn green_health(&self) -> Result<bool, EsClientError> {
        Ok(self.health().await?.is_green())
    }

    /// Every shard copy, unassigned ones included.
    pub async fn shards(&self) -> Result<&[Shard], EsClientError> {
        self.shards
            .get_or_fetch(|| self.client.get_shards())
            .await
            .map(Vec::as_slice)
    }

    /// Shard copies grouped by node name.
    pub async fn shards_by_node(&self) -> Result<&HashMap<String, Vec<Shard>>, EsClientError> {
        let shards = self.shards().await?;
        self.shards_by_node
            .get_or_fetch(|| async { Ok(shards_by_node(shards)) })
            .await
    }
}
