//! Node shutdown coordination.
//!
//! Preparing a node for removal (or a restart) is abstracted behind
//! [`NodeShutdownCoordinator`]. Two strategies implement it:
//!
//! - [`NodeShutdown`]: the typed node shutdown API (Elasticsearch 7.15.2+),
//!   which reports explicit COMPLETE / STALLED states.
//! - [`ShardMigration`]: the legacy approach, excluding leaving nodes from
//!   shard allocation and treating "no shard left" as complete.
//!
//! [`ShutdownStrategy`] picks one of them once, based on the cluster version.
//! Callers never branch on the concrete strategy.

mod node_shutdown;
mod observed;
mod shard_migration;

use std::collections::HashMap;

use thiserror::Error;

pub use node_shutdown::NodeShutdown;
pub use observed::{ObservedShutdown, ShutdownObserver};
pub use shard_migration::ShardMigration;

use crate::client::{EsClient, EsClientError, ShutdownStatus, ShutdownType, supports_node_shutdown};

/// Shutdown progress of one node.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeShutdownStatus {
    pub status: ShutdownStatus,
    /// Free text explaining the status, surfaced to the user.
    pub explanation: Option<String>,
}

impl NodeShutdownStatus {
    pub fn new(status: ShutdownStatus) -> Self {
        Self {
            status,
            explanation: None,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = Some(explanation.into());
        self
    }
}

/// Errors returned by shutdown coordinators.
#[derive(Error, Debug)]
pub enum ShutdownError {
    /// No node ID is known for this pod.
    #[error("Unknown node {0}: no node ID mapping available")]
    UnknownNode(String),

    /// No shutdown is registered for this node.
    #[error("No shutdown registered for node {0}")]
    NotFound(String),

    #[error("Elasticsearch error: {0}")]
    Client(#[from] EsClientError),
}

/// Uniform reconcile/status contract over both shutdown strategies.
pub trait NodeShutdownCoordinator: Send + Sync {
    /// Makes the registered shutdowns match `leaving_nodes` exactly.
    /// Calling it twice with the same set is a no-op the second time.
    fn reconcile_shutdowns(
        &self,
        leaving_nodes: &[String],
    ) -> impl std::future::Future<Output = Result<(), ShutdownError>> + Send;

    /// Current shutdown status of one node.
    fn shutdown_status(
        &self,
        node_name: &str,
    ) -> impl std::future::Future<Output = Result<NodeShutdownStatus, ShutdownError>> + Send;
}

/// Shutdown strategy selected from the cluster version.
pub enum ShutdownStrategy<'a, C> {
    NodeShutdown(NodeShutdown<'a, C>),
    ShardMigration(ShardMigration<'a, C>),
}

impl<'a, C: EsClient> ShutdownStrategy<'a, C> {
    /// Node shutdown API when supported by the running version, shard
    /// migration otherwise. `pod_to_node_id` maps pod names to node IDs.
    pub fn for_cluster(
        client: &'a C,
        pod_to_node_id: HashMap<String, String>,
        shutdown_type: ShutdownType,
        reason: impl Into<String>,
    ) -> Self {
        if supports_node_shutdown(client.version()) {
            ShutdownStrategy::NodeShutdown(NodeShutdown::new(
                client,
                pod_to_node_id,
                shutdown_type,
                reason,
            ))
        } else {
            ShutdownStrategy::ShardMigration(ShardMigration::new(client))
        }
    }

    pub fn uses_node_shutdown_api(&self) -> bool {
        matches!(self, ShutdownStrategy::NodeShutdown(_))
    }
}

impl<C: EsClient> NodeShutdownCoordinator for ShutdownStrategy<'_, C> {
    async fn reconcile_shutdowns(&self, leaving_nodes: &[String]) -> Result<(), ShutdownError> {
        match self {
            ShutdownStrategy::NodeShutdown(s) => s.reconcile_shutdowns(leaving_nodes).await,
            ShutdownStrategy::ShardMigration(s) => s.reconcile_shutdowns(leaving_nodes).await,
        }
    }

    async fn shutdown_status(&self, node_name: &str) -> Result<NodeShutdownStatus, ShutdownError> {
        match self {
            ShutdownStrategy::NodeShutdown(s) => s.shutdown_status(node_name).await,
            ShutdownStrategy::ShardMigration(s) => s.shutdown_status(node_name).await,
        }
    }
}
