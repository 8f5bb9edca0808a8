use tracing::{info, instrument};

use super::{NodeShutdownCoordinator, NodeShutdownStatus, ShutdownError};
use crate::client::{EsClient, ShutdownStatus};

/// Legacy shutdown coordination: leaving nodes are excluded from shard
/// allocation and considered shut down once they hold no shard.
pub struct ShardMigration<'a, C> {
    client: &'a C,
}

impl<'a, C: EsClient> ShardMigration<'a, C> {
    pub fn new(client: &'a C) -> Self {
        Self { client }
    }
}

fn excluded(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl<C: EsClient> NodeShutdownCoordinator for ShardMigration<'_, C> {
    #[instrument(skip(self))]
    async fn reconcile_shutdowns(&self, leaving_nodes: &[String]) -> Result<(), ShutdownError> {
        let desired = leaving_nodes.join(",");
        let allocation = self.client.get_cluster_routing_allocation().await?;
        if allocation.excluded_names() == desired {
            return Ok(());
        }
        info!(
            excluded = %desired,
            "Setting routing allocation excludes"
        );
        self.client.exclude_from_shard_allocation(&desired).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown_status(&self, node_name: &str) -> Result<NodeShutdownStatus, ShutdownError> {
        let allocation = self.client.get_cluster_routing_allocation().await?;
        if !excluded(allocation.excluded_names()).any(|n| n == node_name) {
            return Err(ShutdownError::NotFound(node_name.to_string()));
        }

        let shards = self.client.get_shards().await?;
        let remaining = shards
            .iter()
            .filter(|s| s.node_name.as_deref() == Some(node_name))
            .count();
        if remaining == 0 {
            return Ok(NodeShutdownStatus::new(ShutdownStatus::Complete));
        }
        Ok(NodeShutdownStatus::new(ShutdownStatus::InProgress)
            .with_explanation(format!("{remaining} shards remaining on node {node_name}")))
    }
}
