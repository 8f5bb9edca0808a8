use std::collections::{HashMap, HashSet};

use tracing::{debug, info, instrument};

use super::{NodeShutdownCoordinator, NodeShutdownStatus, ShutdownError};
use crate::client::{EsClient, ShutdownRequest, ShutdownStatus, ShutdownType};

/// Shutdown coordination through the typed node shutdown API.
pub struct NodeShutdown<'a, C> {
    client: &'a C,
    pod_to_node_id: HashMap<String, String>,
    shutdown_type: ShutdownType,
    reason: String,
}

impl<'a, C: EsClient> NodeShutdown<'a, C> {
    pub fn new(
        client: &'a C,
        pod_to_node_id: HashMap<String, String>,
        shutdown_type: ShutdownType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            client,
            pod_to_node_id,
            shutdown_type,
            reason: reason.into(),
        }
    }

    fn lookup_node_id(&self, node_name: &str) -> Result<&str, ShutdownError> {
        self.pod_to_node_id
            .get(node_name)
            .map(String::as_str)
            .ok_or_else(|| ShutdownError::UnknownNode(node_name.to_string()))
    }

    /// Deletes shutdowns of this coordinator's type, optionally only those in `status`.
    #[instrument(skip(self), fields(shutdown_type = %self.shutdown_type))]
    pub async fn clear(&self, status: Option<ShutdownStatus>) -> Result<(), ShutdownError> {
        let existing = self.client.get_shutdown(None).await?;
        for shutdown in existing.nodes {
            if !shutdown.is(self.shutdown_type) {
                continue;
            }
            if status.is_some_and(|s| s != shutdown.status) {
                continue;
            }
            info!(
                node_id = %shutdown.node_id,
                status = %shutdown.status,
                "Deleting node shutdown"
            );
            self.client.delete_shutdown(&shutdown.node_id).await?;
        }
        Ok(())
    }
}

impl<C: EsClient> NodeShutdownCoordinator for NodeShutdown<'_, C> {
    #[instrument(skip(self), fields(shutdown_type = %self.shutdown_type))]
    async fn reconcile_shutdowns(&self, leaving_nodes: &[String]) -> Result<(), ShutdownError> {
        let existing = self.client.get_shutdown(None).await?;

        let mut leaving_ids = HashSet::with_capacity(leaving_nodes.len());
        for node in leaving_nodes {
            leaving_ids.insert(self.lookup_node_id(node)?);
        }

        // Cancel shutdowns for nodes that are no longer leaving.
        let mut registered = HashSet::new();
        for shutdown in existing.nodes.iter().filter(|s| s.is(self.shutdown_type)) {
            if leaving_ids.contains(shutdown.node_id.as_str()) {
                registered.insert(shutdown.node_id.as_str());
                continue;
            }
            info!(node_id = %shutdown.node_id, "Cancelling node shutdown");
            self.client.delete_shutdown(&shutdown.node_id).await?;
        }

        for node in leaving_nodes {
            let node_id = self.lookup_node_id(node)?;
            if registered.contains(node_id) {
                continue;
            }
            info!(node = %node, node_id = %node_id, "Requesting node shutdown");
            let request = ShutdownRequest {
                shutdown_type: self.shutdown_type,
                reason: self.reason.clone(),
            };
            self.client.put_shutdown(node_id, &request).await?;

            let response = self.client.get_shutdown(Some(node_id)).await?;
            for shutdown in response.nodes {
                debug!(
                    node = %node,
                    status = %shutdown.status,
                    "Node shutdown registered"
                );
            }
        }
        Ok(())
    }

    #[instrument(skip(self), fields(shutdown_type = %self.shutdown_type))]
    async fn shutdown_status(&self, node_name: &str) -> Result<NodeShutdownStatus, ShutdownError> {
        let node_id = self.lookup_node_id(node_name)?;
        let response = self.client.get_shutdown(Some(node_id)).await?;
        let shutdown = response
            .nodes
            .into_iter()
            .find(|s| s.node_id == node_id)
            .ok_or_else(|| ShutdownError::NotFound(node_name.to_string()))?;
        Ok(NodeShutdownStatus {
            status: shutdown.status,
            explanation: shutdown.shard_migration.explanation,
        })
    }
}
