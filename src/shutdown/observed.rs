use super::{NodeShutdownCoordinator, NodeShutdownStatus, ShutdownError};

/// Callbacks mirroring shutdown progress into reconciliation status.
pub trait ShutdownObserver: Send + Sync {
    fn on_reconcile_shutdowns(&self, leaving_nodes: &[String]);
    fn on_shutdown_status(&self, node_name: &str, status: &NodeShutdownStatus);
}

impl ShutdownObserver for () {
    fn on_reconcile_shutdowns(&self, _leaving_nodes: &[String]) {}
    fn on_shutdown_status(&self, _node_name: &str, _status: &NodeShutdownStatus) {}
}

impl<O: ShutdownObserver> ShutdownObserver for &O {
    fn on_reconcile_shutdowns(&self, leaving_nodes: &[String]) {
        (**self).on_reconcile_shutdowns(leaving_nodes);
    }

    fn on_shutdown_status(&self, node_name: &str, status: &NodeShutdownStatus) {
        (**self).on_shutdown_status(node_name, status);
    }
}

/// Wraps a coordinator and notifies an observer after every successful call.
pub struct ObservedShutdown<S, O> {
    inner: S,
    observer: Option<O>,
}

impl<S, O> ObservedShutdown<S, O> {
    pub fn new(inner: S, observer: Option<O>) -> Self {
        Self { inner, observer }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: NodeShutdownCoordinator, O: ShutdownObserver> NodeShutdownCoordinator
    for ObservedShutdown<S, O>
{
    async fn reconcile_shutdowns(&self, leaving_nodes: &[String]) -> Result<(), ShutdownError> {
        self.inner.reconcile_shutdowns(leaving_nodes).await?;
        if let Some(observer) = &self.observer {
            observer.on_reconcile_shutdowns(leaving_nodes);
        }
        Ok(())
    }

    async fn shutdown_status(&self, node_name: &str) -> Result<NodeShutdownStatus, ShutdownError> {
        let status = self.inner.shutdown_status(node_name).await?;
        if let Some(observer) = &self.observer {
            observer.on_shutdown_status(node_name, &status);
        }
        Ok(status)
    }
}
