//! Kubernetes objects the reconciliation core reads and mutates.
//!
//! The planners only go through [`ObjectStore`], scoped to the namespace of
//! the cluster being reconciled. [`KubeStore`] talks to the API server;
//! `FakeStore` keeps objects in memory for tests and is only built with
//! the `test-util` feature.
//!
//! Errors are plain `kube::Error`s so callers can tell "not found" (404) and
//! "conflict" (409) apart the same way for both implementations.

#[cfg(any(test, feature = "test-util"))]
mod fake;
mod kube_store;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;

#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeStore;
pub use kube_store::KubeStore;

pub type Result<T> = std::result::Result<T, kube::Error>;

/// Namespaced access to the objects backing one Elasticsearch cluster.
pub trait ObjectStore: Send + Sync {
    /// StatefulSets carrying the cluster label.
    fn list_statefulsets(
        &self,
        cluster: &str,
    ) -> impl std::future::Future<Output = Result<Vec<StatefulSet>>> + Send;

    /// Pods carrying the cluster label.
    fn list_pods(&self, cluster: &str)
    -> impl std::future::Future<Output = Result<Vec<Pod>>> + Send;

    /// Sets `spec.replicas` of a StatefulSet.
    fn scale_statefulset(
        &self,
        name: &str,
        replicas: i32,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    fn delete_statefulset(&self, name: &str)
    -> impl std::future::Future<Output = Result<()>> + Send;

    fn delete_service(&self, name: &str) -> impl std::future::Future<Output = Result<()>> + Send;

    fn delete_secret(&self, name: &str) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Deletes a pod only if its UID and resourceVersion still match `pod`.
    fn delete_pod(&self, pod: &Pod) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Sets (or removes, with `None`) an annotation on the Elasticsearch resource.
    fn annotate_cluster(
        &self,
        cluster: &str,
        key: &str,
        value: Option<&str>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Whether the error is a 404 from the API server.
pub fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(r) if r.code == 404)
}

/// Whether the error is a 409 from the API server.
pub fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(r) if r.code == 409)
}

/// Treats "already gone" as success.
pub fn ignore_not_found(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if is_not_found(&e) => Ok(()),
        other => other,
    }
}
