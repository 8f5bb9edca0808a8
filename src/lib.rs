//! es-operator library crate
//!
//! Reconciliation core of an operator managing Elasticsearch clusters on
//! Kubernetes: safe downscales, rolling restarts and the node shutdown
//! coordination they depend on.

pub mod client;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod observer;
pub mod shutdown;
pub mod store;
pub mod topology;

pub use config::OperatorConfig;
pub use health::HealthState;

use std::sync::Arc;

use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, predicates, reflector, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

use controller::{context::Context, reconciler::reconcile};
use crd::Elasticsearch;
use topology::CLUSTER_NAME_LABEL;

/// Create namespaced or cluster-wide API based on scope
pub fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Create a filtered stream for a resource type with standard optimizations.
///
/// This creates a reflector-backed stream that:
/// - Maintains an in-memory cache via reflector
/// - Uses automatic retry with exponential backoff on errors
/// - Converts watch events to objects (Added/Modified only)
/// - Filters out status-only updates via generation predicate
fn create_filtered_stream<K>(
    api: Api<K>,
    watcher_config: WatcherConfig,
) -> (
    reflector::Store<K>,
    impl Stream<Item = Result<K, watcher::Error>>,
)
where
    K: Resource + Clone + DeserializeOwned + std::fmt::Debug + Send + 'static,
    K::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (reader, writer) = reflector::store();
    let stream = reflector(writer, watcher(api, watcher_config))
        .default_backoff()
        .applied_objects()
        .predicate_filter(predicates::generation);
    (reader, stream)
}

/// Maps a pod to the Elasticsearch resource it belongs to.
fn pod_to_cluster(pod: Pod) -> Option<ObjectRef<Elasticsearch>> {
    let cluster = pod.labels().get(CLUSTER_NAME_LABEL)?;
    let namespace = pod.namespace()?;
    Some(ObjectRef::new(cluster).within(&namespace))
}

/// Run the Elasticsearch controller until its stream ends.
///
/// Watches Elasticsearch resources (in `config.watch_namespace`, or
/// cluster-wide), the StatefulSets they own and their pods. If
/// `health_state` is provided, metrics are recorded for reconciliations.
pub async fn run_controller(
    client: Client,
    config: OperatorConfig,
    health_state: Option<Arc<HealthState>>,
) {
    let namespace = config.watch_namespace.clone();
    let scope_msg = namespace.as_deref().unwrap_or("cluster-wide");
    info!(scope = %scope_msg, "Starting controller for Elasticsearch resources");

    if let Some(ref state) = health_state {
        state.set_ready(true);
    }

    let ctx = Arc::new(Context::new(client.clone(), config, health_state));

    let clusters: Api<Elasticsearch> = scoped_api(client.clone(), namespace.as_deref());
    let statefulsets: Api<StatefulSet> = scoped_api(client.clone(), namespace.as_deref());
    let pods: Api<Pod> = scoped_api(client.clone(), namespace.as_deref());

    let watcher_config = default_watcher_config();
    let (reader, cluster_stream) = create_filtered_stream(clusters, watcher_config.clone());

    // Only pods carrying the cluster label matter.
    let pod_config = watcher_config.clone().labels(CLUSTER_NAME_LABEL);

    Controller::for_stream(cluster_stream, reader)
        .owns(statefulsets, watcher_config)
        .watches(pods, pod_config, pod_to_cluster)
        .run(reconcile, controller::reconciler::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    let is_not_found = match &e {
                        kube::runtime::controller::Error::ObjectNotFound(_) => true,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                            err.is_not_found()
                        }
                        _ => false,
                    };
                    if is_not_found {
                        debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    error!("Controller stream ended unexpectedly");
}
