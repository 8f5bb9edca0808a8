//! One pass over the nodes of a cluster: downscale, then upgrade.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{info, instrument};

use crate::client::{EsClient, Health, ShutdownType};
use crate::crd::Elasticsearch;
use crate::observer::EsState;
use crate::shutdown::{ObservedShutdown, ShutdownStrategy};
use crate::store::ObjectStore;
use crate::topology::{TopologyGroup, is_pod_ready};

use super::downscale::{DownscaleContext, handle_downscale};
use super::results::Results;
use super::status::ReconcileState;
use super::upgrade::{UpgradeContext, handle_upgrades};
use super::zen;

async fn list_cluster<K: ObjectStore>(
    store: &K,
    cluster: &str,
) -> Result<(Vec<StatefulSet>, Vec<Pod>), kube::Error> {
    let statefulsets = store.list_statefulsets(cluster).await?;
    let pods = store.list_pods(cluster).await?;
    Ok((statefulsets, pods))
}

/// Moves the StatefulSets and pods of `es` one step towards its spec.
///
/// `observed` is the latest health reported by the background observer;
/// `None` means the cluster cannot be reached and every step needing the
/// Elasticsearch API is skipped.
#[instrument(skip_all, fields(namespace = %es.namespace().unwrap_or_default(), es_name = %es.name_any()))]
pub async fn reconcile_nodes<K: ObjectStore, C: EsClient>(
    es: &Elasticsearch,
    store: &K,
    es_client: &C,
    observed: Option<&Health>,
    state: &ReconcileState,
) -> Results {
    let mut results = Results::new();
    let name = es.name_any();

    let (statefulsets, pods) = match list_cluster(store, &name).await {
        Ok(listed) => listed,
        Err(e) => {
            results.with_error(e);
            return results;
        }
    };
    let actual_groups: Vec<TopologyGroup> =
        statefulsets.iter().map(TopologyGroup::from_statefulset).collect();
    let expected_groups = es.expected_groups();

    let Some(health) = observed else {
        info!("Elasticsearch cannot be reached yet, re-queuing");
        results.with_requeue("Elasticsearch cannot be reached yet");
        return results;
    };
    let ready = pods.iter().filter(|p| is_pod_ready(p)).count();
    state.update_health(health.status, i32::try_from(ready).unwrap_or(i32::MAX));

    let es_state = EsState::new(es_client);

    match zen::clear_voting_config_exclusions(store, es_client, es, &actual_groups, &pods).await {
        Ok(true) => {
            results.with_requeue("Voting config exclusions pending cleanup");
        }
        Ok(false) => {}
        Err(e) => {
            results.with_error(e);
        }
    }

    // Downscale
    match es_state.node_name_to_id().await {
        Ok(ids) => {
            let strategy = ShutdownStrategy::for_cluster(
                es_client,
                ids,
                ShutdownType::Remove,
                es.resource_version().unwrap_or_default(),
            );
            let shutdown = ObservedShutdown::new(strategy, Some(state));
            let ctx = DownscaleContext {
                es,
                store,
                es_client,
                shutdown: &shutdown,
                state,
                actual_pods: &pods,
            };
            results.merge(handle_downscale(&ctx, &expected_groups, &actual_groups).await);
        }
        Err(e) => {
            results.with_error(e);
        }
    }

    // Downscales may have changed replicas and removed StatefulSets.
    let (statefulsets, pods) = match list_cluster(store, &name).await {
        Ok(listed) => listed,
        Err(e) => {
            results.with_error(e);
            return results;
        }
    };

    // Upgrade
    let ctx = UpgradeContext {
        es,
        store,
        es_client,
        es_state: &es_state,
        state,
        statefulsets: &statefulsets,
        pods: &pods,
    };
    results.merge(handle_upgrades(&ctx).await);
    results
}
