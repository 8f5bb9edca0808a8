//! Master discovery settings that must follow master topology changes.
//!
//! Zen1 clusters (before 7.0) need `minimum_master_nodes` lowered before
//! going from two masters to one. Zen2 clusters need leaving masters added to
//! the voting configuration exclusions, which are cleared once the pods are
//! gone.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{info, instrument};

use crate::client::{EsClient, is_zen2};
use crate::crd::{Elasticsearch, VOTING_CONFIG_EXCLUSIONS_ANNOTATION};
use crate::store::ObjectStore;
use crate::topology::{TopologyGroup, group_pod_names, is_master_pod};

use super::error::Result;
use super::status::{EVENT_REASON_UNHEALTHY, EventKind, ReconcileState};

/// Prepares master discovery for the removal of `leaving` master nodes.
pub async fn update_zen_settings_for_downscale<K: ObjectStore, C: EsClient>(
    store: &K,
    client: &C,
    es: &Elasticsearch,
    state: &ReconcileState,
    actual_pods: &[Pod],
    leaving: &[String],
) -> Result<()> {
    maybe_update_zen1_for_downscale(client, state, actual_pods).await?;
    add_to_voting_config_exclusions(store, client, es, leaving).await
}

/// Lowers `minimum_master_nodes` to 1 when a Zen1 cluster is about to go
/// from two masters to one.
pub async fn maybe_update_zen1_for_downscale<C: EsClient>(
    client: &C,
    state: &ReconcileState,
    actual_pods: &[Pod],
) -> Result<()> {
    if is_zen2(client.version()) {
        return Ok(());
    }
    let masters = actual_pods.iter().filter(|p| is_master_pod(p)).count();
    if masters != 2 {
        return Ok(());
    }
    state.add_event(
        EventKind::Warning,
        EVENT_REASON_UNHEALTHY,
        "Downscaling from 2 to 1 master nodes: unsafe operation",
    );
    info!("Setting minimum_master_nodes to 1 ahead of master downscale");
    client.set_minimum_master_nodes(1).await?;
    Ok(())
}

/// Excludes leaving masters from the Zen2 voting configuration.
///
/// The annotation is set first so a failure after the API call still leaves
/// a trace that exclusions must be cleared.
#[instrument(skip(store, client, es), fields(es_name = %es.name_any()))]
pub async fn add_to_voting_config_exclusions<K: ObjectStore, C: EsClient>(
    store: &K,
    client: &C,
    es: &Elasticsearch,
    leaving: &[String],
) -> Result<()> {
    if !is_zen2(client.version()) || leaving.is_empty() {
        return Ok(());
    }
    store
        .annotate_cluster(&es.name_any(), VOTING_CONFIG_EXCLUSIONS_ANNOTATION, Some("true"))
        .await?;
    info!(nodes = ?leaving, "Adding voting config exclusions");
    client.add_voting_config_exclusions(leaving).await?;
    Ok(())
}

/// Clears voting config exclusions once the pods match the StatefulSets.
///
/// Returns true when pods are still coming or going and the caller should
/// requeue.
pub async fn clear_voting_config_exclusions<K: ObjectStore, C: EsClient>(
    store: &K,
    client: &C,
    es: &Elasticsearch,
    actual_groups: &[TopologyGroup],
    actual_pods: &[Pod],
) -> Result<bool> {
    if !is_zen2(client.version()) || !es.has_voting_config_exclusions() {
        return Ok(false);
    }
    let expected: BTreeSet<String> = group_pod_names(actual_groups).into_iter().collect();
    let actual: BTreeSet<String> = actual_pods.iter().map(|p| p.name_any()).collect();
    if expected != actual {
        info!(
            es_name = %es.name_any(),
            "Cannot clear voting config exclusions yet: pods do not match StatefulSets"
        );
        return Ok(true);
    }
    info!(es_name = %es.name_any(), "Clearing voting config exclusions");
    client.delete_voting_config_exclusions(false).await?;
    store
        .annotate_cluster(&es.name_any(), VOTING_CONFIG_EXCLUSIONS_ANNOTATION, None)
        .await?;
    Ok(false)
}
