//! Rolling restart of pods running an outdated revision.
//!
//! Each pass selects the pods whose `controller-revision-hash` differs from
//! their StatefulSet's update revision, filters them through the predicate
//! chain and deletes the survivors so the StatefulSet controller recreates
//! them. Clusters that cannot lose a master (two or fewer) restart every
//! outdated pod at once when the version changes. Once no pod was deleted and
//! every node is back, shard allocation is re-enabled and completed restart
//! shutdowns are cleared.

pub mod predicates;

use std::cmp::Reverse;
use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::client::{EsClient, ShutdownStatus, ShutdownType, supports_node_shutdown};
use crate::crd::Elasticsearch;
use crate::observer::EsState;
use crate::shutdown::{NodeShutdown, NodeShutdownCoordinator};
use crate::store::{ObjectStore, is_conflict, is_not_found};
use crate::topology::{
    TopologyGroup, group_pod_names, is_master_pod, is_pod_ready, is_terminating, parse_pod_name,
    pod_name, pod_revision,
};

use super::error::{Error, Result};
use super::results::Results;
use super::status::ReconcileState;
use super::zen;

pub use predicates::{
    PREDICATES, Predicate, PredicateContext, PredicateFailure, apply_predicates,
    group_by_predicates, run_predicates,
};

/// Everything an upgrade pass reads or acts on.
pub struct UpgradeContext<'a, K, C> {
    pub es: &'a Elasticsearch,
    pub store: &'a K,
    pub es_client: &'a C,
    pub es_state: &'a EsState<'a, C>,
    pub state: &'a ReconcileState,
    pub statefulsets: &'a [StatefulSet],
    pub pods: &'a [Pod],
}

/// Pods whose revision differs from their StatefulSet's update revision,
/// highest ordinal first within each StatefulSet.
pub fn pods_to_upgrade(statefulsets: &[StatefulSet], pods: &[Pod]) -> Vec<Pod> {
    let mut result = Vec::new();
    for sts in statefulsets {
        let Some(update_revision) = sts
            .status
            .as_ref()
            .and_then(|s| s.update_revision.as_deref())
        else {
            continue;
        };
        let group = TopologyGroup::from_statefulset(sts);
        for ordinal in (0..group.replicas).rev() {
            let name = pod_name(&group.name, ordinal);
            let Some(pod) = pods.iter().find(|p| p.name_any() == name) else {
                continue;
            };
            if pod_revision(pod) != Some(update_revision) {
                result.push(pod.clone());
            }
        }
    }
    result
}

/// Pods that are running, ready, not terminating and part of the cluster.
pub async fn healthy_pods<C: EsClient>(
    es_state: &EsState<'_, C>,
    pods: &[Pod],
) -> Result<BTreeMap<String, Pod>> {
    let mut healthy = BTreeMap::new();
    for pod in pods {
        if is_terminating(pod) || !is_pod_ready(pod) {
            continue;
        }
        let name = pod.name_any();
        if es_state.nodes_in_cluster(std::slice::from_ref(&name)).await? {
            healthy.insert(name, pod.clone());
        }
    }
    Ok(healthy)
}

/// Non-masters before masters, then by StatefulSet, highest ordinal first.
pub fn sort_candidates(pods: &mut [Pod]) {
    pods.sort_by_cached_key(|p| {
        let name = p.name_any();
        let (sts, ordinal) = parse_pod_name(&name)
            .map(|(sts, ordinal)| (sts.to_string(), ordinal))
            .unwrap_or((name.clone(), 0));
        (is_master_pod(p), sts, Reverse(ordinal))
    });
}

/// How many pods may be deleted this pass, and whether the budget is
/// already exhausted. Expected pods that are not healthy count against it.
pub fn get_allowed_deletions(
    es: &Elasticsearch,
    healthy: &BTreeMap<String, Pod>,
) -> (i32, bool) {
    let Some(max_unavailable) = es
        .spec
        .update_strategy
        .change_budget
        .max_unavailable_or_default()
    else {
        return (i32::MAX, false);
    };
    let unhealthy = group_pod_names(&es.expected_groups())
        .iter()
        .filter(|name| !healthy.contains_key(*name))
        .count();
    let allowed = max_unavailable - i32::try_from(unhealthy).unwrap_or(i32::MAX);
    (allowed, allowed <= 0)
}

/// Whether losing any master would break quorum: two or fewer masters
/// expected and running.
pub fn is_non_ha_cluster(pods: &[Pod], expected_masters: &[String]) -> bool {
    if expected_masters.len() > 2 {
        return false;
    }
    pods.iter().filter(|p| is_master_pod(p)).count() <= 2
}

fn target_version(es: &Elasticsearch) -> Result<semver::Version> {
    semver::Version::parse(&es.spec.version)
        .map_err(|e| Error::Validation(format!("invalid version {:?}: {e}", es.spec.version)))
}

/// Whether the desired version is newer than the lowest running one.
pub fn is_version_upgrade(es: &Elasticsearch, running: &semver::Version) -> Result<bool> {
    Ok(target_version(es)? > *running)
}

/// Runs the upgrade step of a reconciliation pass.
pub async fn handle_upgrades<K: ObjectStore, C: EsClient>(ctx: &UpgradeContext<'_, K, C>) -> Results {
    let mut results = Results::new();

    let to_upgrade = pods_to_upgrade(ctx.statefulsets, ctx.pods);
    let names: Vec<String> = to_upgrade.iter().map(|p| p.name_any()).collect();
    ctx.state.record_nodes_to_be_upgraded(&names);

    let healthy = match healthy_pods(ctx.es_state, ctx.pods).await {
        Ok(h) => h,
        Err(e) => {
            results.with_error(e);
            return results;
        }
    };

    let restart = match restart_coordinator(ctx).await {
        Ok(r) => r,
        Err(e) => {
            results.with_error(e);
            return results;
        }
    };

    let full_restart = match is_version_upgrade(ctx.es, ctx.es_client.version()) {
        Ok(upgrade) => upgrade && is_non_ha_cluster(ctx.pods, &ctx.es.expected_master_names()),
        Err(e) => {
            results.with_error(e);
            return results;
        }
    };

    let deleted = if full_restart {
        run_full_restart(ctx, restart.as_ref(), &to_upgrade).await
    } else {
        run_rolling_upgrade(ctx, restart.as_ref(), to_upgrade.clone(), healthy).await
    };
    let deleted = match deleted {
        Ok(d) => d,
        Err(e) => {
            warn!(
                namespace = %ctx.es.namespace().unwrap_or_default(),
                es_name = %ctx.es.name_any(),
                full_restart,
                error = %e,
                "Rolling upgrade failed"
            );
            results.with_error(e);
            return results;
        }
    };

    if !deleted.is_empty() {
        // Nodes just went away, shard allocation stays as it is.
        results.with_requeue("Nodes upgrade in progress");
        return results;
    }
    if !to_upgrade.is_empty() {
        results.with_requeue("Nodes upgrade in progress");
    }

    let groups: Vec<TopologyGroup> = ctx
        .statefulsets
        .iter()
        .map(TopologyGroup::from_statefulset)
        .collect();
    results.merge(maybe_complete_node_upgrades(ctx, &groups, restart.as_ref()).await);
    results
}

/// Typed RESTART coordinator when the cluster supports node shutdowns.
async fn restart_coordinator<'a, K, C: EsClient>(
    ctx: &UpgradeContext<'a, K, C>,
) -> Result<Option<NodeShutdown<'a, C>>> {
    if !supports_node_shutdown(ctx.es_client.version()) {
        return Ok(None);
    }
    let ids = ctx.es_state.node_name_to_id().await?;
    Ok(Some(NodeShutdown::new(
        ctx.es_client,
        ids,
        ShutdownType::Restart,
        ctx.es.resource_version().unwrap_or_default(),
    )))
}

/// Selects and deletes the pods to restart. Returns the pods actually deleted.
async fn run_rolling_upgrade<K: ObjectStore, C: EsClient>(
    ctx: &UpgradeContext<'_, K, C>,
    restart: Option<&NodeShutdown<'_, C>>,
    to_upgrade: Vec<Pod>,
    healthy: BTreeMap<String, Pod>,
) -> Result<Vec<Pod>> {
    if to_upgrade.is_empty() {
        return Ok(Vec::new());
    }
    let (allowed, reached) = get_allowed_deletions(ctx.es, &healthy);

    let mut candidates = to_upgrade.clone();
    sort_candidates(&mut candidates);

    let mut predicate_ctx = PredicateContext::new(
        ctx.es_state,
        healthy,
        to_upgrade,
        ctx.pods.to_vec(),
        ctx.es.expected_master_names(),
    );
    let to_delete = apply_predicates(
        &mut predicate_ctx,
        &candidates,
        reached,
        allowed,
        &ctx.es.disabled_predicates(),
        ctx.state,
    )
    .await?;

    if to_delete.is_empty() {
        debug!(es_name = %ctx.es.name_any(), "No pod deleted during rolling upgrade");
        return Ok(Vec::new());
    }

    prepare_cluster_for_node_restart(ctx, restart, &to_delete).await?;

    let mut deleted = Vec::new();
    for pod in to_delete {
        handle_master_scale_change(ctx, &pod).await?;
        if !ready_to_delete(restart, &pod).await? {
            break;
        }
        if !delete_pod(ctx, &pod, "Deleting pod for rolling upgrade").await? {
            break;
        }
        deleted.push(pod);
    }
    Ok(deleted)
}

/// Deletes every outdated pod at once, or none of them while one is not
/// ready to go.
async fn run_full_restart<K: ObjectStore, C: EsClient>(
    ctx: &UpgradeContext<'_, K, C>,
    restart: Option<&NodeShutdown<'_, C>>,
    to_upgrade: &[Pod],
) -> Result<Vec<Pod>> {
    if to_upgrade.is_empty() {
        return Ok(Vec::new());
    }

    prepare_cluster_for_node_restart(ctx, restart, to_upgrade).await?;

    let mut not_ready = Vec::new();
    for pod in to_upgrade {
        handle_master_scale_change(ctx, pod).await?;
        if !ready_to_delete(restart, pod).await? {
            not_ready.push(pod.name_any());
        }
    }
    if !not_ready.is_empty() {
        info!(
            namespace = %ctx.es.namespace().unwrap_or_default(),
            es_name = %ctx.es.name_any(),
            pods = ?not_ready,
            "Not all pods are ready for a full cluster upgrade"
        );
        let names: Vec<String> = to_upgrade.iter().map(|p| p.name_any()).collect();
        ctx.state
            .record_upgrade_message(&names, "Not all pods are ready for a full cluster upgrade");
        return Ok(Vec::new());
    }

    let mut deleted = Vec::new();
    for pod in to_upgrade {
        if delete_pod(ctx, pod, "Deleting pod for full cluster upgrade").await? {
            deleted.push(pod.clone());
        }
    }
    Ok(deleted)
}

/// Deletes `pod` and records it. Returns false when the pod was already
/// replaced or changed since it was listed.
async fn delete_pod<K: ObjectStore, C>(
    ctx: &UpgradeContext<'_, K, C>,
    pod: &Pod,
    message: &str,
) -> Result<bool> {
    let name = pod.name_any();
    info!(
        namespace = %ctx.es.namespace().unwrap_or_default(),
        es_name = %ctx.es.name_any(),
        pod = %name,
        "{message}"
    );
    match ctx.store.delete_pod(pod).await {
        Ok(()) => {}
        Err(e) if is_not_found(&e) || is_conflict(&e) => {
            // Retried on the next pass.
            debug!(pod = %name, error = %e, "Pod changed before deletion");
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }
    ctx.state.record_deleted_node(&name, message);
    Ok(true)
}

/// Registers restart shutdowns, or on older clusters disables replica
/// allocation and flushes.
async fn prepare_cluster_for_node_restart<K: ObjectStore, C: EsClient>(
    ctx: &UpgradeContext<'_, K, C>,
    restart: Option<&NodeShutdown<'_, C>>,
    to_delete: &[Pod],
) -> Result<()> {
    if let Some(restart) = restart {
        let ready: Vec<String> = to_delete
            .iter()
            .filter(|p| is_pod_ready(p))
            .map(|p| p.name_any())
            .collect();
        restart.reconcile_shutdowns(&ready).await?;
        return Ok(());
    }

    if ctx.es_state.shard_allocations_enabled().await? {
        info!(es_name = %ctx.es.name_any(), "Disabling shard allocation for rolling upgrade");
        ctx.es_client.disable_replica_shard_allocation().await?;
    }
    do_flush(ctx.es, ctx.es_client).await
}

/// Synced flush when the target version is before 8.0, a plain flush
/// otherwise. Part of the cluster may already run the target version.
async fn do_flush<C: EsClient>(es: &Elasticsearch, client: &C) -> Result<()> {
    if target_version(es)?.major < 8 {
        info!(es_name = %es.name_any(), "Requesting a synced flush");
        match client.synced_flush().await {
            Err(e) if e.is_conflict() => {
                // Ongoing indexing prevents a synced flush on some shards.
                info!(es_name = %es.name_any(), "Synced flush partially failed, continuing");
            }
            other => other?,
        }
        return Ok(());
    }
    info!(es_name = %es.name_any(), "Requesting a flush");
    client.flush().await?;
    Ok(())
}

/// Excludes a master from voting when its restart takes it out of the
/// master set.
async fn handle_master_scale_change<K: ObjectStore, C: EsClient>(
    ctx: &UpgradeContext<'_, K, C>,
    pod: &Pod,
) -> Result<()> {
    if !is_master_pod(pod) {
        return Ok(());
    }
    let name = pod.name_any();
    if ctx.es.expected_master_names().contains(&name) {
        return Ok(());
    }
    zen::update_zen_settings_for_downscale(
        ctx.store,
        ctx.es_client,
        ctx.es,
        ctx.state,
        ctx.pods,
        std::slice::from_ref(&name),
    )
    .await
}

async fn ready_to_delete<C: EsClient>(
    restart: Option<&NodeShutdown<'_, C>>,
    pod: &Pod,
) -> Result<bool> {
    let Some(restart) = restart else {
        return Ok(true);
    };
    if !is_pod_ready(pod) {
        return Ok(true);
    }
    let name = pod.name_any();
    let status = restart.shutdown_status(&name).await?;
    if status.status == ShutdownStatus::Complete {
        return Ok(true);
    }
    info!(
        pod = %name,
        status = %status.status,
        explanation = status.explanation.as_deref().unwrap_or_default(),
        "Delaying pod deletion until restart shutdown is complete"
    );
    Ok(false)
}

/// Re-enables shard allocation and clears completed restart shutdowns once
/// every expected node is back in the cluster.
async fn maybe_complete_node_upgrades<K, C: EsClient>(
    ctx: &UpgradeContext<'_, K, C>,
    groups: &[TopologyGroup],
    restart: Option<&NodeShutdown<'_, C>>,
) -> Results {
    let mut results = Results::new();
    let expected = group_pod_names(groups);
    match ctx.es_state.nodes_in_cluster(&expected).await {
        Ok(true) => {}
        Ok(false) => {
            info!(
                es_name = %ctx.es.name_any(),
                "Some upgraded nodes are not back in the cluster yet, cannot complete upgrade"
            );
            results.with_requeue("Nodes upgrade: some nodes are not back in the cluster yet");
            return results;
        }
        Err(e) => {
            results.with_error(e);
            return results;
        }
    }

    match ctx.es_state.shard_allocations_enabled().await {
        Ok(true) => {}
        Ok(false) => {
            info!(es_name = %ctx.es.name_any(), "Enabling shard allocation");
            if let Err(e) = ctx.es_client.enable_shard_allocation().await {
                results.with_error(e);
                return results;
            }
        }
        Err(e) => {
            results.with_error(e);
            return results;
        }
    }

    if let Some(restart) = restart
        && let Err(e) = restart.clear(Some(ShutdownStatus::Complete)).await
    {
        results.with_error(e);
    }
    results
}
