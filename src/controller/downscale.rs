//! Downscale planning and execution.
//!
//! Planning is a sequential fold over the live StatefulSets: every group asks
//! the shared [`DownscaleState`] how many of its nodes may go, and the answer
//! shrinks the allowance seen by the groups after it. Execution then waits,
//! node by node from the highest ordinal, for the shutdown coordinator to
//! report the leaving nodes as drained before lowering the replica count.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::client::{EsClient, ShutdownStatus};
use crate::crd::{DEFAULT_MAX_UNAVAILABLE, Elasticsearch, ElasticsearchPhase};
use crate::shutdown::NodeShutdownCoordinator;
use crate::store::{ObjectStore, ignore_not_found};
use crate::topology::{
    TopologyGroup, config_secret_name, headless_service_name, is_master_pod, is_pod_ready,
    is_terminating, pod_name, transport_certs_secret_name,
};

use super::error::{Error, Result};
use super::results::Results;
use super::status::{EVENT_REASON_DELAYED, EVENT_REASON_STALLED, EventKind, ReconcileState};
use super::zen;

pub const ONE_MASTER_AT_A_TIME_REASON: &str =
    "One master at a time: a master node is already in the process of being removed";
pub const AT_LEAST_ONE_MASTER_REASON: &str = "Cannot remove the last running master node";
pub const RESPECT_MAX_UNAVAILABLE_REASON: &str =
    "Not removing node to respect maxUnavailable of the change budget";

/// Number of nodes that may be removed without going below
/// `desired_nodes - max_unavailable` ready nodes.
///
/// `max_unavailable` is the raw change budget setting: absent means the
/// default of 1, negative means unbounded (`None`).
pub fn calculate_removals_allowed(
    nodes_ready: i32,
    desired_nodes: i32,
    max_unavailable: Option<i32>,
) -> Option<i32> {
    let max_unavailable = match max_unavailable {
        None => DEFAULT_MAX_UNAVAILABLE,
        Some(m) if m < 0 => return None,
        Some(m) => m,
    };
    let min_available = desired_nodes - max_unavailable;
    Some((nodes_ready - min_available).max(0))
}

/// Allowance shared by every group of one planning pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DownscaleState {
    /// Ready master nodes.
    pub running_masters: i32,
    /// Set once a master removal has been planned in this pass.
    pub master_removal_in_progress: bool,
    /// Remaining node removals; `None` when unbounded.
    pub removals_allowed: Option<i32>,
}

impl DownscaleState {
    pub fn new(pods: &[Pod], es: &Elasticsearch) -> Self {
        let available: Vec<&Pod> = pods
            .iter()
            .filter(|p| is_pod_ready(p) && !is_terminating(p))
            .collect();
        let running_masters = available.iter().filter(|p| is_master_pod(p)).count();
        let desired_nodes: i32 = es.spec.node_sets.iter().map(|ns| ns.count.max(0)).sum();
        Self {
            running_masters: count(running_masters),
            master_removal_in_progress: false,
            removals_allowed: calculate_removals_allowed(
                count(available.len()),
                desired_nodes,
                es.spec.update_strategy.change_budget.max_unavailable,
            ),
        }
    }

    /// How many of `requested` removals the group may perform, and why not
    /// all of them when that is 0.
    pub fn check_downscale_invariants(
        &self,
        group: &TopologyGroup,
        requested: i32,
    ) -> (i32, Option<&'static str>) {
        let mut allowed = requested;
        if group.master {
            if self.master_removal_in_progress {
                return (0, Some(ONE_MASTER_AT_A_TIME_REASON));
            }
            if self.running_masters <= 1 {
                return (0, Some(AT_LEAST_ONE_MASTER_REASON));
            }
            allowed = allowed.min(1);
        }
        if let Some(budget) = self.removals_allowed {
            if budget <= 0 {
                return (0, Some(RESPECT_MAX_UNAVAILABLE_REASON));
            }
            allowed = allowed.min(budget);
        }
        (allowed, None)
    }

    pub fn record_node_removal(&mut self, group: &TopologyGroup, removed: i32) {
        if removed <= 0 {
            return;
        }
        if let Some(budget) = self.removals_allowed.as_mut() {
            *budget -= removed;
        }
        if group.master {
            self.running_masters -= removed;
            self.master_removal_in_progress = true;
        }
    }
}

fn count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// Decides how many of the requested removals a group performs this pass.
pub type DownscaleFilter = fn(&mut DownscaleState, &TopologyGroup, i32) -> i32;

/// Every requested removal, regardless of budget: the eventual leaving nodes.
pub fn no_downscale_filter(_: &mut DownscaleState, _: &TopologyGroup, requested: i32) -> i32 {
    requested
}

/// Removals the invariants allow right now, recorded against the state.
pub fn downscale_budget_filter(
    state: &mut DownscaleState,
    group: &TopologyGroup,
    requested: i32,
) -> i32 {
    let (allowed, reason) = state.check_downscale_invariants(group, requested);
    if allowed == 0 {
        debug!(
            statefulset = %group.name,
            reason = reason.unwrap_or_default(),
            "Cannot downscale StatefulSet this pass"
        );
        return 0;
    }
    state.record_node_removal(group, allowed);
    allowed
}

/// A planned replica decrease of one group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Downscale {
    pub group: TopologyGroup,
    pub initial_replicas: i32,
    pub target_replicas: i32,
    /// Replicas once every requested removal went through.
    pub final_replicas: i32,
}

impl Downscale {
    pub fn is_replica_decrease(&self) -> bool {
        self.target_replicas < self.initial_replicas
    }

    /// Pods leaving the group, highest ordinal first.
    pub fn leaving_node_names(&self) -> Vec<String> {
        (self.target_replicas..self.initial_replicas)
            .rev()
            .map(|ordinal| pod_name(&self.group.name, ordinal))
            .collect()
    }
}

pub fn leaving_node_names(downscales: &[Downscale]) -> Vec<String> {
    downscales
        .iter()
        .flat_map(Downscale::leaving_node_names)
        .collect()
}

/// Plans downscales of the live groups towards the expected ones.
///
/// Returns the downscales and the groups to delete outright: groups no
/// longer expected that already run zero replicas.
pub fn calculate_downscales(
    mut state: DownscaleState,
    expected: &[TopologyGroup],
    actual: &[TopologyGroup],
    filter: DownscaleFilter,
) -> (Vec<Downscale>, Vec<TopologyGroup>) {
    let mut downscales = Vec::new();
    let mut deletions = Vec::new();
    for group in actual {
        let expected_group = expected.iter().find(|g| g.name == group.name);
        let expected_replicas = expected_group.map_or(0, |g| g.replicas);
        let actual_replicas = group.replicas;

        if expected_group.is_none() && actual_replicas == 0 {
            deletions.push(group.clone());
            continue;
        }
        if expected_replicas >= actual_replicas {
            continue;
        }
        let requested = actual_replicas - expected_replicas;
        let allowed = filter(&mut state, group, requested);
        if allowed <= 0 {
            continue;
        }
        downscales.push(Downscale {
            group: group.clone(),
            initial_replicas: actual_replicas,
            target_replicas: actual_replicas - allowed,
            final_replicas: expected_replicas,
        });
    }
    (downscales, deletions)
}

/// Everything a downscale needs to act on the cluster.
pub struct DownscaleContext<'a, K, C, S> {
    pub es: &'a Elasticsearch,
    pub store: &'a K,
    pub es_client: &'a C,
    pub shutdown: &'a S,
    pub state: &'a ReconcileState,
    pub actual_pods: &'a [Pod],
}

impl<K, C, S> DownscaleContext<'_, K, C, S>
where
    K: ObjectStore,
    C: EsClient,
    S: NodeShutdownCoordinator,
{
    fn es_name(&self) -> String {
        self.es.name_any()
    }

    fn namespace(&self) -> String {
        self.es.namespace().unwrap_or_default()
    }
}

/// Runs the downscale step of a reconciliation pass.
pub async fn handle_downscale<K, C, S>(
    ctx: &DownscaleContext<'_, K, C, S>,
    expected: &[TopologyGroup],
    actual: &[TopologyGroup],
) -> Results
where
    K: ObjectStore,
    C: EsClient,
    S: NodeShutdownCoordinator,
{
    let mut results = Results::new();
    let state = DownscaleState::new(ctx.actual_pods, ctx.es);

    let (requested, deletions) = calculate_downscales(state, expected, actual, no_downscale_filter);
    let (downscales, _) = calculate_downscales(state, expected, actual, downscale_budget_filter);

    if let Err(e) = delete_group_resources(ctx, &deletions).await {
        results.with_error(e);
    }

    // Status lists every node that will eventually leave; only the nodes the
    // budget lets go this pass are drained. An empty list cancels outstanding
    // shutdowns.
    let desired = leaving_node_names(&requested);
    ctx.state.record_nodes_to_be_removed(&desired);
    let leaving = leaving_node_names(&downscales);
    if let Err(e) = ctx.shutdown.reconcile_shutdowns(&leaving).await {
        warn!(
            namespace = %ctx.namespace(),
            es_name = %ctx.es_name(),
            error = %e,
            "Failed to reconcile node shutdowns"
        );
        results.with_error(e);
        return results;
    }

    for downscale in &downscales {
        match attempt_downscale(ctx, downscale).await {
            Ok(true) => {
                results.with_requeue("Downscale in progress");
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    namespace = %ctx.namespace(),
                    es_name = %ctx.es_name(),
                    statefulset = %downscale.group.name,
                    error = %e,
                    "Downscale failed"
                );
                results.with_error(e);
            }
        }
    }

    let mut delayed: Vec<String> = desired
        .into_iter()
        .filter(|n| !leaving.contains(n))
        .collect();
    if !delayed.is_empty() {
        delayed.sort();
        results.with_requeue(format!(
            "Downscale in progress, delayed nodes: [{}]",
            delayed.join(", ")
        ));
    }
    results
}

/// Deletes groups scaled to zero, along with their per-group resources.
async fn delete_group_resources<K, C, S>(
    ctx: &DownscaleContext<'_, K, C, S>,
    groups: &[TopologyGroup],
) -> Result<()>
where
    K: ObjectStore,
    C: EsClient,
    S: NodeShutdownCoordinator,
{
    for group in groups {
        info!(
            namespace = %ctx.namespace(),
            es_name = %ctx.es_name(),
            statefulset = %group.name,
            "Deleting StatefulSet"
        );
        ignore_not_found(ctx.store.delete_service(&headless_service_name(&group.name)).await)?;
        ignore_not_found(ctx.store.delete_secret(&config_secret_name(&group.name)).await)?;
        ignore_not_found(
            ctx.store
                .delete_secret(&transport_certs_secret_name(&group.name))
                .await,
        )?;
        ignore_not_found(ctx.store.delete_statefulset(&group.name).await)?;
    }
    Ok(())
}

/// Lowers the target of `downscale` to the nodes whose shutdown completed,
/// walking leaving nodes from the highest ordinal and stopping at the first
/// one still draining.
pub async fn calculate_performable_downscale<K, C, S>(
    ctx: &DownscaleContext<'_, K, C, S>,
    downscale: &Downscale,
) -> Result<Downscale>
where
    K: ObjectStore,
    C: EsClient,
    S: NodeShutdownCoordinator,
{
    let mut performable = Downscale {
        target_replicas: downscale.initial_replicas,
        ..downscale.clone()
    };
    for node in downscale.leaving_node_names() {
        let status = ctx.shutdown.shutdown_status(&node).await.inspect_err(|e| {
            warn!(node = %node, error = %e, "Error while checking shutdown status");
        })?;
        let explanation = status.explanation.unwrap_or_default();
        match status.status {
            ShutdownStatus::Complete => {
                performable.target_replicas -= 1;
            }
            ShutdownStatus::Stalled => {
                ctx.state
                    .update_phase(ElasticsearchPhase::NodeShutdownStalled)
                    .add_event(
                        EventKind::Warning,
                        EVENT_REASON_STALLED,
                        format!(
                            "Requested topology change is stalled. User intervention maybe required if this condition persists. {explanation}"
                        ),
                    );
                return Ok(performable);
            }
            ShutdownStatus::InProgress => {
                info!(node = %node, explanation = %explanation, "Node shutdown in progress");
                ctx.state
                    .update_phase(ElasticsearchPhase::MigratingData)
                    .add_event(
                        EventKind::Normal,
                        EVENT_REASON_DELAYED,
                        "Requested topology change delayed by data migration. Ensure index settings allow node removal.",
                    );
                return Ok(performable);
            }
            ShutdownStatus::NotStarted => {
                return Err(Error::Transient(format!(
                    "Unexpected state. Node shutdown could not be started: {explanation}"
                )));
            }
        }
    }
    Ok(performable)
}

/// Performs as much of `downscale` as drained nodes allow. Returns whether a
/// requeue is needed to finish it.
pub async fn attempt_downscale<K, C, S>(
    ctx: &DownscaleContext<'_, K, C, S>,
    downscale: &Downscale,
) -> Result<bool>
where
    K: ObjectStore,
    C: EsClient,
    S: NodeShutdownCoordinator,
{
    if !downscale.is_replica_decrease() {
        return Ok(false);
    }
    let performable = calculate_performable_downscale(ctx, downscale).await?;
    if !performable.is_replica_decrease() {
        return Ok(true);
    }
    let requeue = performable.target_replicas != downscale.target_replicas;
    do_downscale(ctx, &performable).await?;
    Ok(requeue)
}

async fn do_downscale<K, C, S>(
    ctx: &DownscaleContext<'_, K, C, S>,
    downscale: &Downscale,
) -> Result<()>
where
    K: ObjectStore,
    C: EsClient,
    S: NodeShutdownCoordinator,
{
    info!(
        namespace = %ctx.namespace(),
        es_name = %ctx.es_name(),
        statefulset = %downscale.group.name,
        from = downscale.initial_replicas,
        to = downscale.target_replicas,
        "Scaling replicas down"
    );
    if downscale.group.master {
        zen::update_zen_settings_for_downscale(
            ctx.store,
            ctx.es_client,
            ctx.es,
            ctx.state,
            ctx.actual_pods,
            &downscale.leaving_node_names(),
        )
        .await?;
    }
    ctx.store
        .scale_statefulset(&downscale.group.name, downscale.target_replicas)
        .await?;
    Ok(())
}
