//! Ordered safety checks a pod must pass before it is deleted for a restart.
//!
//! Every predicate can veto the deletion of a candidate. They run in the
//! order of [`PREDICATES`] and evaluation stops at the first veto. Users can
//! ignore a predicate by listing its name (or `*`) in the
//! `eck.k8s.elastic.co/disable-upgrade-predicates` annotation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::client::{EsClient, EsClientError, Shard, ShardState, ShardType};
use crate::controller::status::ReconcileState;
use crate::crd::ElasticsearchHealth;
use crate::observer::EsState;
use crate::topology::{
    is_data_pod, is_master_pod, is_node_lost, is_terminating, terminating_since,
};

/// Pods terminating for longer than this are not deleted again.
pub const TERMINATING_TIMEOUT_SECS: i64 = 300;

/// Facts shared by every predicate of one upgrade pass.
pub struct PredicateContext<'a, C> {
    pub es_state: &'a EsState<'a, C>,
    /// Ready pods that joined the cluster, by name. Accepted candidates are
    /// removed as the pass goes.
    pub healthy_pods: BTreeMap<String, Pod>,
    /// Every pod still running an outdated revision.
    pub to_upgrade: Vec<Pod>,
    /// Every pod of the cluster's StatefulSets.
    pub current_pods: Vec<Pod>,
    /// Names of the master pods of the desired topology.
    pub expected_masters: Vec<String>,
    /// Set once a current or future master was accepted this pass.
    pub master_update_in_progress: bool,
    pub now: jiff::Timestamp,
}

impl<'a, C> PredicateContext<'a, C> {
    pub fn new(
        es_state: &'a EsState<'a, C>,
        healthy_pods: BTreeMap<String, Pod>,
        to_upgrade: Vec<Pod>,
        current_pods: Vec<Pod>,
        expected_masters: Vec<String>,
    ) -> Self {
        Self {
            es_state,
            healthy_pods,
            to_upgrade,
            current_pods,
            expected_masters,
            master_update_in_progress: false,
            now: jiff::Timestamp::now(),
        }
    }

    fn is_healthy(&self, pod: &Pod) -> bool {
        self.healthy_pods.contains_key(&pod.name_any())
    }

    fn will_become_master(&self, pod: &Pod) -> bool {
        self.expected_masters.contains(&pod.name_any())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Predicate {
    MaxUnavailableReached,
    SkipTerminatingPods,
    OnlyRestartHealthyNodeIfGreen,
    RequireStartedReplica,
    OneMasterAtATime,
    LastMasterAfterMasterIneligibleNodes,
    LastHealthyMaster,
    SameShards,
    AllMembersOfATier,
}

/// Evaluation order.
pub const PREDICATES: [Predicate; 9] = [
    Predicate::MaxUnavailableReached,
    Predicate::SkipTerminatingPods,
    Predicate::OnlyRestartHealthyNodeIfGreen,
    Predicate::RequireStartedReplica,
    Predicate::OneMasterAtATime,
    Predicate::LastMasterAfterMasterIneligibleNodes,
    Predicate::LastHealthyMaster,
    Predicate::SameShards,
    Predicate::AllMembersOfATier,
];

impl Predicate {
    pub fn name(self) -> &'static str {
        match self {
            Predicate::MaxUnavailableReached => {
                "do_not_restart_healthy_node_if_MaxUnavailable_reached"
            }
            Predicate::SkipTerminatingPods => "skip_unknown_or_long_terminating_pods",
            Predicate::OnlyRestartHealthyNodeIfGreen => "do_not_restart_healthy_node_if_not_green",
            Predicate::RequireStartedReplica => "require_started_replica",
            Predicate::OneMasterAtATime => "one_master_at_a_time",
            Predicate::LastMasterAfterMasterIneligibleNodes => {
                "do_not_delete_last_master_if_all_master_ineligible_nodes_are_not_upgraded"
            }
            Predicate::LastHealthyMaster => "do_not_delete_last_healthy_master",
            Predicate::SameShards => "do_not_delete_pods_with_same_shards",
            Predicate::AllMembersOfATier => "do_not_delete_all_members_of_a_tier",
        }
    }

    /// Whether `candidate` may be deleted, given the pods already accepted
    /// this pass and whether the unavailability budget is exhausted.
    pub async fn check<C: EsClient>(
        self,
        ctx: &PredicateContext<'_, C>,
        candidate: &Pod,
        deleted: &[Pod],
        max_unavailable_reached: bool,
    ) -> Result<bool, EsClientError> {
        match self {
            Predicate::MaxUnavailableReached => {
                Ok(!(max_unavailable_reached && ctx.is_healthy(candidate)))
            }
            Predicate::SkipTerminatingPods => {
                if !is_terminating(candidate) {
                    return Ok(true);
                }
                if is_node_lost(candidate) {
                    return Ok(false);
                }
                let terminating_for = terminating_since(candidate)
                    .map(|since| ctx.now.as_second() - since.as_second())
                    .unwrap_or_default();
                Ok(terminating_for <= TERMINATING_TIMEOUT_SECS)
            }
            Predicate::OnlyRestartHealthyNodeIfGreen => {
                if ctx.es_state.green_health().await? {
                    return Ok(true);
                }
                Ok(!ctx.is_healthy(candidate))
            }
            Predicate::RequireStartedReplica => require_started_replica(ctx, candidate).await,
            Predicate::OneMasterAtATime => Ok(one_master_at_a_time(ctx, candidate)),
            Predicate::LastMasterAfterMasterIneligibleNodes => {
                if !is_master_pod(candidate) {
                    return Ok(true);
                }
                let name = candidate.name_any();
                let others = || ctx.to_upgrade.iter().filter(|p| p.name_any() != name);
                if others().any(is_master_pod) {
                    return Ok(true);
                }
                Ok(!others().any(|p| !is_master_pod(p)))
            }
            Predicate::LastHealthyMaster => {
                // A single master cluster restarts its only master anyway.
                if ctx.expected_masters.len() < 2 {
                    return Ok(true);
                }
                if !is_master_pod(candidate) || !ctx.is_healthy(candidate) {
                    return Ok(true);
                }
                let mut healthy_expected = ctx
                    .expected_masters
                    .iter()
                    .filter(|m| ctx.healthy_pods.contains_key(*m));
                match (healthy_expected.next(), healthy_expected.next()) {
                    (Some(only), None) => Ok(*only != candidate.name_any()),
                    _ => Ok(true),
                }
            }
            Predicate::SameShards => {
                if deleted.is_empty() {
                    return Ok(true);
                }
                let shards = ctx.es_state.shards_by_node().await?;
                let Some(on_candidate) = shards.get(&candidate.name_any()) else {
                    return Ok(true);
                };
                let conflict = deleted
                    .iter()
                    .filter_map(|p| shards.get(&p.name_any()))
                    .any(|on_deleted| conflicting_shards(on_candidate, on_deleted));
                Ok(!conflict)
            }
            Predicate::AllMembersOfATier => Ok(keeps_tier_available(ctx, candidate)),
        }
    }
}

/// Refuses to delete a node holding a primary whose replicas exist but none
/// of them is started elsewhere.
async fn require_started_replica<C: EsClient>(
    ctx: &PredicateContext<'_, C>,
    candidate: &Pod,
) -> Result<bool, EsClientError> {
    // Only data nodes hold shards.
    if !is_data_pod(candidate) {
        return Ok(true);
    }
    let healthy = ctx.is_healthy(candidate);
    if ctx.current_pods.len() == 1
        && healthy
        && ctx.es_state.health().await?.status == ElasticsearchHealth::Yellow
    {
        // Replicas of a single node cluster can never be assigned.
        return Ok(true);
    }

    let name = candidate.name_any();
    let shards = ctx.es_state.shards().await?;
    let on_candidate = |s: &&Shard| s.node_name.as_deref() == Some(name.as_str());

    // (copies elsewhere, started copies elsewhere) per shard.
    let mut copies: HashMap<(&str, &str), (usize, usize)> = HashMap::new();
    for shard in shards.iter().filter(|s| !on_candidate(s)) {
        let entry = copies.entry(shard.key()).or_default();
        entry.0 += 1;
        if shard.state == ShardState::Started {
            entry.1 += 1;
        }
    }

    let unprotected = shards
        .iter()
        .filter(on_candidate)
        .filter(|s| s.shard_type == ShardType::Primary)
        .find(|s| matches!(copies.get(&s.key()), Some((total, 0)) if *total > 0));
    if let Some(shard) = unprotected {
        debug!(
            candidate = %name,
            index = %shard.index,
            shard = %shard.shard,
            "Primary shard has no started replica, cannot delete pod"
        );
        return Ok(false);
    }
    Ok(true)
}

fn one_master_at_a_time<C>(ctx: &PredicateContext<'_, C>, candidate: &Pod) -> bool {
    let will_become_master = ctx.will_become_master(candidate);
    if !is_master_pod(candidate) {
        // Promoting a node to master counts as a master change.
        return !(will_become_master && ctx.master_update_in_progress);
    }
    if ctx.master_update_in_progress {
        return false;
    }
    if !ctx.is_healthy(candidate) {
        return true;
    }
    if !will_become_master {
        // Leaving the master set: every other master must stay healthy.
        let unhealthy = ctx
            .current_pods
            .iter()
            .filter(|p| is_master_pod(p))
            .find(|p| !ctx.is_healthy(p));
        if let Some(master) = unhealthy {
            debug!(
                candidate = %candidate.name_any(),
                unhealthy = %master.name_any(),
                "Cannot remove a master while another master is unhealthy"
            );
            return false;
        }
        return true;
    }
    let healthy_masters = ctx.healthy_pods.values().filter(|p| is_master_pod(p)).count();
    if healthy_masters == ctx.expected_masters.len() {
        return true;
    }
    debug!(
        expected_healthy_masters = ctx.expected_masters.len(),
        actually_healthy_masters = healthy_masters,
        "Cannot delete master for rolling upgrade"
    );
    false
}

/// Keeps at least one healthy data node while others of the tier exist.
fn keeps_tier_available<C>(ctx: &PredicateContext<'_, C>, candidate: &Pod) -> bool {
    if !ctx.is_healthy(candidate) || !is_data_pod(candidate) {
        return true;
    }
    let current = ctx.current_pods.iter().filter(|p| is_data_pod(p)).count();
    if current == 1 {
        return true;
    }
    let name = candidate.name_any();
    let healthy_others = ctx
        .healthy_pods
        .values()
        .filter(|p| p.name_any() != name && is_data_pod(p))
        .count();
    if healthy_others == 0 {
        debug!(
            candidate = %name,
            node_role = "data",
            "Delaying upgrade for pod to keep the tier available"
        );
        return false;
    }
    true
}

fn conflicting_shards(a: &[Shard], b: &[Shard]) -> bool {
    let keys: BTreeSet<(&str, &str)> = a.iter().map(Shard::key).collect();
    b.iter().any(|s| keys.contains(&s.key()))
}

/// The first predicate that vetoed a pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PredicateFailure {
    pub pod: String,
    pub predicate: &'static str,
}

/// Runs every enabled predicate on `candidate`, stopping at the first veto.
pub async fn run_predicates<C: EsClient>(
    ctx: &PredicateContext<'_, C>,
    candidate: &Pod,
    deleted: &[Pod],
    max_unavailable_reached: bool,
    disabled: &BTreeSet<String>,
) -> Result<Option<PredicateFailure>, EsClientError> {
    for predicate in PREDICATES {
        let name = predicate.name();
        let allowed = predicate
            .check(ctx, candidate, deleted, max_unavailable_reached)
            .await?;
        if allowed {
            continue;
        }
        if disabled.contains(name) || disabled.contains("*") {
            warn!(
                pod = %candidate.name_any(),
                predicate = name,
                "Upgrade predicate is disabled, ignoring its result"
            );
            continue;
        }
        return Ok(Some(PredicateFailure {
            pod: candidate.name_any(),
            predicate: name,
        }));
    }
    Ok(None)
}

/// Groups vetoed pods by predicate name, pods sorted.
pub fn group_by_predicates(failures: &BTreeMap<String, String>) -> BTreeMap<String, Vec<String>> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (pod, predicate) in failures {
        grouped.entry(predicate.clone()).or_default().push(pod.clone());
    }
    for pods in grouped.values_mut() {
        pods.sort();
    }
    grouped
}

/// Selects, in order, the candidates that pass every predicate, up to
/// `allowed_deletions` of them. Vetoes are recorded in `state`.
pub async fn apply_predicates<C: EsClient>(
    ctx: &mut PredicateContext<'_, C>,
    candidates: &[Pod],
    max_unavailable_reached: bool,
    mut allowed_deletions: i32,
    disabled: &BTreeSet<String>,
    state: &ReconcileState,
) -> Result<Vec<Pod>, EsClientError> {
    let mut deleted: Vec<Pod> = Vec::new();
    let mut failures: BTreeMap<String, String> = BTreeMap::new();

    for candidate in candidates {
        if allowed_deletions <= 0 {
            break;
        }
        match run_predicates(ctx, candidate, &deleted, max_unavailable_reached, disabled).await? {
            Some(failure) => {
                failures.insert(failure.pod, failure.predicate.to_string());
            }
            None => {
                if is_master_pod(candidate) || ctx.will_become_master(candidate) {
                    ctx.master_update_in_progress = true;
                }
                ctx.healthy_pods.remove(&candidate.name_any());
                deleted.push(candidate.clone());
                allowed_deletions -= 1;
            }
        }
    }

    if !failures.is_empty() {
        info!(
            failed_predicates = ?group_by_predicates(&failures),
            "Cannot restart some nodes for upgrade at this time"
        );
    }
    state.record_predicates_result(&failures);
    Ok(deleted)
}
