// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for es-operator.
//!
//! Uses proptest to generate random topologies and verify the downscale
//! planner never breaks its safety rules.

use proptest::prelude::*;

use es_operator::controller::downscale::{
    DownscaleState, calculate_downscales, calculate_removals_allowed, downscale_budget_filter,
    leaving_node_names, no_downscale_filter,
};
use es_operator::crd::ElasticsearchPhase;
use es_operator::topology::{TopologyGroup, parse_pod_name};

/// A live group and the replicas it should run (`None` once removed from the spec).
#[derive(Clone, Debug)]
struct GroupCase {
    actual: TopologyGroup,
    expected: Option<i32>,
}

fn any_group(index: usize) -> impl Strategy<Value = GroupCase> {
    (0..=6i32, any::<bool>(), any::<bool>(), prop::option::weighted(0.8, 0..=8i32)).prop_map(
        move |(replicas, master, data, expected)| GroupCase {
            actual: TopologyGroup::new(format!("quickstart-es-g{index}"), replicas, master, data),
            expected,
        },
    )
}

fn any_topology() -> impl Strategy<Value = Vec<GroupCase>> {
    (1..=5usize).prop_flat_map(|n| (0..n).map(any_group).collect::<Vec<_>>())
}

fn split(cases: &[GroupCase]) -> (Vec<TopologyGroup>, Vec<TopologyGroup>) {
    let actual = cases.iter().map(|c| c.actual.clone()).collect();
    let expected = cases
        .iter()
        .filter_map(|c| {
            c.expected.map(|replicas| {
                TopologyGroup::new(c.actual.name.clone(), replicas, c.actual.master, c.actual.data)
            })
        })
        .collect();
    (expected, actual)
}

fn running_masters(cases: &[GroupCase]) -> i32 {
    cases
        .iter()
        .filter(|c| c.actual.master)
        .map(|c| c.actual.replicas)
        .sum()
}

fn any_phase() -> impl Strategy<Value = ElasticsearchPhase> {
    prop_oneof![
        Just(ElasticsearchPhase::Unknown),
        Just(ElasticsearchPhase::Ready),
        Just(ElasticsearchPhase::ApplyingChanges),
        Just(ElasticsearchPhase::MigratingData),
        Just(ElasticsearchPhase::NodeShutdownStalled),
        Just(ElasticsearchPhase::Invalid),
    ]
}

proptest! {
    /// Property: a downscale only ever lowers replicas, and never past the expected count.
    #[test]
    fn test_downscales_only_decrease(
        cases in any_topology(),
        budget in prop::option::of(0..=4i32)
    ) {
        let (expected, actual) = split(&cases);
        let state = DownscaleState {
            running_masters: running_masters(&cases),
            master_removal_in_progress: false,
            removals_allowed: budget,
        };
        let (downscales, _) = calculate_downscales(state, &expected, &actual, downscale_budget_filter);
        for d in &downscales {
            prop_assert!(d.is_replica_decrease());
            prop_assert!(d.target_replicas >= d.final_replicas);
            prop_assert!(d.final_replicas >= 0);
        }
    }

    /// Property: leaving nodes are the highest ordinals, listed in descending order.
    #[test]
    fn test_leaving_nodes_are_highest_ordinals(cases in any_topology()) {
        let (expected, actual) = split(&cases);
        let state = DownscaleState {
            running_masters: running_masters(&cases),
            master_removal_in_progress: false,
            removals_allowed: None,
        };
        let (downscales, _) = calculate_downscales(state, &expected, &actual, no_downscale_filter);
        for d in &downscales {
            let ordinals: Vec<i32> = d
                .leaving_node_names()
                .iter()
                .map(|name| {
                    let (sts, ordinal) = parse_pod_name(name).unwrap();
                    assert_eq!(sts, d.group.name);
                    ordinal
                })
                .collect();
            let wanted: Vec<i32> = (d.target_replicas..d.initial_replicas).rev().collect();
            prop_assert_eq!(ordinals, wanted);
        }
        let total: i32 = downscales.iter().map(|d| d.initial_replicas - d.target_replicas).sum();
        prop_assert_eq!(leaving_node_names(&downscales).len(), usize::try_from(total).unwrap());
    }

    /// Property: groups already at or below their expected count are left alone.
    #[test]
    fn test_no_plan_without_decrease(cases in any_topology()) {
        let (expected, actual) = split(&cases);
        let state = DownscaleState {
            running_masters: running_masters(&cases),
            master_removal_in_progress: false,
            removals_allowed: None,
        };
        let (downscales, deletions) =
            calculate_downscales(state, &expected, &actual, no_downscale_filter);
        for case in &cases {
            let planned = downscales.iter().any(|d| d.group.name == case.actual.name);
            let deleted = deletions.iter().any(|g| g.name == case.actual.name);
            match case.expected {
                Some(replicas) => {
                    prop_assert_eq!(planned, replicas < case.actual.replicas);
                    prop_assert!(!deleted);
                }
                None => {
                    prop_assert_eq!(deleted, case.actual.replicas == 0);
                    prop_assert_eq!(planned, case.actual.replicas > 0);
                }
            }
        }
    }

    /// Property: without a budget every requested removal is planned at once.
    #[test]
    fn test_unfiltered_plan_reaches_expected(cases in any_topology()) {
        let (expected, actual) = split(&cases);
        let state = DownscaleState {
            running_masters: running_masters(&cases),
            master_removal_in_progress: false,
            removals_allowed: None,
        };
        let (downscales, _) = calculate_downscales(state, &expected, &actual, no_downscale_filter);
        for d in &downscales {
            prop_assert_eq!(d.target_replicas, d.final_replicas);
        }
    }

    /// Property: at most one master leaves per pass and one always keeps running.
    #[test]
    fn test_master_removals_are_safe(
        cases in any_topology(),
        budget in prop::option::of(0..=4i32)
    ) {
        let (expected, actual) = split(&cases);
        let masters = running_masters(&cases);
        let state = DownscaleState {
            running_masters: masters,
            master_removal_in_progress: false,
            removals_allowed: budget,
        };
        let (downscales, _) = calculate_downscales(state, &expected, &actual, downscale_budget_filter);
        let master_removals: i32 = downscales
            .iter()
            .filter(|d| d.group.master)
            .map(|d| d.initial_replicas - d.target_replicas)
            .sum();
        prop_assert!(master_removals <= 1);
        if master_removals > 0 {
            prop_assert!(masters - master_removals >= 1);
        }
    }

    /// Property: the change budget bounds the removals of one pass.
    #[test]
    fn test_budget_bounds_removals(cases in any_topology(), budget in 0..=4i32) {
        let (expected, actual) = split(&cases);
        let state = DownscaleState {
            running_masters: running_masters(&cases),
            master_removal_in_progress: false,
            removals_allowed: Some(budget),
        };
        let (downscales, _) = calculate_downscales(state, &expected, &actual, downscale_budget_filter);
        let removed: i32 = downscales.iter().map(|d| d.initial_replicas - d.target_replicas).sum();
        prop_assert!(removed <= budget);
    }

    /// Property: the removal allowance is never negative, and unbounded only for a negative budget.
    #[test]
    fn test_removals_allowed_non_negative(
        ready in 0..=50i32,
        desired in 0..=50i32,
        max_unavailable in prop::option::of(-2..=10i32)
    ) {
        match calculate_removals_allowed(ready, desired, max_unavailable) {
            Some(allowed) => {
                prop_assert!(allowed >= 0);
                prop_assert!(allowed <= ready.max(0) + max_unavailable.unwrap_or(1).max(0));
            }
            None => prop_assert!(max_unavailable.is_some_and(|m| m < 0)),
        }
    }

    /// Property: merging phases keeps the most significant one, in any order.
    #[test]
    fn test_phase_merge_commutes(a in any_phase(), b in any_phase()) {
        let merged = a.merge(b);
        prop_assert_eq!(merged, b.merge(a));
        prop_assert!(merged == a || merged == b);
        prop_assert_eq!(merged.merge(ElasticsearchPhase::Invalid), ElasticsearchPhase::Invalid);
    }
}
