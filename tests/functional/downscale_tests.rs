//! Downscale scenarios: planning leaving nodes, draining them, scaling down.

use k8s_openapi::api::core::v1::Pod;

use es_operator::client::fake::node_id;
use es_operator::client::{FakeEsClient, ShutdownStatus, ShutdownType};
use es_operator::controller::downscale::{DownscaleContext, handle_downscale};
use es_operator::controller::results::Results;
use es_operator::controller::status::{
    EVENT_REASON_DELAYED, EVENT_REASON_STALLED, EVENT_REASON_UNHEALTHY, EventKind, ReconcileState,
};
use es_operator::crd::{Elasticsearch, ElasticsearchPhase, VOTING_CONFIG_EXCLUSIONS_ANNOTATION};
use es_operator::observer::EsState;
use es_operator::shutdown::{ObservedShutdown, ShutdownStrategy};
use es_operator::store::FakeStore;
use es_operator::topology::TopologyGroup;

use crate::common::fixtures::{CLUSTER, ElasticsearchBuilder, StatefulSetBuilder, node_set_pods};
use crate::{client_with_pods, listed, v7_10, v8};

/// Runs the downscale step once, the way the driver does.
async fn downscale(
    es: &Elasticsearch,
    store: &FakeStore,
    client: &FakeEsClient,
    state: &ReconcileState,
) -> Results {
    let (statefulsets, pods) = listed(store).await;
    let actual: Vec<TopologyGroup> = statefulsets
        .iter()
        .map(TopologyGroup::from_statefulset)
        .collect();
    let ids = EsState::new(client).node_name_to_id().await.unwrap();
    let strategy = ShutdownStrategy::for_cluster(client, ids, ShutdownType::Remove, "1");
    let shutdown = ObservedShutdown::new(strategy, Some(state));
    let ctx = DownscaleContext {
        es,
        store,
        es_client: client,
        shutdown: &shutdown,
        state,
        actual_pods: &pods,
    };
    handle_downscale(&ctx, &es.expected_groups(), &actual).await
}

/// Three masters and three data nodes, data scaled down to `data`.
fn data_downscale(data: i32) -> (Elasticsearch, FakeStore, Vec<Pod>) {
    let es = ElasticsearchBuilder::new(CLUSTER)
        .node_set("masters", 3, &["master"])
        .node_set("data", data, &["data"])
        .build();
    let mut pods = node_set_pods(CLUSTER, "masters", 3, true, false, "r1");
    pods.extend(node_set_pods(CLUSTER, "data", 3, false, true, "r1"));
    let store = FakeStore::new()
        .with_statefulset(
            StatefulSetBuilder::new(CLUSTER, "masters")
                .replicas(3)
                .roles(true, false)
                .build(),
        )
        .with_statefulset(StatefulSetBuilder::new(CLUSTER, "data").replicas(3).build())
        .with_pods(pods.clone());
    (es, store, pods)
}

#[tokio::test]
async fn test_data_downscale_once_shutdown_complete() {
    let (es, store, pods) = data_downscale(2);
    let client = client_with_pods(v8(), &pods).with_new_shutdown_status(ShutdownStatus::Complete);
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;

    assert!(results.is_reconciled(), "unexpected results: {results:?}");
    assert_eq!(store.replicas("quickstart-es-data"), Some(2));
    assert_eq!(store.calls(), vec!["scale quickstart-es-data 2"]);

    let shutdowns = client.registered_shutdowns();
    assert_eq!(shutdowns.len(), 1);
    assert_eq!(shutdowns[0].node_id, "id-quickstart-es-data-2");
    assert_eq!(shutdowns[0].shutdown_type, "REMOVE");

    let operations = state.operations();
    assert_eq!(operations.downscale.nodes[0].name, "quickstart-es-data-2");
    assert_eq!(operations.downscale.nodes[0].shutdown_status, "COMPLETE");
}

#[tokio::test]
async fn test_data_downscale_waits_for_shutdown() {
    let (es, store, pods) = data_downscale(2);
    let client = client_with_pods(v8(), &pods);
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;

    assert!(results.has_requeue());
    assert!(!results.has_error());
    assert_eq!(store.replicas("quickstart-es-data"), Some(3));
    assert!(store.calls().is_empty());
    assert_eq!(state.phase(), ElasticsearchPhase::MigratingData);
    assert!(
        state
            .events()
            .iter()
            .any(|e| e.kind == EventKind::Normal && e.reason == EVENT_REASON_DELAYED)
    );

    // Draining finished: the next pass scales down without a new request.
    client.set_shutdown_status("quickstart-es-data-2", ShutdownStatus::Complete, None);
    client.clear_calls();
    let state = ReconcileState::new(&es);
    let results = downscale(&es, &store, &client, &state).await;
    assert!(results.is_reconciled());
    assert_eq!(store.replicas("quickstart-es-data"), Some(2));
    assert_eq!(client.call_count("PUT /_nodes/"), 0);
}

#[tokio::test]
async fn test_stalled_shutdown_is_reported() {
    let (es, store, pods) = data_downscale(2);
    let client = client_with_pods(v8(), &pods).with_new_shutdown_status(ShutdownStatus::Stalled);
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;

    assert!(results.has_requeue());
    assert!(!results.has_error());
    assert_eq!(store.replicas("quickstart-es-data"), Some(3));
    assert_eq!(state.phase(), ElasticsearchPhase::NodeShutdownStalled);
    let events = state.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, EventKind::Warning);
    assert_eq!(events[0].reason, EVENT_REASON_STALLED);
    assert_eq!(state.operations().downscale.stalled, Some(true));
}

#[tokio::test]
async fn test_several_nodes_leave_in_one_pass() {
    let (es, store, pods) = data_downscale(1);
    let client = client_with_pods(v8(), &pods).with_new_shutdown_status(ShutdownStatus::Complete);
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;
    assert!(results.is_reconciled());
    assert_eq!(store.replicas("quickstart-es-data"), Some(1));

    let leaving: Vec<String> = state
        .operations()
        .downscale
        .nodes
        .into_iter()
        .map(|n| n.name)
        .collect();
    assert_eq!(leaving, vec!["quickstart-es-data-1", "quickstart-es-data-2"]);
}

#[tokio::test]
async fn test_in_progress_high_ordinal_blocks_lower_ones() {
    let (es, store, pods) = data_downscale(1);
    let client = client_with_pods(v8(), &pods);
    let state = ReconcileState::new(&es);

    // Register both shutdowns, then complete only the lower ordinal.
    downscale(&es, &store, &client, &state).await;
    client.set_shutdown_status("quickstart-es-data-1", ShutdownStatus::Complete, None);

    let state = ReconcileState::new(&es);
    let results = downscale(&es, &store, &client, &state).await;
    assert!(results.has_requeue());
    assert_eq!(store.replicas("quickstart-es-data"), Some(3));
    assert_eq!(state.phase(), ElasticsearchPhase::MigratingData);
}

#[tokio::test]
async fn test_budget_delays_nodes() {
    let es = ElasticsearchBuilder::new(CLUSTER)
        .node_set("masters", 3, &["master"])
        .node_set("data", 1, &["data"])
        .max_unavailable(0)
        .build();
    let mut pods = node_set_pods(CLUSTER, "masters", 3, true, false, "r1");
    pods.extend(node_set_pods(CLUSTER, "data", 3, false, true, "r1"));
    // One data node is down: only one removal fits in the budget.
    pods[3].status = None;
    let store = FakeStore::new()
        .with_statefulset(
            StatefulSetBuilder::new(CLUSTER, "masters")
                .replicas(3)
                .roles(true, false)
                .build(),
        )
        .with_statefulset(StatefulSetBuilder::new(CLUSTER, "data").replicas(3).build())
        .with_pods(pods.clone());
    let client = client_with_pods(v8(), &pods).with_new_shutdown_status(ShutdownStatus::Complete);
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;

    assert_eq!(store.replicas("quickstart-es-data"), Some(2));
    // Only the budgeted node drains; the delayed one is listed in status.
    let shutdowns = client.registered_shutdowns();
    assert_eq!(shutdowns.len(), 1);
    assert_eq!(shutdowns[0].node_id, node_id("quickstart-es-data-2"));
    let downscale = state.operations().downscale;
    assert_eq!(downscale.nodes.len(), 2);
    assert_eq!(downscale.nodes[0].name, "quickstart-es-data-1");
    assert_eq!(downscale.nodes[0].shutdown_status, "NOT_STARTED");
    assert_eq!(downscale.nodes[1].shutdown_status, "COMPLETE");
    assert_eq!(
        results.reason(),
        Some("Downscale in progress, delayed nodes: [quickstart-es-data-1]")
    );
}

#[tokio::test]
async fn test_master_downscale_drains_one_master_at_a_time() {
    let es = ElasticsearchBuilder::new(CLUSTER)
        .node_set("masters", 1, &["master"])
        .node_set("data", 2, &["data"])
        .build();
    let mut pods = node_set_pods(CLUSTER, "masters", 3, true, false, "r1");
    pods.extend(node_set_pods(CLUSTER, "data", 2, false, true, "r1"));
    let store = FakeStore::new()
        .with_statefulset(
            StatefulSetBuilder::new(CLUSTER, "masters")
                .replicas(3)
                .roles(true, false)
                .build(),
        )
        .with_statefulset(StatefulSetBuilder::new(CLUSTER, "data").replicas(2).build())
        .with_pods(pods.clone());
    // Draining never finishes, so the masters stay in place.
    let client = client_with_pods(v8(), &pods);
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;

    assert!(results.has_requeue());
    assert_eq!(store.replicas("quickstart-es-masters"), Some(3));
    let shutdowns = client.registered_shutdowns();
    assert_eq!(shutdowns.len(), 1);
    assert_eq!(shutdowns[0].node_id, node_id("quickstart-es-masters-2"));
    assert_eq!(client.call_count("PUT /_nodes/"), 1);
    let leaving: Vec<String> = state
        .operations()
        .downscale
        .nodes
        .into_iter()
        .map(|n| n.name)
        .collect();
    assert_eq!(
        leaving,
        vec!["quickstart-es-masters-1", "quickstart-es-masters-2"]
    );
}

#[tokio::test]
async fn test_master_downscale_one_at_a_time_with_voting_exclusions() {
    let es = ElasticsearchBuilder::new(CLUSTER)
        .node_set("masters", 1, &["master"])
        .node_set("data", 2, &["data"])
        .build();
    let mut pods = node_set_pods(CLUSTER, "masters", 3, true, false, "r1");
    pods.extend(node_set_pods(CLUSTER, "data", 2, false, true, "r1"));
    let store = FakeStore::new()
        .with_statefulset(
            StatefulSetBuilder::new(CLUSTER, "masters")
                .replicas(3)
                .roles(true, false)
                .build(),
        )
        .with_statefulset(StatefulSetBuilder::new(CLUSTER, "data").replicas(2).build())
        .with_pods(pods.clone());
    let client = client_with_pods(v8(), &pods).with_new_shutdown_status(ShutdownStatus::Complete);
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;

    assert_eq!(store.replicas("quickstart-es-masters"), Some(2));
    assert_eq!(client.voting_config_exclusions(), vec!["quickstart-es-masters-2"]);
    assert_eq!(
        store.annotation(VOTING_CONFIG_EXCLUSIONS_ANNOTATION),
        Some("true".to_string())
    );
    // The voting exclusion is recorded before the replicas change.
    assert_eq!(
        store.calls(),
        vec![
            format!("annotate quickstart {VOTING_CONFIG_EXCLUSIONS_ANNOTATION}=true"),
            "scale quickstart-es-masters 2".to_string(),
        ]
    );
    assert_eq!(
        results.reason(),
        Some("Downscale in progress, delayed nodes: [quickstart-es-masters-1]")
    );
}

#[tokio::test]
async fn test_zen1_two_masters_to_one() {
    let es = ElasticsearchBuilder::new(CLUSTER)
        .version("6.8.23")
        .node_set("masters", 1, &["master"])
        .node_set("data", 1, &["data"])
        .build();
    let mut pods = node_set_pods(CLUSTER, "masters", 2, true, false, "r1");
    pods.extend(node_set_pods(CLUSTER, "data", 1, false, true, "r1"));
    let store = FakeStore::new()
        .with_statefulset(
            StatefulSetBuilder::new(CLUSTER, "masters")
                .replicas(2)
                .roles(true, false)
                .build(),
        )
        .with_statefulset(StatefulSetBuilder::new(CLUSTER, "data").build())
        .with_pods(pods.clone());
    let client = client_with_pods(semver::Version::new(6, 8, 23), &pods);
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;

    assert!(results.is_reconciled(), "unexpected results: {results:?}");
    assert_eq!(client.excluded_nodes(), "quickstart-es-masters-1");
    assert_eq!(client.minimum_master_nodes(), Some(1));
    assert!(client.voting_config_exclusions().is_empty());
    assert_eq!(store.replicas("quickstart-es-masters"), Some(1));
    assert!(
        state
            .events()
            .iter()
            .any(|e| e.kind == EventKind::Warning && e.reason == EVENT_REASON_UNHEALTHY)
    );
}

#[tokio::test]
async fn test_legacy_downscale_waits_for_shards_to_move() {
    let (es, store, pods) = data_downscale(2);
    let client = client_with_pods(v7_10(), &pods).with_shard("logs", "0", "quickstart-es-data-2");
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;

    assert!(results.has_requeue());
    assert_eq!(client.excluded_nodes(), "quickstart-es-data-2");
    assert_eq!(store.replicas("quickstart-es-data"), Some(3));
    let operations = state.operations();
    assert_eq!(operations.downscale.nodes[0].shutdown_status, "IN_PROGRESS");
    assert!(
        operations.downscale.nodes[0]
            .explanation
            .as_deref()
            .unwrap()
            .contains("shards remaining")
    );
}

#[tokio::test]
async fn test_removed_node_set_is_deleted_with_its_resources() {
    let es = ElasticsearchBuilder::new(CLUSTER).node_set("default", 3, &[]).build();
    let pods = node_set_pods(CLUSTER, "default", 3, true, true, "r1");
    let store = FakeStore::new()
        .with_statefulset(
            StatefulSetBuilder::new(CLUSTER, "default")
                .replicas(3)
                .roles(true, true)
                .build(),
        )
        .with_statefulset(StatefulSetBuilder::new(CLUSTER, "old").replicas(0).build())
        .with_service("quickstart-es-old")
        .with_secret("quickstart-es-old-es-config")
        .with_pods(pods.clone());
    let client = client_with_pods(v8(), &pods);
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;

    assert!(results.is_reconciled(), "unexpected results: {results:?}");
    assert!(!store.has_statefulset("quickstart-es-old"));
    assert!(store.has_statefulset("quickstart-es-default"));
    assert!(store.services().is_empty());
    assert!(store.secrets().is_empty());
    assert_eq!(
        store.calls(),
        vec![
            "delete service quickstart-es-old",
            "delete secret quickstart-es-old-es-config",
            "delete secret quickstart-es-old-es-transport-certs",
            "delete statefulset quickstart-es-old",
        ]
    );
}

#[tokio::test]
async fn test_steady_state_plans_nothing() {
    let (es, store, pods) = data_downscale(3);
    let client = client_with_pods(v8(), &pods);
    let state = ReconcileState::new(&es);

    let results = downscale(&es, &store, &client, &state).await;

    assert!(results.is_reconciled());
    assert!(store.calls().is_empty());
    assert_eq!(client.call_count("PUT"), 0);
}
