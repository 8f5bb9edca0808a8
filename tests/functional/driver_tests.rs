//! Complete passes over a cluster: downscale, then upgrade.

use es_operator::client::{EsClientError, Health};
use es_operator::controller::driver::reconcile_nodes;
use es_operator::controller::status::ReconcileState;
use es_operator::crd::{
    ElasticsearchHealth, ElasticsearchPhase, VOTING_CONFIG_EXCLUSIONS_ANNOTATION,
};
use es_operator::store::FakeStore;

use crate::common::fixtures::{
    CLUSTER, ElasticsearchBuilder, StatefulSetBuilder, node_set_pod_names, node_set_pods,
};
use crate::{client_with_pods, v7_10, v8};

fn green() -> Health {
    Health {
        status: ElasticsearchHealth::Green,
        ..Default::default()
    }
}

fn store_with(masters: i32, data: i32, masters_revision: &str) -> FakeStore {
    FakeStore::new()
        .with_statefulset(
            StatefulSetBuilder::new(CLUSTER, "masters")
                .replicas(masters)
                .roles(true, false)
                .update_revision("r2")
                .build(),
        )
        .with_statefulset(
            StatefulSetBuilder::new(CLUSTER, "data")
                .replicas(data)
                .update_revision("r2")
                .build(),
        )
        .with_pods(node_set_pods(CLUSTER, "masters", masters, true, false, masters_revision))
        .with_pods(node_set_pods(CLUSTER, "data", data, false, true, "r2"))
}

#[tokio::test]
async fn test_unreachable_cluster_is_requeued() {
    let es = ElasticsearchBuilder::new(CLUSTER)
        .node_set("masters", 3, &["master"])
        .node_set("data", 2, &["data"])
        .build();
    let store = store_with(3, 3, "r2");
    let client = client_with_pods(v8(), &[]);
    let state = ReconcileState::new(&es);

    let results = reconcile_nodes(&es, &store, &client, None, &state).await;

    assert_eq!(results.reason(), Some("Elasticsearch cannot be reached yet"));
    assert!(client.calls().is_empty());
    assert!(store.calls().is_empty());
}

#[tokio::test]
async fn test_steady_state_is_reconciled() {
    let es = ElasticsearchBuilder::new(CLUSTER)
        .node_set("masters", 3, &["master"])
        .node_set("data", 3, &["data"])
        .build();
    let store = store_with(3, 3, "r2");
    let pods = [
        node_set_pods(CLUSTER, "masters", 3, true, false, "r2"),
        node_set_pods(CLUSTER, "data", 3, false, true, "r2"),
    ]
    .concat();
    let client = client_with_pods(v8(), &pods);
    let state = ReconcileState::new(&es);

    let results = reconcile_nodes(&es, &store, &client, Some(&green()), &state).await;

    assert!(results.is_reconciled(), "unexpected results: {results:?}");
    assert!(store.calls().is_empty());
    assert_eq!(state.phase(), ElasticsearchPhase::Unknown);
    // Facts are fetched once per pass.
    let node_fetches = client.calls().iter().filter(|c| *c == "GET /_nodes").count();
    assert_eq!(node_fetches, 1);

    let status = state.build_status(&es, &results, true);
    assert_eq!(status.phase, ElasticsearchPhase::Ready);
    assert_eq!(status.available_nodes, 6);
    assert_eq!(status.health, ElasticsearchHealth::Green);
}

#[tokio::test]
async fn test_voting_exclusions_cleared_once_pods_match() {
    let es = ElasticsearchBuilder::new(CLUSTER)
        .node_set("masters", 3, &["master"])
        .node_set("data", 3, &["data"])
        .annotation(VOTING_CONFIG_EXCLUSIONS_ANNOTATION, "true")
        .build();
    let store = store_with(3, 3, "r2");
    let pods = [
        node_set_pods(CLUSTER, "masters", 3, true, false, "r2"),
        node_set_pods(CLUSTER, "data", 3, false, true, "r2"),
    ]
    .concat();
    let client = client_with_pods(v8(), &pods);
    let state = ReconcileState::new(&es);

    let results = reconcile_nodes(&es, &store, &client, Some(&green()), &state).await;

    assert!(results.is_reconciled(), "unexpected results: {results:?}");
    assert_eq!(client.call_count("DELETE /_cluster/voting_config_exclusions"), 1);
    assert_eq!(
        store.calls(),
        vec![format!("annotate quickstart {VOTING_CONFIG_EXCLUSIONS_ANNOTATION}=null")]
    );
}

#[tokio::test]
async fn test_downscale_failure_does_not_block_upgrade() {
    // Data goes from 3 to 2 while masters roll to a new revision.
    let es = ElasticsearchBuilder::new(CLUSTER)
        .version("7.10.2")
        .node_set("masters", 3, &["master"])
        .node_set("data", 2, &["data"])
        .build();
    let store = store_with(3, 3, "r1");
    let pods = [
        node_set_pods(CLUSTER, "masters", 3, true, false, "r1"),
        node_set_pods(CLUSTER, "data", 3, false, true, "r2"),
    ]
    .concat();
    let client = client_with_pods(v7_10(), &pods)
        .with_shards_error(EsClientError::Timeout("_cat/shards".into()));
    let state = ReconcileState::new(&es);

    let results = reconcile_nodes(&es, &store, &client, Some(&green()), &state).await;

    assert!(results.has_error());
    assert_eq!(store.replicas("quickstart-es-data"), Some(3));
    assert_eq!(store.calls(), vec!["delete pod quickstart-es-masters-2"]);
    assert_eq!(client.excluded_nodes(), "quickstart-es-data-2");
}

#[tokio::test]
async fn test_downscale_then_rolling_restart_in_one_pass() {
    let es = ElasticsearchBuilder::new(CLUSTER)
        .node_set("masters", 3, &["master"])
        .node_set("data", 2, &["data"])
        .build();
    let store = store_with(3, 3, "r1");
    let pods = [
        node_set_pods(CLUSTER, "masters", 3, true, false, "r1"),
        node_set_pods(CLUSTER, "data", 3, false, true, "r2"),
    ]
    .concat();
    let client = client_with_pods(v8(), &pods)
        .with_new_shutdown_status(es_operator::client::ShutdownStatus::Complete);
    let state = ReconcileState::new(&es);

    let results = reconcile_nodes(&es, &store, &client, Some(&green()), &state).await;

    assert!(!results.has_error(), "unexpected results: {results:?}");
    assert_eq!(results.reason(), Some("Nodes upgrade in progress"));
    assert_eq!(
        store.calls(),
        vec![
            "scale quickstart-es-data 2",
            "delete pod quickstart-es-masters-2",
        ]
    );

    let status = state.build_status(&es, &results, true);
    let downscale = &status.in_progress_operations.downscale;
    assert_eq!(downscale.nodes.len(), 1);
    assert_eq!(downscale.nodes[0].name, "quickstart-es-data-2");
    let upgrade: Vec<String> = status
        .in_progress_operations
        .upgrade
        .nodes
        .iter()
        .map(|n| n.name.clone())
        .collect();
    assert_eq!(upgrade, node_set_pod_names(CLUSTER, "masters", 3));
    assert_eq!(status.phase, ElasticsearchPhase::ApplyingChanges);
}
