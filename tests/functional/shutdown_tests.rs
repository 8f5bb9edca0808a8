//! Both shutdown strategies behind the coordinator contract.

use std::collections::HashMap;

use es_operator::client::{FakeEsClient, ShutdownStatus, ShutdownType};
use es_operator::controller::status::ReconcileState;
use es_operator::shutdown::{
    NodeShutdownCoordinator, ObservedShutdown, ShutdownError, ShutdownStrategy,
};

use crate::{v7_10, v8};

fn ids(names: &[&str]) -> HashMap<String, String> {
    names
        .iter()
        .map(|n| (n.to_string(), format!("id-{n}")))
        .collect()
}

fn leaving(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
async fn test_node_shutdown_reconcile_is_idempotent() {
    let client = FakeEsClient::new(v8());
    let strategy = ShutdownStrategy::for_cluster(
        &client,
        ids(&["es-data-0", "es-data-1", "es-data-2"]),
        ShutdownType::Remove,
        "42",
    );
    assert!(strategy.uses_node_shutdown_api());

    let nodes = leaving(&["es-data-2", "es-data-1"]);
    strategy.reconcile_shutdowns(&nodes).await.unwrap();
    assert_eq!(client.call_count("PUT /_nodes/"), 2);

    client.clear_calls();
    strategy.reconcile_shutdowns(&nodes).await.unwrap();
    assert_eq!(client.shutdown_methods(), vec!["GET"]);
}

#[tokio::test]
async fn test_node_shutdown_cancels_nodes_no_longer_leaving() {
    let client = FakeEsClient::new(v8())
        .with_shutdown("es-data-1", "REMOVE", ShutdownStatus::InProgress)
        .with_shutdown("es-data-2", "REMOVE", ShutdownStatus::InProgress)
        // Restarts belong to another coordinator and are left alone.
        .with_shutdown("es-data-0", "RESTART", ShutdownStatus::Complete);
    let strategy = ShutdownStrategy::for_cluster(
        &client,
        ids(&["es-data-0", "es-data-1", "es-data-2"]),
        ShutdownType::Remove,
        "42",
    );

    strategy
        .reconcile_shutdowns(&leaving(&["es-data-2"]))
        .await
        .unwrap();
    let remaining: Vec<String> = client
        .registered_shutdowns()
        .into_iter()
        .map(|s| s.node_id)
        .collect();
    assert_eq!(remaining, vec!["id-es-data-2", "id-es-data-0"]);

    strategy.reconcile_shutdowns(&[]).await.unwrap();
    let remaining: Vec<String> = client
        .registered_shutdowns()
        .into_iter()
        .map(|s| s.node_id)
        .collect();
    assert_eq!(remaining, vec!["id-es-data-0"]);
}

#[tokio::test]
async fn test_node_shutdown_unknown_node_is_rejected() {
    let client = FakeEsClient::new(v8());
    let strategy =
        ShutdownStrategy::for_cluster(&client, ids(&["es-data-0"]), ShutdownType::Remove, "42");

    let err = strategy
        .reconcile_shutdowns(&leaving(&["es-data-9"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ShutdownError::UnknownNode(ref n) if n == "es-data-9"));
    assert_eq!(client.call_count("PUT"), 0);
}

#[tokio::test]
async fn test_node_shutdown_status_not_registered() {
    let client = FakeEsClient::new(v8());
    let strategy =
        ShutdownStrategy::for_cluster(&client, ids(&["es-data-0"]), ShutdownType::Remove, "42");
    let err = strategy.shutdown_status("es-data-0").await.unwrap_err();
    assert!(matches!(err, ShutdownError::NotFound(_)));
}

#[tokio::test]
async fn test_shard_migration_tracks_remaining_shards() {
    let client = FakeEsClient::new(v7_10()).with_shard("logs", "0", "es-data-2");
    let strategy = ShutdownStrategy::for_cluster(&client, HashMap::new(), ShutdownType::Remove, "");
    assert!(!strategy.uses_node_shutdown_api());

    strategy
        .reconcile_shutdowns(&leaving(&["es-data-2", "es-data-1"]))
        .await
        .unwrap();
    assert_eq!(client.excluded_nodes(), "es-data-2,es-data-1");

    let status = strategy.shutdown_status("es-data-2").await.unwrap();
    assert_eq!(status.status, ShutdownStatus::InProgress);
    assert!(status.explanation.unwrap().contains("1 shards remaining"));

    let status = strategy.shutdown_status("es-data-1").await.unwrap();
    assert_eq!(status.status, ShutdownStatus::Complete);

    // Not excluded, hence never asked to leave.
    let err = strategy.shutdown_status("es-data-0").await.unwrap_err();
    assert!(matches!(err, ShutdownError::NotFound(_)));

    client.clear_calls();
    strategy
        .reconcile_shutdowns(&leaving(&["es-data-2", "es-data-1"]))
        .await
        .unwrap();
    assert_eq!(client.calls(), vec!["GET /_cluster/settings"]);
}

#[tokio::test]
async fn test_observed_shutdown_mirrors_progress_into_status() {
    let client = FakeEsClient::new(v8()).with_new_shutdown_status(ShutdownStatus::Stalled);
    let state = ReconcileState::default();
    let observed = ObservedShutdown::new(
        ShutdownStrategy::for_cluster(&client, ids(&["es-data-1"]), ShutdownType::Remove, "42"),
        Some(&state),
    );

    observed
        .reconcile_shutdowns(&leaving(&["es-data-1"]))
        .await
        .unwrap();
    let operations = state.operations();
    assert_eq!(operations.downscale.nodes.len(), 1);
    assert_eq!(operations.downscale.nodes[0].shutdown_status, "IN_PROGRESS");

    client.set_shutdown_status("es-data-1", ShutdownStatus::Stalled, Some("no room left"));
    observed.shutdown_status("es-data-1").await.unwrap();
    let operations = state.operations();
    assert_eq!(operations.downscale.nodes[0].shutdown_status, "STALLED");
    assert_eq!(
        operations.downscale.nodes[0].explanation.as_deref(),
        Some("no room left")
    );
    assert_eq!(operations.downscale.stalled, Some(true));
}
