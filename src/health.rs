//! Health and metrics endpoints of the operator process.
//!
//! `/healthz` answers as long as the process runs, `/readyz` once the
//! controller runs on the elected leader, and `/metrics` serves the
//! Prometheus text exposition of [`Metrics`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tracing::{error, info};

const PROMETHEUS_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Identifies one Elasticsearch resource.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ClusterLabels {
    pub namespace: String,
    pub name: String,
}

impl ClusterLabels {
    fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

impl EncodeLabelSet for ClusterLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("namespace", self.namespace.as_str()).encode(encoder.encode_label())?;
        ("name", self.name.as_str()).encode(encoder.encode_label())
    }
}

/// Per-cluster reconciliation metrics.
pub struct Metrics {
    pub reconciliations: Family<ClusterLabels, Counter>,
    pub reconciliation_errors: Family<ClusterLabels, Counter>,
    pub reconcile_duration_seconds: Family<ClusterLabels, Histogram>,
    pub nodes_leaving: Family<ClusterLabels, Gauge>,
    pub pods_pending_upgrade: Family<ClusterLabels, Gauge>,
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("es_operator");

        let reconciliations = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "reconciliations",
            "Reconciliation passes per cluster",
            reconciliations.clone(),
        );
        let reconciliation_errors = Family::<ClusterLabels, Counter>::default();
        registry.register(
            "reconciliation_errors",
            "Reconciliation passes that ended in an error",
            reconciliation_errors.clone(),
        );
        // 1ms up to ~16s.
        let reconcile_duration_seconds =
            Family::<ClusterLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.001, 2.0, 15))
            });
        registry.register(
            "reconcile_duration_seconds",
            "Time spent in one reconciliation pass",
            reconcile_duration_seconds.clone(),
        );
        let nodes_leaving = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "nodes_leaving",
            "Nodes listed in the downscale operation status",
            nodes_leaving.clone(),
        );
        let pods_pending_upgrade = Family::<ClusterLabels, Gauge>::default();
        registry.register(
            "pods_pending_upgrade",
            "Pods still running an outdated revision",
            pods_pending_upgrade.clone(),
        );

        Self {
            reconciliations,
            reconciliation_errors,
            reconcile_duration_seconds,
            nodes_leaving,
            pods_pending_upgrade,
            registry,
        }
    }

    pub fn record_reconcile(&self, namespace: &str, name: &str, duration_secs: f64) {
        let labels = ClusterLabels::new(namespace, name);
        self.reconciliations.get_or_create(&labels).inc();
        self.reconcile_duration_seconds
            .get_or_create(&labels)
            .observe(duration_secs);
    }

    pub fn record_error(&self, namespace: &str, name: &str) {
        self.reconciliation_errors
            .get_or_create(&ClusterLabels::new(namespace, name))
            .inc();
    }

    /// Mirrors the in-progress operations of a cluster's status.
    pub fn set_operations(&self, namespace: &str, name: &str, leaving: i64, pending_upgrade: i64) {
        let labels = ClusterLabels::new(namespace, name);
        self.nodes_leaving.get_or_create(&labels).set(leaving);
        self.pods_pending_upgrade
            .get_or_create(&labels)
            .set(pending_upgrade);
    }

    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            error!(error = %e, "Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// State shared between the controller and the health server.
#[derive(Default)]
pub struct HealthState {
    ready: AtomicBool,
    pub metrics: Metrics,
}

impl HealthState {
    /// Not ready until the controller starts.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    if state.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, PROMETHEUS_TEXT)],
        state.metrics.encode(),
    )
}

pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves the health endpoints on every interface until the listener fails.
pub async fn run_health_server(state: Arc<HealthState>, port: u16) -> Result<(), std::io::Error> {
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port, "Serving health and metrics endpoints");
    axum::serve(listener, create_router(state)).await
}
