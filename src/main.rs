//! es-operator - reconciles the node topology of Elasticsearch clusters.
//!
//! Initializes logging, waits for the leader lease, then runs the controller
//! next to the health server.

use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use es_operator::OperatorConfig;
use es_operator::health::{HealthState, run_health_server};
use es_operator::run_controller;

const LEASE_TTL: Duration = Duration::from_secs(15);
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);

/// Left to in-flight reconciliations once a stop signal arrived.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;
    info!(version = env!("CARGO_PKG_VERSION"), "Starting es-operator");

    let config = OperatorConfig::from_env()?;
    let client = Client::try_default().await?;

    let params = LeaseLockParams {
        holder_id: holder_identity(&config),
        lease_name: config.lease_name.clone(),
        lease_ttl: LEASE_TTL,
    };
    info!(
        holder_id = %params.holder_id,
        namespace = %config.pod_namespace,
        lease_name = %params.lease_name,
        "Joining leader election"
    );

    // Health endpoints answer while the lease is still contended.
    let health_state = Arc::new(HealthState::new());
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!(error = %e, "Health server stopped");
            }
        })
    };

    let lease = LeaseLock::new(client.clone(), &config.pod_namespace, params);
    acquire_leadership(&lease).await;
    let renewal_handle = keep_leadership(lease);

    let controller_handle = {
        let health_state = health_state.clone();
        tokio::spawn(run_controller(client, config, Some(health_state)))
    };

    tokio::select! {
        result = controller_handle => {
            if let Err(e) = result {
                error!(error = %e, "Controller task panicked");
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!(error = %e, "Health server task panicked");
            }
        }
        Err(e) = renewal_handle => {
            error!(error = %e, "Lease renewal task panicked");
        }
        _ = shutdown_signal() => {
            info!(
                grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
                "Stop signal received, draining in-flight reconciliations"
            );
            health_state.set_ready(false);
            tokio::time::sleep(SHUTDOWN_GRACE_PERIOD).await;
        }
    }

    info!("Operator stopped");
    Ok(())
}

/// JSON logs, `RUST_LOG` on top of info-level defaults for the operator and kube.
fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("es_operator=info".parse()?)
        .add_directive("kube=info".parse()?)
        .add_directive("kube_leader_election=info".parse()?);
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
    Ok(())
}

/// `POD_NAME` from the downward API, else the hostname.
fn holder_identity(config: &OperatorConfig) -> String {
    if let Some(name) = &config.pod_name {
        return name.clone();
    }
    warn!("POD_NAME not set, using hostname as lease holder");
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

async fn acquire_leadership(lease: &LeaseLock) {
    loop {
        match lease.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another replica holds the lease, waiting"),
            Err(e) => warn!(error = %e, "Failed to acquire lease, retrying"),
        }
        tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
    }
}

/// Renews the lease forever. Losing it exits the process so the pod restarts
/// as a follower.
#[allow(clippy::exit)]
fn keep_leadership(lease: LeaseLock) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(LEASE_RENEW_INTERVAL).await;
            match lease.try_acquire_or_renew().await {
                Ok(result) if result.acquired_lease => {}
                Ok(_) => {
                    error!("Lost leadership, exiting");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "Failed to renew lease, exiting");
                    std::process::exit(1);
                }
            }
        }
    })
}

/// Resolves on SIGTERM or SIGINT. Failing to install a handler is fatal.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
