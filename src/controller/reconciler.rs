//! Reconciliation loop for Elasticsearch resources.
//!
//! Each pass validates the spec, makes sure a health observer runs for the
//! cluster, then hands over to the driver for downscales and rolling
//! upgrades. The outcome of the pass is written back to the status.

use std::collections::BTreeSet;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::{
    Api, ResourceExt,
    api::{Patch, PatchParams},
    runtime::controller::Action,
};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::client::{HttpEsClient, HttpEsClientConfig};
use crate::controller::{
    context::{Context, FIELD_MANAGER},
    driver::reconcile_nodes,
    error::Error,
    results::Results,
    status::{EVENT_REASON_VALIDATION, EventKind, ReconcileState, UPGRADE_PENDING},
};
use crate::crd::{Elasticsearch, ElasticsearchPhase, ElasticsearchStatus};
use crate::observer::ClusterKey;
use crate::store::{KubeStore, ObjectStore};
use crate::topology::VERSION_LABEL;

/// Finalizer stopping the health observer before the resource goes away.
pub const FINALIZER: &str = "finalizer.elasticsearch.k8s.elastic.co/observers";

/// Built-in superuser whose credentials the operator uses.
pub const ELASTIC_USER: &str = "elastic";

/// Reconcile an Elasticsearch cluster.
pub async fn reconcile(obj: Arc<Elasticsearch>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let key = ClusterKey::new(&namespace, &name);

    debug!(name = %name, namespace = %namespace, "Reconciling Elasticsearch");

    let api: Api<Elasticsearch> = Api::namespaced(ctx.client.clone(), &namespace);

    if obj.metadata.deletion_timestamp.is_some() {
        info!(name = %name, "Handling deletion");
        ctx.observers.stop(&key);
        remove_finalizer(&api, &name).await?;
        return Ok(Action::await_change());
    }

    if !obj.finalizers().iter().any(|f| f == FINALIZER) {
        info!(name = %name, "Adding finalizer");
        add_finalizer(&api, &name).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let state = ReconcileState::new(&obj);

    if let Err(e) = validate_spec(&obj) {
        error!(name = %name, error = %e, "Validation failed");
        ctx.publish_warning_event(&obj, EVENT_REASON_VALIDATION, "Validating", Some(e.to_string()))
            .await;
        state.update_phase(ElasticsearchPhase::Invalid);
        let mut results = Results::new();
        results.with_requeue(e.to_string());
        patch_status(&api, &name, &state.build_status(&obj, &results, false)).await?;
        return Err(e);
    }

    let store = KubeStore::new(ctx.client.clone(), &namespace);
    let pods = store.list_pods(&name).await?;
    let version = running_version(&obj, &pods)?;
    state.update_version(version.to_string());

    let (es_client, fingerprint) = build_es_client(&ctx, &obj, &namespace, version).await?;
    let es_client = Arc::new(es_client);
    let observed = ctx
        .observers
        .observe(&key, &fingerprint, Arc::clone(&es_client));

    let results = reconcile_nodes(&obj, &store, es_client.as_ref(), observed.as_ref(), &state).await;

    for event in state.events() {
        let note = Some(event.message.clone());
        match event.kind {
            EventKind::Normal => {
                ctx.publish_normal_event(&obj, &event.reason, "Reconciling", note)
                    .await;
            }
            EventKind::Warning => {
                ctx.publish_warning_event(&obj, &event.reason, "Reconciling", note)
                    .await;
            }
        }
    }

    let status = state.build_status(&obj, &results, observed.is_some());
    if let Err(e) = patch_status(&api, &name, &status).await {
        warn!(name = %name, error = %e, "Failed to update status");
    }

    if let Some(ref health_state) = ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health_state
            .metrics
            .record_reconcile(&namespace, &name, duration);
        let operations = &status.in_progress_operations;
        let pending = operations
            .upgrade
            .nodes
            .iter()
            .filter(|n| n.status == UPGRADE_PENDING)
            .count();
        health_state.metrics.set_operations(
            &namespace,
            &name,
            i64::try_from(operations.downscale.nodes.len()).unwrap_or(i64::MAX),
            i64::try_from(pending).unwrap_or(i64::MAX),
        );
    }

    if let Some(reason) = results.reason() {
        debug!(name = %name, reason = %reason, "Requeue requested");
    }
    results.into_action()
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<Elasticsearch>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
        Action::requeue(error.requeue_after())
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
        Action::requeue(Duration::from_secs(300))
    }
}

/// Validate the resource spec
pub fn validate_spec(obj: &Elasticsearch) -> Result<(), Error> {
    semver::Version::parse(&obj.spec.version).map_err(|e| {
        Error::Validation(format!("invalid version {:?}: {e}", obj.spec.version))
    })?;
    let mut names = BTreeSet::new();
    for node_set in &obj.spec.node_sets {
        if node_set.name.is_empty() {
            return Err(Error::Validation("node set name must not be empty".to_string()));
        }
        if !names.insert(node_set.name.as_str()) {
            return Err(Error::Validation(format!(
                "duplicate node set name {:?}",
                node_set.name
            )));
        }
        if node_set.count < 0 {
            return Err(Error::Validation(format!(
                "node set {:?} has a negative count",
                node_set.name
            )));
        }
    }
    Ok(())
}

/// Lowest version running in the cluster, or the spec version before any
/// pod reports one.
pub fn running_version(obj: &Elasticsearch, pods: &[Pod]) -> Result<semver::Version, Error> {
    let lowest = pods
        .iter()
        .filter_map(|p| p.labels().get(VERSION_LABEL))
        .filter_map(|v| semver::Version::parse(v).ok())
        .min();
    match lowest {
        Some(v) => Ok(v),
        None => semver::Version::parse(&obj.spec.version)
            .map_err(|e| Error::Validation(format!("invalid version: {e}"))),
    }
}

/// Service URL of the cluster's HTTP layer.
pub fn service_url(obj: &Elasticsearch, namespace: &str) -> String {
    let scheme = if obj.spec.http.tls_enabled {
        "https"
    } else {
        "http"
    };
    format!(
        "{scheme}://{}-es-http.{namespace}.svc:{}",
        obj.name_any(),
        obj.spec.http.port
    )
}

async fn secret_value(
    api: &Api<Secret>,
    secret: &str,
    key: &str,
) -> Result<Vec<u8>, Error> {
    let Some(found) = api.get_opt(secret).await? else {
        return Err(Error::Transient(format!("secret {secret} not found yet")));
    };
    found
        .data
        .and_then(|mut data| data.remove(key))
        .map(|bytes| bytes.0)
        .ok_or_else(|| Error::MissingField(format!("{secret}/{key}")))
}

/// Builds the client for the cluster and the fingerprint identifying it.
async fn build_es_client(
    ctx: &Context,
    obj: &Elasticsearch,
    namespace: &str,
    version: semver::Version,
) -> Result<(HttpEsClient, String), Error> {
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), namespace);
    let name = obj.name_any();
    let url = service_url(obj, namespace);

    let password = secret_value(&secrets, &format!("{name}-es-elastic-user"), ELASTIC_USER).await?;
    let password = String::from_utf8(password)
        .map_err(|_| Error::Permanent("elastic user password is not valid UTF-8".to_string()))?;

    let mut config = HttpEsClientConfig::new(&url)
        .with_credentials(ELASTIC_USER.to_string(), password.clone())
        .with_request_timeout(ctx.config.request_timeout());
    if obj.spec.http.tls_enabled {
        let ca = secret_value(&secrets, &format!("{name}-es-http-certs-public"), "ca.crt").await?;
        config = config.with_ca_cert(ca);
    }

    let mut hasher = DefaultHasher::new();
    password.hash(&mut hasher);
    let fingerprint = format!("{url}/{version}/{:x}", hasher.finish());

    Ok((HttpEsClient::new(config, version)?, fingerprint))
}

/// Add finalizer to resource
async fn add_finalizer(api: &Api<Elasticsearch>, name: &str) -> Result<(), Error> {
    let patch = json!({
        "metadata": {
            "finalizers": [FINALIZER]
        }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Remove finalizer from resource
async fn remove_finalizer(api: &Api<Elasticsearch>, name: &str) -> Result<(), Error> {
    let patch = json!({
        "metadata": {
            "finalizers": null
        }
    });
    match api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn patch_status(
    api: &Api<Elasticsearch>,
    name: &str,
    status: &ElasticsearchStatus,
) -> Result<(), Error> {
    let patch = json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}
