//! Elasticsearch HTTP client.
//!
//! `EsClient` is the seam the reconciliation core is written against; the
//! `HttpEsClient` implementation talks to the cluster's HTTP service with
//! `reqwest` and a bounded request timeout.

use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, instrument};

use super::types::{
    ClusterRoutingAllocation, Health, Nodes, Shard, ShutdownRequest, ShutdownResponse,
};

/// Errors returned by Elasticsearch API calls.
///
/// Cloneable so a failed observation can be replayed to every caller of a memoized fact.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EsClientError {
    #[error("Request error: {0}")]
    Request(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Elasticsearch returned {code}: {body}")]
    Status { code: u16, body: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl EsClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EsClientError::Status { code: 404, .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EsClientError::Status { code: 409, .. })
    }
}

impl From<reqwest::Error> for EsClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EsClientError::Timeout(e.to_string())
        } else if e.is_decode() {
            EsClientError::Decode(e.to_string())
        } else {
            EsClientError::Request(e.to_string())
        }
    }
}

impl From<serde_json::Error> for EsClientError {
    fn from(e: serde_json::Error) -> Self {
        EsClientError::Decode(e.to_string())
    }
}

/// Typed operations against the Elasticsearch REST API.
pub trait EsClient: Send + Sync {
    /// Lowest Elasticsearch version running in the cluster.
    fn version(&self) -> &semver::Version;

    fn get_cluster_health(
        &self,
    ) -> impl std::future::Future<Output = Result<Health, EsClientError>> + Send;

    fn get_nodes(&self) -> impl std::future::Future<Output = Result<Nodes, EsClientError>> + Send;

    fn get_cluster_routing_allocation(
        &self,
    ) -> impl std::future::Future<Output = Result<ClusterRoutingAllocation, EsClientError>> + Send;

    /// Every shard copy with the node holding it.
    fn get_shards(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Shard>, EsClientError>> + Send;

    /// Sets `cluster.routing.allocation.exclude._name`. An empty string clears it.
    fn exclude_from_shard_allocation(
        &self,
        nodes: &str,
    ) -> impl std::future::Future<Output = Result<(), EsClientError>> + Send;

    fn enable_shard_allocation(
        &self,
    ) -> impl std::future::Future<Output = Result<(), EsClientError>> + Send;

    fn disable_replica_shard_allocation(
        &self,
    ) -> impl std::future::Future<Output = Result<(), EsClientError>> + Send;

    fn synced_flush(&self) -> impl std::future::Future<Output = Result<(), EsClientError>> + Send;

    fn flush(&self) -> impl std::future::Future<Output = Result<(), EsClientError>> + Send;

    /// Zen1 `discovery.zen.minimum_master_nodes`.
    fn set_minimum_master_nodes(
        &self,
        count: i32,
    ) -> impl std::future::Future<Output = Result<(), EsClientError>> + Send;

    /// Zen2 voting configuration exclusions.
    fn add_voting_config_exclusions(
        &self,
        node_names: &[String],
    ) -> impl std::future::Future<Output = Result<(), EsClientError>> + Send;

    fn delete_voting_config_exclusions(
        &self,
        wait_for_removal: bool,
    ) -> impl std::future::Future<Output = Result<(), EsClientError>> + Send;

    /// Shutdowns registered for one node, or for all nodes when `node_id` is `None`.
    fn get_shutdown(
        &self,
        node_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<ShutdownResponse, EsClientError>> + Send;

    fn put_shutdown(
        &self,
        node_id: &str,
        request: &ShutdownRequest,
    ) -> impl std::future::Future<Output = Result<(), EsClientError>> + Send;

    fn delete_shutdown(
        &self,
        node_id: &str,
    ) -> impl std::future::Future<Output = Result<(), EsClientError>> + Send;
}

/// Whether the cluster supports the node shutdown API.
pub fn supports_node_shutdown(version: &semver::Version) -> bool {
    *version >= semver::Version::new(7, 15, 2)
}

/// Whether the cluster uses Zen2 discovery.
pub fn is_zen2(version: &semver::Version) -> bool {
    version.major >= 7
}

/// Configuration for connecting to an Elasticsearch cluster.
#[derive(Clone, Debug)]
pub struct HttpEsClientConfig {
    /// Base URL, e.g. `https://quickstart-es-http.default.svc:9200`.
    pub url: String,
    /// Basic auth credentials.
    pub credentials: Option<(String, String)>,
    /// PEM-encoded CA used to verify the HTTP certificate.
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl HttpEsClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            ca_cert_pem: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_credentials(mut self, user: String, password: String) -> Self {
        self.credentials = Some((user, password));
        self
    }

    pub fn with_ca_cert(mut self, pem: Vec<u8>) -> Self {
        self.ca_cert_pem = Some(pem);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// `EsClient` over HTTP.
#[derive(Clone)]
pub struct HttpEsClient {
    http: reqwest::Client,
    config: HttpEsClientConfig,
    version: semver::Version,
}

impl std::fmt::Debug for HttpEsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpEsClient")
            .field("url", &self.config.url)
            .field("version", &self.version)
            .finish()
    }
}

impl HttpEsClient {
    /// Builds a client for a cluster running at least `version`.
    pub fn new(config: HttpEsClientConfig, version: semver::Version) -> Result<Self, EsClientError> {
        let mut builder = reqwest::Client::builder().timeout(config.request_timeout);
        if let Some(pem) = &config.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| EsClientError::Request(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        let http = builder.build()?;
        Ok(Self {
            http,
            config,
            version,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.url.trim_end_matches('/'), path);
        let builder = self.http.request(method, url);
        match &self.config.credentials {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<String, EsClientError> {
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(EsClientError::Status {
                code: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, EsClientError> {
        let body = self.send(self.request(reqwest::Method::GET, path)).await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn put<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<(), EsClientError> {
        self.send(self.request(reqwest::Method::PUT, path).json(body))
            .await
            .map(|_| ())
    }

    async fn post(&self, path: &str) -> Result<(), EsClientError> {
        self.send(self.request(reqwest::Method::POST, path))
            .await
            .map(|_| ())
    }

    async fn delete(&self, path: &str) -> Result<(), EsClientError> {
        self.send(self.request(reqwest::Method::DELETE, path))
            .await
            .map(|_| ())
    }
}

impl EsClient for HttpEsClient {
    fn version(&self) -> &semver::Version {
        &self.version
    }

    #[instrument(skip(self))]
    async fn get_cluster_health(&self) -> Result<Health, EsClientError> {
        self.get("/_cluster/health").await
    }

    #[instrument(skip(self))]
    async fn get_nodes(&self) -> Result<Nodes, EsClientError> {
        self.get("/_nodes/_all/no-metrics").await
    }

    #[instrument(skip(self))]
    async fn get_cluster_routing_allocation(
        &self,
    ) -> Result<ClusterRoutingAllocation, EsClientError> {
        self.get("/_cluster/settings").await
    }

    #[instrument(skip(self))]
    async fn get_shards(&self) -> Result<Vec<Shard>, EsClientError> {
        self.get("/_cat/shards?format=json").await
    }

    #[instrument(skip(self))]
    async fn exclude_from_shard_allocation(&self, nodes: &str) -> Result<(), EsClientError> {
        debug!(nodes = %nodes, "Updating shard allocation excludes");
        let body = json!({
            "transient": { "cluster.routing.allocation.exclude._name": nodes }
        });
        self.put("/_cluster/settings", &body).await
    }

    #[instrument(skip(self))]
    async fn enable_shard_allocation(&self) -> Result<(), EsClientError> {
        let body = json!({ "transient": { "cluster.routing.allocation.enable": null } });
        self.put("/_cluster/settings", &body).await
    }

    #[instrument(skip(self))]
    async fn disable_replica_shard_allocation(&self) -> Result<(), EsClientError> {
        let body = json!({ "transient": { "cluster.routing.allocation.enable": "primaries" } });
        self.put("/_cluster/settings", &body).await
    }

    #[instrument(skip(self))]
    async fn synced_flush(&self) -> Result<(), EsClientError> {
        if self.version.major >= 8 {
            return Err(EsClientError::Unsupported(
                "synced flush was removed in 8.0".into(),
            ));
        }
        self.post("/_flush/synced").await
    }

    #[instrument(skip(self))]
    async fn flush(&self) -> Result<(), EsClientError> {
        self.post("/_flush").await
    }

    #[instrument(skip(self))]
    async fn set_minimum_master_nodes(&self, count: i32) -> Result<(), EsClientError> {
        if is_zen2(&self.version) {
            return Err(EsClientError::Unsupported(
                "minimum_master_nodes only applies to zen1".into(),
            ));
        }
        let body = json!({
            "persistent": { "discovery.zen.minimum_master_nodes": count },
            "transient": { "discovery.zen.minimum_master_nodes": count }
        });
        self.put("/_cluster/settings", &body).await
    }

    #[instrument(skip(self))]
    async fn add_voting_config_exclusions(&self, node_names: &[String]) -> Result<(), EsClientError> {
        if !is_zen2(&self.version) {
            return Err(EsClientError::Unsupported(
                "voting config exclusions require zen2".into(),
            ));
        }
        let path = format!(
            "/_cluster/voting_config_exclusions?node_names={}",
            node_names.join(",")
        );
        self.post(&path).await
    }

    #[instrument(skip(self))]
    async fn delete_voting_config_exclusions(
        &self,
        wait_for_removal: bool,
    ) -> Result<(), EsClientError> {
        let path = format!("/_cluster/voting_config_exclusions?wait_for_removal={wait_for_removal}");
        self.delete(&path).await
    }

    #[instrument(skip(self))]
    async fn get_shutdown(&self, node_id: Option<&str>) -> Result<ShutdownResponse, EsClientError> {
        match node_id {
            Some(id) => self.get(&format!("/_nodes/{id}/shutdown")).await,
            None => self.get("/_nodes/shutdown").await,
        }
    }

    #[instrument(skip(self, request))]
    async fn put_shutdown(
        &self,
        node_id: &str,
        request: &ShutdownRequest,
    ) -> Result<(), EsClientError> {
        self.put(&format!("/_nodes/{node_id}/shutdown"), request)
            .await
    }

    #[instrument(skip(self))]
    async fn delete_shutdown(&self, node_id: &str) -> Result<(), EsClientError> {
        self.delete(&format!("/_nodes/{node_id}/shutdown")).await
    }
}
