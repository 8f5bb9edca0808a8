//! Elasticsearch client module.
//!
//! ## Architecture
//!
//! - `es_client`: the `EsClient` trait and its `reqwest` implementation
//! - `types`: typed request and response bodies (health, nodes, shards, shutdowns)
//! - `fake`: in-memory cluster for tests, behind the `test-util` feature
//!
//! ## Example
//!
//! ```rust,ignore
//! use es_operator::client::{EsClient, HttpEsClient, HttpEsClientConfig};
//!
//! let client = HttpEsClient::new(HttpEsClientConfig::new(url), version)?;
//! let health = client.get_cluster_health().await?;
//! ```

pub mod es_client;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod types;

pub use es_client::{
    EsClient, EsClientError, HttpEsClient, HttpEsClientConfig, is_zen2, supports_node_shutdown,
};
#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeEsClient;
pub use types::{
    ClusterRoutingAllocation, Health, Node, NodeShutdown, Nodes, Shard, ShardState, ShardType,
    ShutdownRequest, ShutdownResponse, ShutdownStatus, ShutdownType, shards_by_node,
};
