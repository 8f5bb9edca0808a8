//! Runtime configuration.

use std::time::Duration;

use serde::Deserialize;

/// Runtime configuration, read from the process environment.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct OperatorConfig {
    /// The name of the pod on which this instance is running.
    #[serde(default)]
    pub pod_name: Option<String>,
    /// The namespace holding the leader election lease.
    #[serde(default = "default_namespace")]
    pub pod_namespace: String,
    /// Restricts the controller to one namespace. Cluster-wide when unset.
    #[serde(default)]
    pub watch_namespace: Option<String>,
    /// Deadline applied to every Elasticsearch API call.
    #[serde(default = "default_request_timeout_secs")]
    pub es_request_timeout_secs: u64,
    /// Interval between two health observations of the same cluster.
    #[serde(default = "default_observation_interval_secs")]
    pub observation_interval_secs: u64,
    /// The port used for health checks and metrics.
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    /// Name of the leader election lease.
    #[serde(default = "default_lease_name")]
    pub lease_name: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_observation_interval_secs() -> u64 {
    10
}

fn default_health_port() -> u16 {
    8080
}

fn default_lease_name() -> String {
    "es-operator-leader".to_string()
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_name: None,
            pod_namespace: default_namespace(),
            watch_namespace: None,
            es_request_timeout_secs: default_request_timeout_secs(),
            observation_interval_secs: default_observation_interval_secs(),
            health_port: default_health_port(),
            lease_name: default_lease_name(),
        }
    }
}

impl OperatorConfig {
    /// Build the config from the process environment.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }

    /// Build the config from explicit key/value pairs.
    pub fn from_iter<I>(vars: I) -> Result<Self, envy::Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter(vars)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.es_request_timeout_secs)
    }

    pub fn observation_interval(&self) -> Duration {
        Duration::from_secs(self.observation_interval_secs.max(1))
    }
}
