//! Test fixtures and builder patterns for Elasticsearch clusters.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec, StatefulSetStatus};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use es_operator::crd::{
    ChangeBudget, Elasticsearch, ElasticsearchSpec, HttpSpec, NodeSetSpec, UpdateStrategy,
};
use es_operator::topology::{
    CLUSTER_NAME_LABEL, CONTROLLER_REVISION_HASH_LABEL, NODE_DATA_LABEL, NODE_MASTER_LABEL,
    STATEFULSET_NAME_LABEL, pod_name, statefulset_name,
};

/// Default cluster name used across the suites.
pub const CLUSTER: &str = "quickstart";

/// Builder for creating Elasticsearch test fixtures.
///
/// # Example
/// ```ignore
/// let es = ElasticsearchBuilder::new("quickstart")
///     .node_set("masters", 3, &["master"])
///     .node_set("data", 3, &["data"])
///     .max_unavailable(2)
///     .build();
/// ```
#[derive(Clone, Debug)]
pub struct ElasticsearchBuilder {
    name: String,
    namespace: String,
    version: String,
    node_sets: Vec<NodeSetSpec>,
    max_unavailable: Option<i32>,
    annotations: BTreeMap<String, String>,
    resource_version: Option<String>,
}

impl ElasticsearchBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "default".to_string(),
            version: "8.15.0".to_string(),
            node_sets: Vec::new(),
            max_unavailable: None,
            annotations: BTreeMap::new(),
            resource_version: Some("1".to_string()),
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Add a node set with the given roles (empty means master + data).
    pub fn node_set(mut self, name: &str, count: i32, roles: &[&str]) -> Self {
        self.node_sets.push(NodeSetSpec {
            name: name.to_string(),
            count,
            roles: roles.iter().map(|r| r.to_string()).collect(),
        });
        self
    }

    pub fn max_unavailable(mut self, max_unavailable: i32) -> Self {
        self.max_unavailable = Some(max_unavailable);
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Elasticsearch {
        let mut es = Elasticsearch::new(
            &self.name,
            ElasticsearchSpec {
                version: self.version,
                node_sets: self.node_sets,
                update_strategy: UpdateStrategy {
                    change_budget: ChangeBudget {
                        max_unavailable: self.max_unavailable,
                    },
                },
                http: HttpSpec::default(),
            },
        );
        es.metadata.namespace = Some(self.namespace);
        es.metadata.resource_version = self.resource_version;
        if !self.annotations.is_empty() {
            es.metadata.annotations = Some(self.annotations);
        }
        es
    }
}

fn role_labels(master: bool, data: bool) -> BTreeMap<String, String> {
    [
        (NODE_MASTER_LABEL.to_string(), master.to_string()),
        (NODE_DATA_LABEL.to_string(), data.to_string()),
    ]
    .into()
}

/// Builder for the StatefulSet backing one node set.
#[derive(Clone, Debug)]
pub struct StatefulSetBuilder {
    cluster: String,
    name: String,
    replicas: i32,
    master: bool,
    data: bool,
    update_revision: Option<String>,
}

impl StatefulSetBuilder {
    /// StatefulSet of node set `node_set` in `cluster`, with one data replica.
    pub fn new(cluster: &str, node_set: &str) -> Self {
        Self {
            cluster: cluster.to_string(),
            name: statefulset_name(cluster, node_set),
            replicas: 1,
            master: false,
            data: true,
            update_revision: None,
        }
    }

    pub fn replicas(mut self, replicas: i32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn roles(mut self, master: bool, data: bool) -> Self {
        self.master = master;
        self.data = data;
        self
    }

    pub fn update_revision(mut self, revision: impl Into<String>) -> Self {
        self.update_revision = Some(revision.into());
        self
    }

    pub fn build(self) -> StatefulSet {
        let mut template_labels = role_labels(self.master, self.data);
        template_labels.insert(CLUSTER_NAME_LABEL.to_string(), self.cluster.clone());
        StatefulSet {
            metadata: ObjectMeta {
                name: Some(self.name),
                labels: Some([(CLUSTER_NAME_LABEL.to_string(), self.cluster)].into()),
                ..Default::default()
            },
            spec: Some(StatefulSetSpec {
                replicas: Some(self.replicas),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(template_labels),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            status: Some(StatefulSetStatus {
                update_revision: self.update_revision,
                ..Default::default()
            }),
        }
    }
}

/// Builder for one Elasticsearch pod.
#[derive(Clone, Debug)]
pub struct PodBuilder {
    cluster: String,
    statefulset: String,
    ordinal: i32,
    master: bool,
    data: bool,
    revision: Option<String>,
    ready: bool,
    deletion_timestamp: Option<jiff::Timestamp>,
}

impl PodBuilder {
    /// Ready data pod `ordinal` of StatefulSet `statefulset`.
    pub fn new(cluster: &str, statefulset: &str, ordinal: i32) -> Self {
        Self {
            cluster: cluster.to_string(),
            statefulset: statefulset.to_string(),
            ordinal,
            master: false,
            data: true,
            revision: None,
            ready: true,
            deletion_timestamp: None,
        }
    }

    pub fn roles(mut self, master: bool, data: bool) -> Self {
        self.master = master;
        self.data = data;
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn not_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn terminating_since(mut self, since: jiff::Timestamp) -> Self {
        self.deletion_timestamp = Some(since);
        self
    }

    pub fn build(self) -> Pod {
        let name = pod_name(&self.statefulset, self.ordinal);
        let mut labels = role_labels(self.master, self.data);
        labels.insert(CLUSTER_NAME_LABEL.to_string(), self.cluster);
        labels.insert(STATEFULSET_NAME_LABEL.to_string(), self.statefulset);
        if let Some(revision) = self.revision {
            labels.insert(CONTROLLER_REVISION_HASH_LABEL.to_string(), revision);
        }
        let deletion_timestamp = self.deletion_timestamp.map(|since| {
            serde_json::from_value::<Time>(serde_json::json!(since.to_string()))
                .expect("valid RFC 3339 timestamp")
        });
        Pod {
            metadata: ObjectMeta {
                uid: Some(format!("uid-{name}")),
                resource_version: Some("1".to_string()),
                name: Some(name),
                labels: Some(labels),
                deletion_timestamp,
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if self.ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// `count` ready pods of one node set, all on `revision`.
pub fn node_set_pods(
    cluster: &str,
    node_set: &str,
    count: i32,
    master: bool,
    data: bool,
    revision: &str,
) -> Vec<Pod> {
    let statefulset = statefulset_name(cluster, node_set);
    (0..count)
        .map(|ordinal| {
            PodBuilder::new(cluster, &statefulset, ordinal)
                .roles(master, data)
                .revision(revision)
                .build()
        })
        .collect()
}

/// Pod names of one node set, lowest ordinal first.
pub fn node_set_pod_names(cluster: &str, node_set: &str, count: i32) -> Vec<String> {
    let statefulset = statefulset_name(cluster, node_set);
    (0..count).map(|i| pod_name(&statefulset, i)).collect()
}
