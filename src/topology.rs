//! StatefulSet and Pod helpers shared by the planners.
//!
//! Every node set is backed by one StatefulSet named `{cluster}-es-{nodeSet}`,
//! whose pods are named `{statefulset}-{ordinal}`. Pod identity is derived
//! from that naming scheme so leaving nodes can be computed without listing pods.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

/// Label carrying the owning cluster name.
pub const CLUSTER_NAME_LABEL: &str = "elasticsearch.k8s.elastic.co/cluster-name";
/// Label carrying the owning StatefulSet name.
pub const STATEFULSET_NAME_LABEL: &str = "elasticsearch.k8s.elastic.co/statefulset-name";
/// Label set to "true" on master-eligible nodes.
pub const NODE_MASTER_LABEL: &str = "elasticsearch.k8s.elastic.co/node-master";
/// Label set to "true" on data nodes.
pub const NODE_DATA_LABEL: &str = "elasticsearch.k8s.elastic.co/node-data";
/// Label carrying the Elasticsearch version of the pod.
pub const VERSION_LABEL: &str = "elasticsearch.k8s.elastic.co/version";
/// Revision label set by the StatefulSet controller.
pub const CONTROLLER_REVISION_HASH_LABEL: &str = "controller-revision-hash";

/// One homogeneous set of Elasticsearch replicas.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopologyGroup {
    pub name: String,
    pub replicas: i32,
    pub master: bool,
    pub data: bool,
}

impl TopologyGroup {
    pub fn new(name: impl Into<String>, replicas: i32, master: bool, data: bool) -> Self {
        Self {
            name: name.into(),
            replicas: replicas.max(0),
            master,
            data,
        }
    }

    /// Builds a group from a live StatefulSet, reading roles from its pod template labels.
    pub fn from_statefulset(sts: &StatefulSet) -> Self {
        let template_labels = sts
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.as_ref());
        let has_label = |key: &str| {
            template_labels
                .and_then(|l| l.get(key))
                .is_some_and(|v| v == "true")
        };
        Self::new(
            sts.name_any(),
            statefulset_replicas(sts),
            has_label(NODE_MASTER_LABEL),
            has_label(NODE_DATA_LABEL),
        )
    }

    /// Pod names of this group, lowest ordinal first.
    pub fn pod_names(&self) -> Vec<String> {
        (0..self.replicas).map(|i| pod_name(&self.name, i)).collect()
    }
}

/// Name of the StatefulSet backing a node set.
pub fn statefulset_name(cluster: &str, node_set: &str) -> String {
    format!("{cluster}-es-{node_set}")
}

/// Name of the pod with the given ordinal.
pub fn pod_name(statefulset: &str, ordinal: i32) -> String {
    format!("{statefulset}-{ordinal}")
}

/// Splits a pod name into its StatefulSet name and ordinal.
pub fn parse_pod_name(pod_name: &str) -> Option<(&str, i32)> {
    let (sts, ordinal) = pod_name.rsplit_once('-')?;
    let ordinal = ordinal.parse().ok()?;
    Some((sts, ordinal))
}

/// Replica count of a StatefulSet (defaults to 1 like the API server).
pub fn statefulset_replicas(sts: &StatefulSet) -> i32 {
    sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1)
}

/// Headless service fronting a StatefulSet.
pub fn headless_service_name(statefulset: &str) -> String {
    statefulset.to_string()
}

/// Secret holding the generated `elasticsearch.yml` of a StatefulSet.
pub fn config_secret_name(statefulset: &str) -> String {
    format!("{statefulset}-es-config")
}

/// Secret holding the per-node transport certificates of a StatefulSet.
pub fn transport_certs_secret_name(statefulset: &str) -> String {
    format!("{statefulset}-es-transport-certs")
}

/// Label selector matching every resource of a cluster.
pub fn cluster_selector(cluster: &str) -> String {
    format!("{CLUSTER_NAME_LABEL}={cluster}")
}

fn label_is_true(pod: &Pod, key: &str) -> bool {
    pod.labels().get(key).is_some_and(|v| v == "true")
}

/// Whether the pod runs a master-eligible node.
pub fn is_master_pod(pod: &Pod) -> bool {
    label_is_true(pod, NODE_MASTER_LABEL)
}

/// Whether the pod runs a data node.
pub fn is_data_pod(pod: &Pod) -> bool {
    label_is_true(pod, NODE_DATA_LABEL)
}

/// Revision the pod was created from.
pub fn pod_revision(pod: &Pod) -> Option<&str> {
    pod.labels()
        .get(CONTROLLER_REVISION_HASH_LABEL)
        .map(String::as_str)
}

/// Whether the pod has the `Ready` condition set to true.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether the pod is being deleted.
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// Reason set by the node controller on pods of an unreachable node.
pub const NODE_LOST_REASON: &str = "NodeLost";

/// Whether the pod runs on a node the control plane lost contact with.
pub fn is_node_lost(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.reason.as_deref())
        .is_some_and(|r| r == NODE_LOST_REASON)
}

/// When the pod was marked for deletion.
pub fn terminating_since(pod: &Pod) -> Option<jiff::Timestamp> {
    // Go through the RFC 3339 wire format.
    let value = serde_json::to_value(pod.metadata.deletion_timestamp.as_ref()?).ok()?;
    value.as_str()?.parse().ok()
}

/// Pod names of every group, lowest ordinal first.
pub fn group_pod_names(groups: &[TopologyGroup]) -> Vec<String> {
    groups.iter().flat_map(TopologyGroup::pod_names).collect()
}
