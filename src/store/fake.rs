//! In-memory `ObjectStore` used by tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use super::{ObjectStore, Result};
use crate::topology::{CLUSTER_NAME_LABEL, statefulset_replicas};

#[derive(Debug, Default)]
struct FakeObjects {
    statefulsets: Vec<StatefulSet>,
    pods: Vec<Pod>,
    services: BTreeSet<String>,
    secrets: BTreeSet<String>,
    annotations: BTreeMap<String, String>,
    pod_delete_error: Option<u16>,
    calls: Vec<String>,
}

/// Objects of one namespace, kept in memory.
#[derive(Debug, Default)]
pub struct FakeStore {
    objects: Mutex<FakeObjects>,
}

fn api_error(code: u16, message: String) -> kube::Error {
    let reason = match code {
        404 => "NotFound",
        409 => "Conflict",
        _ => "InternalError",
    };
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

fn in_cluster<K: ResourceExt>(obj: &K, cluster: &str) -> bool {
    obj.labels()
        .get(CLUSTER_NAME_LABEL)
        .is_some_and(|c| c == cluster)
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, FakeObjects> {
        self.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_statefulset(self, sts: StatefulSet) -> Self {
        self.objects().statefulsets.push(sts);
        self
    }

    pub fn with_pod(self, pod: Pod) -> Self {
        self.objects().pods.push(pod);
        self
    }

    pub fn with_pods(self, pods: impl IntoIterator<Item = Pod>) -> Self {
        self.objects().pods.extend(pods);
        self
    }

    pub fn with_service(self, name: &str) -> Self {
        self.objects().services.insert(name.to_string());
        self
    }

    pub fn with_secret(self, name: &str) -> Self {
        self.objects().secrets.insert(name.to_string());
        self
    }

    /// Makes every pod deletion fail with the given HTTP status.
    pub fn with_pod_delete_error(self, code: u16) -> Self {
        self.objects().pod_delete_error = Some(code);
        self
    }

    /// Mutating calls made so far, e.g. `"scale es-data 2"`.
    pub fn calls(&self) -> Vec<String> {
        self.objects().calls.clone()
    }

    pub fn replicas(&self, statefulset: &str) -> Option<i32> {
        self.objects()
            .statefulsets
            .iter()
            .find(|s| s.name_any() == statefulset)
            .map(statefulset_replicas)
    }

    pub fn has_statefulset(&self, name: &str) -> bool {
        self.objects()
            .statefulsets
            .iter()
            .any(|s| s.name_any() == name)
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.objects().pods.iter().map(|p| p.name_any()).collect()
    }

    pub fn services(&self) -> BTreeSet<String> {
        self.objects().services.clone()
    }

    pub fn secrets(&self) -> BTreeSet<String> {
        self.objects().secrets.clone()
    }

    pub fn annotation(&self, key: &str) -> Option<String> {
        self.objects().annotations.get(key).cloned()
    }
}

impl ObjectStore for FakeStore {
    async fn list_statefulsets(&self, cluster: &str) -> Result<Vec<StatefulSet>> {
        Ok(self
            .objects()
            .statefulsets
            .iter()
            .filter(|s| in_cluster(*s, cluster))
            .cloned()
            .collect())
    }

    async fn list_pods(&self, cluster: &str) -> Result<Vec<Pod>> {
        Ok(self
            .objects()
            .pods
            .iter()
            .filter(|p| in_cluster(*p, cluster))
            .cloned()
            .collect())
    }

    async fn scale_statefulset(&self, name: &str, replicas: i32) -> Result<()> {
        let mut objects = self.objects();
        objects.calls.push(format!("scale {name} {replicas}"));
        let sts = objects
            .statefulsets
            .iter_mut()
            .find(|s| s.name_any() == name)
            .ok_or_else(|| api_error(404, format!("statefulset {name} not found")))?;
        sts.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        Ok(())
    }

    async fn delete_statefulset(&self, name: &str) -> Result<()> {
        let mut objects = self.objects();
        objects.calls.push(format!("delete statefulset {name}"));
        let before = objects.statefulsets.len();
        objects.statefulsets.retain(|s| s.name_any() != name);
        if objects.statefulsets.len() == before {
            return Err(api_error(404, format!("statefulset {name} not found")));
        }
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        let mut objects = self.objects();
        objects.calls.push(format!("delete service {name}"));
        if !objects.services.remove(name) {
            return Err(api_error(404, format!("service {name} not found")));
        }
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        let mut objects = self.objects();
        objects.calls.push(format!("delete secret {name}"));
        if !objects.secrets.remove(name) {
            return Err(api_error(404, format!("secret {name} not found")));
        }
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let name = pod.name_any();
        let mut objects = self.objects();
        objects.calls.push(format!("delete pod {name}"));
        if let Some(code) = objects.pod_delete_error {
            return Err(api_error(code, format!("cannot delete pod {name}")));
        }
        let stored = objects
            .pods
            .iter()
            .find(|p| p.name_any() == name)
            .ok_or_else(|| api_error(404, format!("pod {name} not found")))?;
        if stored.metadata.uid != pod.metadata.uid
            || stored.metadata.resource_version != pod.metadata.resource_version
        {
            return Err(api_error(409, format!("precondition failed for pod {name}")));
        }
        objects.pods.retain(|p| p.name_any() != name);
        Ok(())
    }

    async fn annotate_cluster(&self, cluster: &str, key: &str, value: Option<&str>) -> Result<()> {
        let mut objects = self.objects();
        objects
            .calls
            .push(format!("annotate {cluster} {key}={}", value.unwrap_or("null")));
        match value {
            Some(v) => objects.annotations.insert(key.to_string(), v.to_string()),
            None => objects.annotations.remove(key),
        };
        Ok(())
    }
}
