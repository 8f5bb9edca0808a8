use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, Preconditions};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, instrument};

use super::{ObjectStore, Result};
use crate::controller::context::FIELD_MANAGER;
use crate::crd::Elasticsearch;
use crate::topology::cluster_selector;

/// Object store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    namespace: String,
}

impl KubeStore {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

impl ObjectStore for KubeStore {
    async fn list_statefulsets(&self, cluster: &str) -> Result<Vec<StatefulSet>> {
        let lp = ListParams::default().labels(&cluster_selector(cluster));
        Ok(self.api::<StatefulSet>().list(&lp).await?.items)
    }

    async fn list_pods(&self, cluster: &str) -> Result<Vec<Pod>> {
        let lp = ListParams::default().labels(&cluster_selector(cluster));
        Ok(self.api::<Pod>().list(&lp).await?.items)
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    async fn scale_statefulset(&self, name: &str, replicas: i32) -> Result<()> {
        let patch = json!({ "spec": { "replicas": replicas } });
        self.api::<StatefulSet>()
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_statefulset(&self, name: &str) -> Result<()> {
        debug!(namespace = %self.namespace, statefulset = %name, "Deleting StatefulSet");
        self.api::<StatefulSet>()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<()> {
        debug!(namespace = %self.namespace, service = %name, "Deleting Service");
        self.api::<Service>()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        debug!(namespace = %self.namespace, secret = %name, "Deleting Secret");
        self.api::<Secret>()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    #[instrument(skip(self, pod), fields(namespace = %self.namespace, pod = %pod.name_any()))]
    async fn delete_pod(&self, pod: &Pod) -> Result<()> {
        let params = DeleteParams {
            preconditions: Some(Preconditions {
                uid: pod.metadata.uid.clone(),
                resource_version: pod.metadata.resource_version.clone(),
            }),
            ..DeleteParams::default()
        };
        self.api::<Pod>().delete(&pod.name_any(), &params).await?;
        Ok(())
    }

    async fn annotate_cluster(&self, cluster: &str, key: &str, value: Option<&str>) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": { key: value } } });
        self.api::<Elasticsearch>()
            .patch(cluster, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}
