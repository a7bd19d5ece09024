//! Cluster gateway backed by the Kubernetes API

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use crate::cluster::{ClusterGateway, ContainerUsage, FieldPatch, PodUsage};
use crate::models::WorkloadRef;
use crate::{Error, Result};

/// Gateway over apps/v1 Deployments, core/v1 Pods and metrics.k8s.io PodMetrics
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
}

impl KubeGateway {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pod_metrics(&self, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        Api::namespaced_with(self.client.clone(), namespace, &resource)
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn fetch(&self, workload: &WorkloadRef) -> Result<Deployment> {
        self.deployments(&workload.namespace)
            .get(&workload.name)
            .await
            .map_err(|e| Error::from_kube(format!("Failed to get Deployment {}", workload), e))
    }

    async fn conditional_write(
        &self,
        workload: &WorkloadRef,
        deployment: &Deployment,
        observed_version: &str,
    ) -> Result<Deployment> {
        let mut desired = deployment.clone();
        desired.metadata.resource_version = Some(observed_version.to_string());

        let written = self
            .deployments(&workload.namespace)
            .replace(&workload.name, &PostParams::default(), &desired)
            .await
            .map_err(|e| Error::from_kube(format!("Failed to update Deployment {}", workload), e))?;

        debug!(
            "Replaced Deployment {} (version {} -> {})",
            workload,
            observed_version,
            written.resource_version().unwrap_or_default()
        );
        Ok(written)
    }

    async fn patch(&self, workload: &WorkloadRef, patch: &FieldPatch) -> Result<()> {
        let body = patch.to_merge_patch();
        self.deployments(&workload.namespace)
            .patch(&workload.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(|e| Error::from_kube(format!("Failed to patch Deployment {}", workload), e))?;
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = pods
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| Error::from_kube(format!("Failed to list pods in {}", namespace), e))?;
        Ok(list.items)
    }

    async fn list_usage(&self, namespace: &str, selector: &str) -> Result<Vec<PodUsage>> {
        let list = self
            .pod_metrics(namespace)
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|e| {
                Error::MetricsUnavailable(format!(
                    "Failed to list pod metrics in {}: {}",
                    namespace, e
                ))
            })?;

        list.items.into_iter().map(pod_usage_from_dynamic).collect()
    }
}

/// Convert a raw PodMetrics object into a `PodUsage`
pub fn pod_usage_from_dynamic(object: DynamicObject) -> Result<PodUsage> {
    let name = object.name_any();
    let containers = match object.data.get("containers") {
        Some(raw) => serde_json::from_value::<Vec<ContainerUsage>>(raw.clone()).map_err(|e| {
            Error::MetricsUnavailable(format!("Malformed metrics for pod {}: {}", name, e))
        })?,
        None => Vec::new(),
    };
    Ok(PodUsage { name, containers })
}
