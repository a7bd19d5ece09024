//! Contracts of the external collaborators the reconciler consumes
//!
//! The reconciler never talks to the Kubernetes API directly. It goes through
//! these traits so the store, the binding provider and the route directory can
//! be swapped (see `adapters` for the Kubernetes implementations).

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::WorkloadRef;
use crate::Result;

/// Single-field change applied without a read-modify-write cycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldPatch {
    /// Set an annotation on the workload's pod template
    TemplateAnnotation { key: String, value: String },
}

impl FieldPatch {
    /// JSON merge patch body for this change
    pub fn to_merge_patch(&self) -> serde_json::Value {
        match self {
            FieldPatch::TemplateAnnotation { key, value } => serde_json::json!({
                "spec": {"template": {"metadata": {"annotations": {key: value}}}}
            }),
        }
    }
}

/// Resource usage of one container, as reported by the metrics API
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    #[serde(default)]
    pub usage: BTreeMap<String, Quantity>,
}

impl ContainerUsage {
    pub fn cpu(&self) -> Option<&Quantity> {
        self.usage.get("cpu")
    }

    pub fn memory(&self) -> Option<&Quantity> {
        self.usage.get("memory")
    }
}

/// Resource usage of one pod
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PodUsage {
    pub name: String,
    pub containers: Vec<ContainerUsage>,
}

/// Conditional read/write access to workload objects, pods and pod metrics
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Fetch the workload object; `Error::NotFound` when absent
    async fn fetch(&self, workload: &WorkloadRef) -> Result<Deployment>;

    /// Replace the workload object if its stored version still equals
    /// `observed_version`; `Error::Conflict` otherwise
    async fn conditional_write(
        &self,
        workload: &WorkloadRef,
        deployment: &Deployment,
        observed_version: &str,
    ) -> Result<Deployment>;

    /// Apply a single-field patch to the workload object
    async fn patch(&self, workload: &WorkloadRef, patch: &FieldPatch) -> Result<()>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn list_usage(&self, namespace: &str, selector: &str) -> Result<Vec<PodUsage>>;
}

/// Resolves a service into the name of the secret backing its binding
#[async_trait]
pub trait ServiceBindingProvider: Send + Sync {
    async fn resolve(&self, service: &str, app: &str, user: &str) -> Result<String>;
}

/// Lists the externally reachable routes of an application
#[async_trait]
pub trait RouteDirectory: Send + Sync {
    async fn list_routes(&self, workload: &WorkloadRef) -> Result<Vec<String>>;
}
