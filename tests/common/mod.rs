//! Shared in-memory collaborators for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStatus};
use k8s_openapi::api::core::v1::{
    Container, ContainerStatus, EnvVar, Pod, PodCondition, PodSpec, PodStatus, PodTemplateSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, Time};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use app_workload_reconciler::cluster::{
    ClusterGateway, ContainerUsage, FieldPatch, PodUsage, RouteDirectory, ServiceBindingProvider,
};
use app_workload_reconciler::config::{ReconcilerConfig, RetryPolicy};
use app_workload_reconciler::models::WorkloadRef;
use app_workload_reconciler::reconcilers::{Context, Workload};
use app_workload_reconciler::{Error, Result};

pub const APP: &str = "myapp";
pub const NAMESPACE: &str = "workspace";

type Interference = Box<dyn FnOnce(&mut Deployment) + Send>;

#[derive(Default)]
struct State {
    objects: HashMap<WorkloadRef, Deployment>,
    version: u64,
    pods: Vec<Pod>,
    usage: Option<Vec<PodUsage>>,
    interference: VecDeque<Interference>,
    write_failure: Option<Error>,
    patch_conflict: bool,
    fetches: u32,
    writes: u32,
    conflicts: u32,
    patches: Vec<FieldPatch>,
}

/// Object store with resource versions and optimistic concurrency
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<State>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        let gateway = Self::default();
        gateway.state.lock().unwrap().usage = Some(Vec::new());
        gateway
    }

    pub fn insert(&self, deployment: Deployment) {
        let mut state = self.state.lock().unwrap();
        let workload = WorkloadRef::new(
            deployment.metadata.name.clone().unwrap(),
            deployment.metadata.namespace.clone().unwrap(),
        );
        state.version += 1;
        let mut stored = deployment;
        stored.metadata.resource_version = Some(state.version.to_string());
        state.objects.insert(workload, stored);
    }

    pub fn stored(&self, workload: &WorkloadRef) -> Deployment {
        self.state.lock().unwrap().objects[workload].clone()
    }

    pub fn set_pods(&self, pods: Vec<Pod>) {
        self.state.lock().unwrap().pods = pods;
    }

    pub fn set_usage(&self, usage: Vec<PodUsage>) {
        self.state.lock().unwrap().usage = Some(usage);
    }

    pub fn remove_metrics_provider(&self) {
        self.state.lock().unwrap().usage = None;
    }

    /// Apply `change` as a competing writer right before the next conditional write
    pub fn interfere<F>(&self, change: F)
    where
        F: FnOnce(&mut Deployment) + Send + 'static,
    {
        self.state
            .lock()
            .unwrap()
            .interference
            .push_back(Box::new(change));
    }

    pub fn fail_writes_with(&self, error: Error) {
        self.state.lock().unwrap().write_failure = Some(error);
    }

    pub fn conflict_on_patch(&self) {
        self.state.lock().unwrap().patch_conflict = true;
    }

    pub fn fetches(&self) -> u32 {
        self.state.lock().unwrap().fetches
    }

    pub fn writes(&self) -> u32 {
        self.state.lock().unwrap().writes
    }

    pub fn conflicts(&self) -> u32 {
        self.state.lock().unwrap().conflicts
    }

    pub fn patches(&self) -> Vec<FieldPatch> {
        self.state.lock().unwrap().patches.clone()
    }
}

#[async_trait]
impl ClusterGateway for MemoryGateway {
    async fn fetch(&self, workload: &WorkloadRef) -> Result<Deployment> {
        let mut state = self.state.lock().unwrap();
        state.fetches += 1;
        state
            .objects
            .get(workload)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("deployments \"{}\" not found", workload.name)))
    }

    async fn conditional_write(
        &self,
        workload: &WorkloadRef,
        deployment: &Deployment,
        observed_version: &str,
    ) -> Result<Deployment> {
        let mut state = self.state.lock().unwrap();

        if let Some(error) = state.write_failure.take() {
            return Err(error);
        }

        if let Some(change) = state.interference.pop_front() {
            state.version += 1;
            let version = state.version.to_string();
            let stored = state
                .objects
                .get_mut(workload)
                .ok_or_else(|| Error::NotFound(workload.to_string()))?;
            change(stored);
            stored.metadata.resource_version = Some(version);
        }

        let current_version = state
            .objects
            .get(workload)
            .and_then(|d| d.metadata.resource_version.clone())
            .ok_or_else(|| Error::NotFound(workload.to_string()))?;

        if current_version != observed_version {
            state.conflicts += 1;
            return Err(Error::Conflict(format!(
                "the object has been modified (stored {}, observed {})",
                current_version, observed_version
            )));
        }

        state.version += 1;
        state.writes += 1;
        let mut stored = deployment.clone();
        stored.metadata.resource_version = Some(state.version.to_string());
        state.objects.insert(workload.clone(), stored.clone());
        Ok(stored)
    }

    async fn patch(&self, workload: &WorkloadRef, patch: &FieldPatch) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.patch_conflict {
            state.conflicts += 1;
            return Err(Error::Conflict("patch rejected".to_string()));
        }

        state.version += 1;
        let version = state.version.to_string();
        let stored = state
            .objects
            .get_mut(workload)
            .ok_or_else(|| Error::NotFound(workload.to_string()))?;

        match patch {
            FieldPatch::TemplateAnnotation { key, value } => {
                let template = &mut stored.spec.get_or_insert_with(Default::default).template;
                template
                    .metadata
                    .get_or_insert_with(Default::default)
                    .annotations
                    .get_or_insert_with(Default::default)
                    .insert(key.clone(), value.clone());
            }
        }
        stored.metadata.resource_version = Some(version);
        state.patches.push(patch.clone());
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
        Ok(self.state.lock().unwrap().pods.clone())
    }

    async fn list_usage(&self, _namespace: &str, _selector: &str) -> Result<Vec<PodUsage>> {
        self.state
            .lock()
            .unwrap()
            .usage
            .clone()
            .ok_or_else(|| Error::MetricsUnavailable("the server could not find the requested resource".to_string()))
    }
}

/// Binding provider resolving from a fixed table
#[derive(Default)]
pub struct StaticBindings {
    secrets: HashMap<String, String>,
    calls: Mutex<Vec<String>>,
}

impl StaticBindings {
    pub fn with(services: &[&str]) -> Self {
        Self {
            secrets: services
                .iter()
                .map(|s| (s.to_string(), format!("{}-{}-binding", s, APP)))
                .collect(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceBindingProvider for StaticBindings {
    async fn resolve(&self, service: &str, _app: &str, _user: &str) -> Result<String> {
        self.calls.lock().unwrap().push(service.to_string());
        self.secrets
            .get(service)
            .cloned()
            .ok_or_else(|| Error::ResolutionError(format!("service {} does not exist", service)))
    }
}

/// Route directory returning a fixed answer
pub struct StaticRoutes(pub std::result::Result<Vec<String>, String>);

#[async_trait]
impl RouteDirectory for StaticRoutes {
    async fn list_routes(&self, _workload: &WorkloadRef) -> Result<Vec<String>> {
        self.0.clone().map_err(Error::ResolutionError)
    }
}

pub fn workload_ref() -> WorkloadRef {
    WorkloadRef::new(APP, NAMESPACE)
}

pub fn fast_config() -> ReconcilerConfig {
    ReconcilerConfig {
        retry: RetryPolicy {
            steps: 5,
            initial_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(10),
        },
    }
}

pub struct Harness {
    pub gateway: Arc<MemoryGateway>,
    pub bindings: Arc<StaticBindings>,
    pub workload: Workload,
}

pub fn harness(bindings: StaticBindings, routes: StaticRoutes) -> Harness {
    let gateway = Arc::new(MemoryGateway::new());
    let bindings = Arc::new(bindings);
    let ctx = Context::new(
        gateway.clone(),
        bindings.clone(),
        Arc::new(routes),
        fast_config(),
    );
    Harness {
        gateway,
        bindings,
        workload: Workload::new(ctx, workload_ref()),
    }
}

pub fn app_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/component".to_string(), "application".to_string()),
        ("app.kubernetes.io/name".to_string(), APP.to_string()),
        ("app.kubernetes.io/part-of".to_string(), NAMESPACE.to_string()),
    ])
}

/// An application Deployment with the given volumes, mounts and environment
pub fn deployment(volumes: Vec<Volume>, mounts: Vec<VolumeMount>, env: Vec<EnvVar>) -> Deployment {
    let mut template_labels = app_labels();
    template_labels.insert("app.kubernetes.io/created-by".to_string(), "alice".to_string());
    template_labels.insert("workload.paas.dev/stage-id".to_string(), "stage-42".to_string());

    Deployment {
        metadata: ObjectMeta {
            name: Some(APP.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            creation_timestamp: Some(time("2024-01-02T03:04:05Z")),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(app_labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: APP.to_string(),
                        image: Some("registry.local/myapp:latest".to_string()),
                        volume_mounts: Some(mounts),
                        env: Some(env),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: Some(DeploymentStatus {
            replicas: Some(2),
            ready_replicas: Some(1),
            ..Default::default()
        }),
    }
}

pub fn plain_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(Default::default()),
        ..Default::default()
    }
}

pub fn plain_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub fn time(rfc3339: &str) -> Time {
    Time(
        chrono::DateTime::parse_from_rfc3339(rfc3339)
            .unwrap()
            .with_timezone(&chrono::Utc),
    )
}

pub fn pod(name: &str, ready: bool, containers: &[(&str, bool, i32)]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            creation_timestamp: Some(time("2024-01-02T03:05:00Z")),
            ..Default::default()
        },
        status: Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".to_string(),
                status: if ready { "True" } else { "False" }.to_string(),
                ..Default::default()
            }]),
            container_statuses: Some(
                containers
                    .iter()
                    .map(|(name, ready, restarts)| ContainerStatus {
                        name: name.to_string(),
                        ready: *ready,
                        restart_count: *restarts,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn usage(pod: &str, containers: &[(&str, &str, &str)]) -> PodUsage {
    PodUsage {
        name: pod.to_string(),
        containers: containers
            .iter()
            .map(|(name, cpu, memory)| ContainerUsage {
                name: name.to_string(),
                usage: BTreeMap::from([
                    ("cpu".to_string(), Quantity(cpu.to_string())),
                    ("memory".to_string(), Quantity(memory.to_string())),
                ]),
            })
            .collect(),
    }
}

/// Names of the volumes on the stored pod template
pub fn volume_names(deployment: &Deployment) -> Vec<String> {
    pod_spec(deployment)
        .volumes
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|v| v.name)
        .collect()
}

/// Names of the mounts of the primary container
pub fn mount_names(deployment: &Deployment) -> Vec<String> {
    primary(deployment)
        .volume_mounts
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|m| m.name)
        .collect()
}

pub fn pod_spec(deployment: &Deployment) -> &PodSpec {
    deployment
        .spec
        .as_ref()
        .unwrap()
        .template
        .spec
        .as_ref()
        .unwrap()
}

pub fn primary(deployment: &Deployment) -> &Container {
    &pod_spec(deployment).containers[0]
}

pub fn names(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
