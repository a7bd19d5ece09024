//! Operations on one application's workload object

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Container;
use kube::ResourceExt;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::FieldPatch;
use crate::config::{CREATED_BY_LABEL, RESTART_ANNOTATION, STAGE_ID_LABEL};
use crate::metrics::{DEGRADED_STATUS, OPERATIONS, OPERATION_DURATION, OPERATION_ERRORS};
use crate::models::{NameSet, StatusView, WorkloadRef};
use crate::reconcilers::projection::{
    binding_names, primary_container, rebind_mounts, rebind_volumes, rebuild_environment,
    replace_pod_spec, resolve_bindings, with_primary_container, with_replicas,
};
use crate::reconcilers::retry::{cancellable, retry_on_conflict};
use crate::reconcilers::status::{Replicas, StatusAggregator};
use crate::reconcilers::Context;
use crate::{Error, Result};

/// Last restart marker handed out by this process
static LAST_RESTART_MARKER: AtomicI64 = AtomicI64::new(0);

/// Handle on the workload object of one application
///
/// Holds no copy of the object between calls; every operation reads it fresh.
pub struct Workload {
    ctx: Arc<Context>,
    workload: WorkloadRef,
    cancel: CancellationToken,
}

impl Workload {
    pub fn new(ctx: Arc<Context>, workload: WorkloadRef) -> Self {
        Self {
            ctx,
            workload,
            cancel: CancellationToken::new(),
        }
    }

    /// Abort in-flight reads, writes and backoff waits when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn workload_ref(&self) -> &WorkloadRef {
        &self.workload
    }

    /// Change the bound services from `old` to `services`
    ///
    /// Only the volumes and mounts of services that were removed or added are
    /// touched; everything else on the pod template passes through.
    #[instrument(skip(self, old, services), fields(namespace = %self.workload.namespace, name = %self.workload.name))]
    pub async fn bind_services(&self, user: &str, old: &NameSet, services: &[String]) -> Result<()> {
        self.measure("bind_services", async {
            let bindings = cancellable(
                &self.cancel,
                resolve_bindings(self.ctx.bindings.as_ref(), services, &self.workload.name, user),
            )
            .await?;
            let new = binding_names(&bindings);
            let workload = &self.workload;

            self.reconcile("bind_services", |current| {
                replace_pod_spec(current, workload, |pod| {
                    let container = primary_container(pod, workload)?;
                    let volumes = rebind_volumes(
                        pod.volumes.as_deref().unwrap_or_default(),
                        old,
                        &new,
                        &bindings,
                    )?;
                    let mounts = rebind_mounts(
                        container.volume_mounts.as_deref().unwrap_or_default(),
                        old,
                        &new,
                        &bindings,
                    )?;

                    let container = Container {
                        volume_mounts: Some(mounts),
                        ..container.clone()
                    };
                    Ok(k8s_openapi::api::core::v1::PodSpec {
                        volumes: Some(volumes),
                        ..with_primary_container(pod, container)
                    })
                })
            })
            .await?;

            info!(
                "Bound services of {}: {:?} -> {:?}",
                self.workload, old, new
            );
            Ok::<_, Error>(())
        })
        .await
    }

    /// Replace the environment entries sourced from the application's
    /// environment secret with one entry per name in `names`
    #[instrument(skip(self, names), fields(namespace = %self.workload.namespace, name = %self.workload.name))]
    pub async fn set_environment(&self, names: &[String]) -> Result<()> {
        self.measure("set_environment", async {
            let secret_name = self.workload.env_secret_name();
            let workload = &self.workload;

            self.reconcile("set_environment", |current| {
                replace_pod_spec(current, workload, |pod| {
                    let container = primary_container(pod, workload)?;
                    let env = rebuild_environment(
                        container.env.as_deref().unwrap_or_default(),
                        &secret_name,
                        names,
                    );
                    let container = Container {
                        env: Some(env),
                        ..container.clone()
                    };
                    Ok(with_primary_container(pod, container))
                })
            })
            .await?;

            info!(
                "Set {} environment variables on {} from secret {}",
                names.len(),
                self.workload,
                secret_name
            );
            Ok::<_, Error>(())
        })
        .await
    }

    /// Set the desired replica count
    ///
    /// Returns once the write is accepted, not once the replicas exist.
    #[instrument(skip(self), fields(namespace = %self.workload.namespace, name = %self.workload.name))]
    pub async fn scale(&self, instances: u32) -> Result<()> {
        self.measure("scale", async {
            let replicas = i32::try_from(instances).map_err(|_| {
                Error::ValidationError(format!("instances must be <= {}, got {}", i32::MAX, instances))
            })?;

            self.reconcile("scale", |current| Ok(with_replicas(current, replicas)))
                .await?;

            info!("Scaled {} to {} replicas", self.workload, replicas);
            Ok::<_, Error>(())
        })
        .await
    }

    /// Force a rolling restart by bumping the restart annotation of the pod
    /// template
    ///
    /// A single patch; conflicts are returned to the caller unretried.
    #[instrument(skip(self), fields(namespace = %self.workload.namespace, name = %self.workload.name))]
    pub async fn restart(&self) -> Result<()> {
        self.measure("restart", async {
            let marker = next_restart_marker();
            let patch = FieldPatch::TemplateAnnotation {
                key: RESTART_ANNOTATION.to_string(),
                value: marker.to_string(),
            };

            cancellable(&self.cancel, self.ctx.gateway.patch(&self.workload, &patch)).await?;

            info!("Restarted {} (marker {})", self.workload, marker);
            Ok::<_, Error>(())
        })
        .await
    }

    /// Composite status of the workload, or `None` when no workload object
    /// exists (the application is inactive)
    ///
    /// Route and replica lookup failures are folded into the view; only a
    /// failed usage conversion, a cancellation or a failed object read fail
    /// the call.
    #[instrument(skip(self), fields(namespace = %self.workload.namespace, name = %self.workload.name))]
    pub async fn get(&self) -> Result<Option<StatusView>> {
        self.measure("get", async {
            let deployment = match self.fetch().await {
                Ok(deployment) => deployment,
                Err(e) if e.is_not_found() => {
                    debug!("No workload object for {}, application is inactive", self.workload);
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };

            let (ready_replicas, desired_replicas) = deployment
                .status
                .as_ref()
                .map(|s| (s.ready_replicas.unwrap_or(0), s.replicas.unwrap_or(0)))
                .unwrap_or((0, 0));
            let mut status_text = format!("{}/{}", ready_replicas, desired_replicas);

            let template_labels = deployment
                .spec
                .as_ref()
                .and_then(|s| s.template.metadata.as_ref())
                .and_then(|m| m.labels.as_ref());
            let template_label = |key: &str| {
                template_labels
                    .and_then(|labels| labels.get(key))
                    .cloned()
                    .unwrap_or_default()
            };

            let created_at = deployment
                .creation_timestamp()
                .map(|t| t.0.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();

            let routes = match cancellable(
                &self.cancel,
                self.ctx.routes.list_routes(&self.workload),
            )
            .await
            {
                Ok(routes) => routes,
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    warn!("Failed to list routes of {}: {}", self.workload, e);
                    DEGRADED_STATUS.with_label_values(&["routes"]).inc();
                    vec![e.to_string()]
                }
            };

            let replicas = match self.aggregate(&deployment).await {
                Ok(replicas) => replicas,
                Err(e) if e.is_fatal_for_status() || matches!(e, Error::Cancelled) => {
                    return Err(e)
                }
                Err(e) => {
                    warn!("Failed to get replica details of {}: {}", self.workload, e);
                    DEGRADED_STATUS.with_label_values(&["replicas"]).inc();
                    status_text = format!("failed to get replica details: {}", e);
                    Replicas::new()
                }
            };

            Ok::<_, Error>(Some(StatusView {
                active: true,
                created_at,
                desired_replicas,
                ready_replicas,
                replicas,
                username: template_label(CREATED_BY_LABEL),
                stage_id: template_label(STAGE_ID_LABEL),
                status_text,
                routes,
            }))
        })
        .await
    }

    /// Per-replica detail of the workload
    pub async fn replicas(&self) -> Result<Replicas> {
        self.aggregator().replicas().await
    }

    /// Pods belonging to the application
    pub async fn pods(&self) -> Result<Vec<k8s_openapi::api::core::v1::Pod>> {
        cancellable(
            &self.cancel,
            self.ctx
                .gateway
                .list_pods(&self.workload.namespace, &self.workload.pod_selector()),
        )
        .await
    }

    pub async fn pod_names(&self) -> Result<Vec<String>> {
        Ok(self.pods().await?.iter().map(|p| p.name_any()).collect())
    }

    fn aggregator(&self) -> StatusAggregator<'_> {
        StatusAggregator::new(self.ctx.gateway.as_ref(), &self.workload, &self.cancel)
    }

    async fn aggregate(&self, deployment: &Deployment) -> Result<Replicas> {
        self.aggregator().replicas_for(deployment).await
    }

    async fn fetch(&self) -> Result<Deployment> {
        cancellable(&self.cancel, self.ctx.gateway.fetch(&self.workload)).await
    }

    /// Fetch-mutate-write cycle under conflict retry
    ///
    /// `transform` derives the desired object from the freshly read one and is
    /// re-run on every attempt.
    async fn reconcile<F>(&self, operation: &str, transform: F) -> Result<()>
    where
        F: Fn(&Deployment) -> Result<Deployment>,
    {
        let transform = &transform;
        let gateway = self.ctx.gateway.as_ref();
        let workload = &self.workload;
        let cancel = &self.cancel;

        retry_on_conflict(&self.ctx.config.retry, cancel, operation, move || async move {
            let current = cancellable(cancel, gateway.fetch(workload)).await?;
            let version = current.resource_version().ok_or_else(|| {
                Error::KubeError(format!("Deployment {} has no resourceVersion", workload))
            })?;

            let desired = transform(&current)?;
            debug!("Writing {} at version {}", workload, version);

            cancellable(cancel, gateway.conditional_write(workload, &desired, &version)).await?;
            Ok::<_, Error>(())
        })
        .await
    }

    /// Record count, duration and failure of an operation
    async fn measure<T, F>(&self, operation: &str, future: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        OPERATIONS.with_label_values(&[operation]).inc();

        let result = future.await;

        OPERATION_DURATION
            .with_label_values(&[operation])
            .observe(start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            OPERATION_ERRORS.with_label_values(&[operation]).inc();
            warn!("{} on {} failed: {}", operation, self.workload, e);
        }
        result
    }
}

/// Current time in nanoseconds, strictly greater than any marker this process
/// handed out before
fn next_restart_marker() -> i64 {
    let now = Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
    let mut last = LAST_RESTART_MARKER.load(Ordering::Relaxed);
    loop {
        let next = now.max(last.saturating_add(1));
        match LAST_RESTART_MARKER.compare_exchange_weak(
            last,
            next,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}
