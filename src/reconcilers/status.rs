//! Status aggregation: per-replica detail from pods and pod metrics

use chrono::SecondsFormat;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cluster::{ClusterGateway, PodUsage};
use crate::models::{ReplicaSnapshot, WorkloadRef};
use crate::quantity;
use crate::reconcilers::retry::cancellable;
use crate::{Error, Result};

/// Replica snapshots keyed by pod name
pub type Replicas = BTreeMap<String, ReplicaSnapshot>;

/// Merges a workload object, its pods and their metrics into replica snapshots
///
/// The three reads are independent; pods may appear or vanish between them.
pub struct StatusAggregator<'a> {
    gateway: &'a dyn ClusterGateway,
    workload: &'a WorkloadRef,
    cancel: &'a CancellationToken,
}

impl<'a> StatusAggregator<'a> {
    pub fn new(
        gateway: &'a dyn ClusterGateway,
        workload: &'a WorkloadRef,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            gateway,
            workload,
            cancel,
        }
    }

    /// Fetch the workload object and aggregate its replicas
    pub async fn replicas(&self) -> Result<Replicas> {
        let deployment = cancellable(self.cancel, self.gateway.fetch(self.workload)).await?;
        self.replicas_for(&deployment).await
    }

    /// Aggregate the replicas of an already fetched workload object
    pub async fn replicas_for(&self, deployment: &Deployment) -> Result<Replicas> {
        let selector = selector_for(deployment, self.workload);
        let namespace = &self.workload.namespace;

        let pods = cancellable(self.cancel, self.gateway.list_pods(namespace, &selector)).await?;
        let usage = cancellable(self.cancel, self.gateway.list_usage(namespace, &selector))
            .await
            .map_err(|e| match e {
                Error::Cancelled | Error::MetricsUnavailable(_) => e,
                other => Error::MetricsUnavailable(other.to_string()),
            })?;

        debug!(
            pods = pods.len(),
            metrics = usage.len(),
            "Aggregating replicas of {}",
            self.workload
        );

        let mut replicas = snapshot_pods(&pods, &self.workload.name);
        merge_usage(&mut replicas, &usage)?;
        Ok(replicas)
    }
}

/// Label selector of the workload object, falling back to the standard
/// application labels when it declares none
///
/// Both `matchLabels` and `matchExpressions` are rendered in the list selector
/// syntax of the API server.
pub fn selector_for(deployment: &Deployment, workload: &WorkloadRef) -> String {
    let Some(selector) = deployment.spec.as_ref().map(|s| &s.selector) else {
        return workload.pod_selector();
    };

    let mut terms: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect();
    terms.extend(selector.match_expressions.iter().flatten().map(|e| {
        let values = e.values.as_deref().unwrap_or_default().join(",");
        match e.operator.as_str() {
            "In" => format!("{} in ({})", e.key, values),
            "NotIn" => format!("{} notin ({})", e.key, values),
            "DoesNotExist" => format!("!{}", e.key),
            _ => e.key.clone(),
        }
    }));

    if terms.is_empty() {
        workload.pod_selector()
    } else {
        terms.join(",")
    }
}

/// A pod is ready when its Ready condition holds and every container is ready
pub fn is_pod_ready(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };

    let condition_ready = status
        .conditions
        .as_ref()
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"));

    let containers_ready = status
        .container_statuses
        .as_ref()
        .map_or(true, |statuses| statuses.iter().all(|cs| cs.ready));

    condition_ready && containers_ready
}

/// Restarts of the application container; sidecars are not counted
pub fn app_restarts(pod: &Pod, app: &str) -> i32 {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .filter(|cs| cs.name == app)
                .map(|cs| cs.restart_count)
                .sum::<i32>()
        })
        .unwrap_or(0)
}

/// One snapshot per pod, without usage figures
pub fn snapshot_pods(pods: &[Pod], app: &str) -> Replicas {
    pods.iter()
        .filter_map(|pod| {
            let name = pod.metadata.name.clone()?;
            let created_at = pod
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0.to_rfc3339_opts(SecondsFormat::Secs, true))
                .unwrap_or_default();

            let snapshot = ReplicaSnapshot {
                name: name.clone(),
                restarts: app_restarts(pod, app),
                ready: is_pod_ready(pod),
                created_at,
                ..Default::default()
            };
            Some((name, snapshot))
        })
        .collect()
}

/// Fill in CPU and memory usage from pod metrics
///
/// Metrics of pods not present in `replicas` are ignored. Usage is summed over
/// all containers of a pod, sidecars included. Fails if a memory total is not
/// a whole number of bytes.
pub fn merge_usage(replicas: &mut Replicas, usage: &[PodUsage]) -> Result<()> {
    for pod in usage {
        let Some(snapshot) = replicas.get_mut(&pod.name) else {
            continue;
        };

        let mut cpu = Decimal::ZERO;
        let mut memory = Decimal::ZERO;
        for container in &pod.containers {
            if let Some(q) = container.cpu() {
                cpu = add(cpu, quantity::from_quantity(q)?, &pod.name)?;
            }
            if let Some(q) = container.memory() {
                memory = add(memory, quantity::from_quantity(q)?, &pod.name)?;
            }
        }

        let memory_bytes = quantity::as_exact_i64(memory).ok_or_else(|| {
            Error::ConversionError(format!(
                "memory usage of pod {} is not an integer byte count: {}",
                pod.name, memory
            ))
        })?;

        snapshot.milli_cpus = quantity::to_milli_rounded(cpu);
        snapshot.memory_bytes = memory_bytes;
    }
    Ok(())
}

fn add(total: Decimal, value: Decimal, pod: &str) -> Result<Decimal> {
    total
        .checked_add(value)
        .ok_or_else(|| Error::ConversionError(format!("usage of pod {} overflows", pod)))
}
