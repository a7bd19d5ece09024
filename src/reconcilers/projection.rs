//! Pure projections from intent (bindings, environment names) onto a
//! workload's pod template

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, SecretKeySelector,
    SecretVolumeSource, Volume, VolumeMount,
};

use crate::cluster::ServiceBindingProvider;
use crate::config::SERVICE_MOUNT_ROOT;
use crate::models::{NameSet, ServiceBinding, WorkloadRef};
use crate::{Error, Result};

impl ServiceBinding {
    /// Secret-backed volume exposing the service parameters
    pub fn volume(&self) -> Volume {
        Volume {
            name: self.service.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(self.resource.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Read-only mount of the binding volume at `/services/<service>`
    pub fn mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.service.clone(),
            mount_path: format!("{}/{}", SERVICE_MOUNT_ROOT, self.service),
            read_only: Some(true),
            ..Default::default()
        }
    }
}

pub fn to_volumes(bindings: &[ServiceBinding]) -> Vec<Volume> {
    bindings.iter().map(ServiceBinding::volume).collect()
}

pub fn to_mounts(bindings: &[ServiceBinding]) -> Vec<VolumeMount> {
    bindings.iter().map(ServiceBinding::mount).collect()
}

/// Resolve each service into a binding, in order; the first failure aborts
pub async fn resolve_bindings(
    provider: &dyn ServiceBindingProvider,
    services: &[String],
    app: &str,
    user: &str,
) -> Result<Vec<ServiceBinding>> {
    let mut bindings = Vec::with_capacity(services.len());
    for service in services {
        let resource = provider.resolve(service, app, user).await?;
        bindings.push(ServiceBinding {
            service: service.clone(),
            resource,
        });
    }
    Ok(bindings)
}

/// Names of the services in a binding list
pub fn binding_names(bindings: &[ServiceBinding]) -> NameSet {
    bindings.iter().map(|b| b.service.clone()).collect()
}

/// The application's primary container: the first container of the pod
/// template, which must exist
pub fn primary_container<'a>(pod: &'a PodSpec, workload: &WorkloadRef) -> Result<&'a Container> {
    pod.containers
        .first()
        .ok_or_else(|| Error::MissingPrimaryContainer(workload.to_string()))
}

/// Pod spec of a copy of `pod` with its primary container replaced
pub fn with_primary_container(pod: &PodSpec, container: Container) -> PodSpec {
    let containers = std::iter::once(container)
        .chain(pod.containers.iter().skip(1).cloned())
        .collect();
    PodSpec {
        containers,
        ..pod.clone()
    }
}

/// Build a new workload object whose pod template spec is `build(current)`
pub fn replace_pod_spec<F>(
    deployment: &Deployment,
    workload: &WorkloadRef,
    build: F,
) -> Result<Deployment>
where
    F: FnOnce(&PodSpec) -> Result<PodSpec>,
{
    let spec = deployment
        .spec
        .as_ref()
        .ok_or_else(|| Error::MissingPrimaryContainer(workload.to_string()))?;
    let pod = spec
        .template
        .spec
        .as_ref()
        .ok_or_else(|| Error::MissingPrimaryContainer(workload.to_string()))?;

    let pod = build(pod)?;

    Ok(Deployment {
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                spec: Some(pod),
                ..spec.template.clone()
            },
            ..spec.clone()
        }),
        ..deployment.clone()
    })
}

/// Build a new workload object with the replica count set to `replicas`
pub fn with_replicas(deployment: &Deployment, replicas: i32) -> Deployment {
    let spec = deployment.spec.clone().unwrap_or_default();
    Deployment {
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..spec
        }),
        ..deployment.clone()
    }
}

/// Whether a volume or mount named `name` survives a rebind: everything not
/// previously bound passes, previously bound services only if still wanted
fn keeps(name: &str, old: &NameSet, new: &NameSet) -> bool {
    !(old.contains(name) && !new.contains(name))
}

/// Incrementally rebind service volumes
///
/// Volumes of removed services (in `old`, not in `new`) are dropped, all others
/// are kept in place, and bindings not in `old` are appended. A binding whose
/// volume is already present is skipped; a different volume holding the
/// service's name is a `ValidationError`.
pub fn rebind_volumes(
    volumes: &[Volume],
    old: &NameSet,
    new: &NameSet,
    bindings: &[ServiceBinding],
) -> Result<Vec<Volume>> {
    let mut result: Vec<Volume> = volumes
        .iter()
        .filter(|v| keeps(&v.name, old, new))
        .cloned()
        .collect();

    for binding in bindings.iter().filter(|b| !old.contains(&b.service)) {
        match result.iter().find(|v| v.name == binding.service) {
            None => result.push(binding.volume()),
            Some(existing) if is_binding_volume(existing, binding) => {}
            Some(_) => {
                return Err(Error::ValidationError(format!(
                    "volume {} already exists and is not the binding of service {}",
                    binding.service, binding.service
                )))
            }
        }
    }
    Ok(result)
}

/// Incrementally rebind service mounts; mirrors `rebind_volumes`
pub fn rebind_mounts(
    mounts: &[VolumeMount],
    old: &NameSet,
    new: &NameSet,
    bindings: &[ServiceBinding],
) -> Result<Vec<VolumeMount>> {
    let mut result: Vec<VolumeMount> = mounts
        .iter()
        .filter(|m| keeps(&m.name, old, new))
        .cloned()
        .collect();

    for binding in bindings.iter().filter(|b| !old.contains(&b.service)) {
        match result.iter().find(|m| m.name == binding.service) {
            None => result.push(binding.mount()),
            Some(existing) if existing.mount_path == binding.mount().mount_path => {}
            Some(existing) => {
                return Err(Error::ValidationError(format!(
                    "mount {} at {} already exists and is not the binding of service {}",
                    existing.name, existing.mount_path, binding.service
                )))
            }
        }
    }
    Ok(result)
}

/// Whether `volume` is the secret volume of `binding`
fn is_binding_volume(volume: &Volume, binding: &ServiceBinding) -> bool {
    volume
        .secret
        .as_ref()
        .and_then(|s| s.secret_name.as_deref())
        == Some(binding.resource.as_str())
}

/// Whether an environment entry takes its value from the secret `secret_name`
pub fn is_sourced_from(entry: &EnvVar, secret_name: &str) -> bool {
    entry
        .value_from
        .as_ref()
        .and_then(|source| source.secret_key_ref.as_ref())
        .is_some_and(|key_ref| key_ref.name == secret_name)
}

/// Environment entry reading `name` from the key of the same name in `secret_name`
pub fn secret_env_var(name: &str, secret_name: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: name.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Strip every entry sourced from `secret_name` and append one per `names`
///
/// Entries with other sources are kept in their original order.
pub fn rebuild_environment(env: &[EnvVar], secret_name: &str, names: &[String]) -> Vec<EnvVar> {
    env.iter()
        .filter(|entry| !is_sourced_from(entry, secret_name))
        .cloned()
        .chain(names.iter().map(|name| secret_env_var(name, secret_name)))
        .collect()
}
