//! Service binding provider backed by Kubernetes secrets

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

use crate::cluster::ServiceBindingProvider;
use crate::models::generate_resource_name;
use crate::{Error, Result};

/// Name of the secret holding the binding of `service` to `app`
pub fn binding_secret_name(service: &str, app: &str) -> String {
    generate_resource_name(&[service, app, "binding"])
}

/// Fetch a secret by name from the given namespace
pub async fn get_secret(client: &Client, namespace: &str, name: &str) -> Result<Secret> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    secrets
        .get(name)
        .await
        .map_err(|e| Error::from_kube(format!("Failed to get secret {}", name), e))
}

/// Resolves bindings to pre-provisioned secrets in one namespace
#[derive(Clone)]
pub struct SecretBindingProvider {
    client: Client,
    namespace: String,
}

impl SecretBindingProvider {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl ServiceBindingProvider for SecretBindingProvider {
    async fn resolve(&self, service: &str, app: &str, user: &str) -> Result<String> {
        let name = binding_secret_name(service, app);
        debug!(
            "Resolving binding of service {} to {}/{} for {}",
            service, self.namespace, app, user
        );

        get_secret(&self.client, &self.namespace, &name)
            .await
            .map_err(|e| {
                Error::ResolutionError(format!(
                    "service {} has no usable binding for app {}: {}",
                    service, app, e
                ))
            })?;

        Ok(name)
    }
}
