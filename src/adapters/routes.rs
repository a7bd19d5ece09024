//! Route directory backed by networking/v1 Ingresses

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::ListParams;
use kube::{Api, Client};

use crate::cluster::RouteDirectory;
use crate::models::WorkloadRef;
use crate::{Error, Result};

/// Lists the routes of an application from the ingresses labelled for it
#[derive(Clone)]
pub struct IngressRouteDirectory {
    client: Client,
}

impl IngressRouteDirectory {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RouteDirectory for IngressRouteDirectory {
    async fn list_routes(&self, workload: &WorkloadRef) -> Result<Vec<String>> {
        let ingresses: Api<Ingress> = Api::namespaced(self.client.clone(), &workload.namespace);
        let selector = format!("app.kubernetes.io/name={}", workload.name);

        let list = ingresses
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| {
                Error::ResolutionError(format!("Failed to list routes of {}: {}", workload, e))
            })?;

        Ok(list.items.iter().flat_map(ingress_routes).collect())
    }
}

/// Routes (`host` + `path`) declared by one ingress
pub fn ingress_routes(ingress: &Ingress) -> Vec<String> {
    let mut routes = Vec::new();
    let rules = ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .map(|r| r.as_slice())
        .unwrap_or_default();

    for rule in rules {
        let Some(host) = rule.host.as_deref() else {
            continue;
        };
        let paths = rule
            .http
            .as_ref()
            .map(|h| h.paths.as_slice())
            .unwrap_or_default();

        if paths.is_empty() {
            routes.push(host.to_string());
            continue;
        }
        for path in paths {
            let path = path.path.as_deref().unwrap_or("/");
            routes.push(format!("{}{}", host, path));
        }
    }
    routes
}
