//! Data model: workload identity, bindings and status views

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::ENV_SECRET_SUFFIX;

/// Maximum length of a generated Kubernetes resource name
const MAX_RESOURCE_NAME_LEN: usize = 63;

/// Set of service names bound before a bind call
pub type NameSet = BTreeSet<String>;

/// Identity of one application's runtime workload
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub name: String,
    pub namespace: String,
}

impl WorkloadRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }

    /// Name of the secret holding the application's environment variables
    pub fn env_secret_name(&self) -> String {
        generate_resource_name(&[&self.name, ENV_SECRET_SUFFIX])
    }

    /// Label selector matching the pods of this application
    pub fn pod_selector(&self) -> String {
        format!(
            "app.kubernetes.io/component=application,app.kubernetes.io/name={},app.kubernetes.io/part-of={}",
            self.name, self.namespace
        )
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Join name parts into a valid resource name, hashing overly long results
pub fn generate_resource_name(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.to_lowercase())
        .collect::<Vec<_>>()
        .join("-");

    if joined.len() <= MAX_RESOURCE_NAME_LEN {
        return joined;
    }

    let mut hasher = Sha256::new();
    hasher.update(joined.as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    // 16 hex chars of digest plus the separating dash
    let mut keep = MAX_RESOURCE_NAME_LEN - 17;
    while !joined.is_char_boundary(keep) {
        keep -= 1;
    }
    format!("{}-{}", joined[..keep].trim_end_matches('-'), &digest[..16])
}

/// A service bound to an application, backed by a secret
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceBinding {
    /// Name of the service getting bound
    pub service: String,
    /// Name of the secret mounted to expose the service parameters
    pub resource: String,
}

/// Point-in-time detail of one replica
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSnapshot {
    pub name: String,
    pub memory_bytes: i64,
    #[serde(rename = "millicpus")]
    pub milli_cpus: i64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub created_at: String,
    pub restarts: i32,
    pub ready: bool,
}

/// Composite status of an active application workload
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub active: bool,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub created_at: String,
    #[serde(rename = "desiredreplicas")]
    pub desired_replicas: i32,
    #[serde(rename = "readyreplicas")]
    pub ready_replicas: i32,
    pub replicas: BTreeMap<String, ReplicaSnapshot>,
    /// Application creator
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub username: String,
    /// Staging run of the running image
    #[serde(rename = "stage_id", skip_serializing_if = "String::is_empty", default)]
    pub stage_id: String,
    #[serde(rename = "status", skip_serializing_if = "String::is_empty", default)]
    pub status_text: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub routes: Vec<String>,
}
