//! Kubernetes implementations of the external collaborators

pub mod kube_gateway;
pub mod routes;
pub mod secrets;

pub use kube_gateway::KubeGateway;
pub use routes::IngressRouteDirectory;
pub use secrets::SecretBindingProvider;
