//! Workload reconciliation: converging a live workload object toward the
//! declared bindings, environment and replica count, and reading back its status

pub mod projection;
pub mod retry;
pub mod status;
pub mod workload;

use std::sync::Arc;

use crate::cluster::{ClusterGateway, RouteDirectory, ServiceBindingProvider};
use crate::config::ReconcilerConfig;

pub use status::StatusAggregator;
pub use workload::Workload;

/// Shared collaborators for workload operations
pub struct Context {
    /// Workload object store
    pub gateway: Arc<dyn ClusterGateway>,
    /// Resolves services into binding secrets
    pub bindings: Arc<dyn ServiceBindingProvider>,
    /// Lists application routes
    pub routes: Arc<dyn RouteDirectory>,
    pub config: ReconcilerConfig,
}

impl Context {
    /// Create a new context
    pub fn new(
        gateway: Arc<dyn ClusterGateway>,
        bindings: Arc<dyn ServiceBindingProvider>,
        routes: Arc<dyn RouteDirectory>,
        config: ReconcilerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            bindings,
            routes,
            config,
        })
    }
}
