//! Application workload reconciliation engine
//!
//! Converges a live application Deployment toward caller-declared bound
//! services, environment wiring and replica count, and aggregates its pods and
//! pod metrics into a read-only status view.

pub mod adapters;
pub mod cluster;
pub mod config;
pub mod error;
pub mod metrics;
pub mod models;
pub mod quantity;
pub mod reconcilers;

pub use error::{Error, Result};
