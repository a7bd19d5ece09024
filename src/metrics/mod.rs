//! Prometheus metrics for the workload reconciler
//!
//! Counters and histograms are labelled by operation name
//! (`bind_services`, `set_environment`, `scale`, `restart`, `get`).

pub mod prometheus;

pub use prometheus::*;
