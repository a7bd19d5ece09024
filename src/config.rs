//! Reconciler configuration: retry policy and naming conventions

use std::time::Duration;

use crate::{Error, Result};

/// Annotation bumped on the pod template to force a rolling restart
pub const RESTART_ANNOTATION: &str = "workload.paas.dev/restart";
/// Pod template label carrying the username of the application creator
pub const CREATED_BY_LABEL: &str = "app.kubernetes.io/created-by";
/// Pod template label carrying the staging run that produced the image
pub const STAGE_ID_LABEL: &str = "workload.paas.dev/stage-id";
/// Directory under which bound services are mounted
pub const SERVICE_MOUNT_ROOT: &str = "/services";
/// Suffix of the per-application environment secret
pub const ENV_SECRET_SUFFIX: &str = "env";

const ENV_RETRY_STEPS: &str = "WORKLOAD_RETRY_STEPS";
const ENV_RETRY_INITIAL_MS: &str = "WORKLOAD_RETRY_INITIAL_MS";
const ENV_RETRY_FACTOR: &str = "WORKLOAD_RETRY_FACTOR";
const ENV_RETRY_MAX_MS: &str = "WORKLOAD_RETRY_MAX_MS";

/// Bounded exponential backoff applied to conflicting writes
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub steps: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after every attempt
    pub factor: f64,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: 5,
            initial_delay: Duration::from_millis(10),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (zero-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled)
    }

    pub fn validate(&self) -> Result<()> {
        if self.steps == 0 {
            return Err(Error::ConfigError("retry steps must be >= 1".to_string()));
        }
        if !(self.factor.is_finite() && self.factor >= 1.0) {
            return Err(Error::ConfigError(format!(
                "retry factor must be a finite number >= 1.0, got {}",
                self.factor
            )));
        }
        Ok(())
    }
}

/// Configuration shared by all workload operations
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcilerConfig {
    pub retry: RetryPolicy,
}

impl ReconcilerConfig {
    /// Build a configuration from defaults overridden by `WORKLOAD_RETRY_*`
    /// environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut retry = RetryPolicy::default();

        if let Some(v) = lookup(ENV_RETRY_STEPS) {
            retry.steps = parse_var(ENV_RETRY_STEPS, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_INITIAL_MS) {
            retry.initial_delay = Duration::from_millis(parse_var(ENV_RETRY_INITIAL_MS, &v)?);
        }
        if let Some(v) = lookup(ENV_RETRY_FACTOR) {
            retry.factor = parse_var(ENV_RETRY_FACTOR, &v)?;
        }
        if let Some(v) = lookup(ENV_RETRY_MAX_MS) {
            retry.max_delay = Duration::from_millis(parse_var(ENV_RETRY_MAX_MS, &v)?);
        }

        retry.validate()?;
        Ok(Self { retry })
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| Error::ConfigError(format!("{} has invalid value '{}': {}", key, value, e)))
}
