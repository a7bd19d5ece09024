//! Error types for the workload reconciler

/// Result type for the reconciler
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the reconciler
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Workload object (or another addressed object) is absent from the store
    #[error("Not found: {0}")]
    NotFound(String),
    /// Stored object changed since it was read
    #[error("Conflict: {0}")]
    Conflict(String),
    /// Service binding or route lookup failed
    #[error("Resolution error: {0}")]
    ResolutionError(String),
    /// Pod metrics could not be listed
    #[error("Metrics unavailable: {0}")]
    MetricsUnavailable(String),
    /// Memory usage is not an exact integer byte count
    #[error("Conversion error: {0}")]
    ConversionError(String),
    /// Resource quantity string could not be parsed
    #[error("Invalid quantity '{0}'")]
    QuantityError(String),
    /// Pod template has no primary container
    #[error("Workload {0} has no primary container")]
    MissingPrimaryContainer(String),
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(String),
    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),
    /// Operation was cancelled before completing
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Classify a kube client error, attaching `context` to the message
    pub fn from_kube(context: impl std::fmt::Display, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(response) if response.code == 404 => {
                Error::NotFound(format!("{}: {}", context, response.message))
            }
            kube::Error::Api(response) if response.code == 409 => {
                Error::Conflict(format!("{}: {}", context, response.message))
            }
            _ => Error::KubeError(format!("{}: {}", context, err)),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Whether this error must abort a status computation instead of being
    /// folded into the status text
    pub fn is_fatal_for_status(&self) -> bool {
        matches!(self, Error::ConversionError(_) | Error::QuantityError(_))
    }
}
