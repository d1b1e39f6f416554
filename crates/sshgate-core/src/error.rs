use thiserror::Error;

/// Errors produced by the gateway core and its backends.
#[derive(Debug, Error)]
pub enum GateError {
    /// The configured backend name is not in the registry.
    #[error("unknown backend: {0}")]
    BackendNotFound(String),

    #[error("session creation failed: {0}")]
    SessionCreationFailed(String),

    /// A lifecycle operation was called out of order.
    #[error("invalid session state: {0}")]
    InvalidState(String),

    #[error("a program has already been launched in this session")]
    AlreadyLaunched,

    #[error("unknown subsystem: {0}")]
    UnknownSubsystem(String),

    #[error("no pseudoterminal was requested for this session")]
    NoPty,

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("invalid remote address: {0}")]
    InvalidAddress(String),

    #[error("metric already exists: {0}")]
    MetricAlreadyExists(String),

    #[error("counter cannot be incremented by a negative number: {0}")]
    CounterNegativeIncrement(String),

    #[error("metrics error: {0}")]
    Metrics(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("json error: {0}")]
    Json(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl GateError {
    /// Lifecycle violations are bugs in the calling gateway and must never be retried.
    pub fn is_lifecycle_violation(&self) -> bool {
        matches!(
            self,
            GateError::InvalidState(_) | GateError::AlreadyLaunched | GateError::NoPty
        )
    }
}

impl From<serde_json::Error> for GateError {
    fn from(e: serde_json::Error) -> Self {
        GateError::Json(e.to_string())
    }
}

impl From<prometheus::Error> for GateError {
    fn from(e: prometheus::Error) -> Self {
        GateError::Metrics(e.to_string())
    }
}

pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_violations() {
        assert!(GateError::NoPty.is_lifecycle_violation());
        assert!(GateError::AlreadyLaunched.is_lifecycle_violation());
        assert!(GateError::InvalidState("launched".into()).is_lifecycle_violation());
        assert!(!GateError::BackendFailure("rejected".into()).is_lifecycle_violation());
        assert!(!GateError::BackendNotFound("docker".into()).is_lifecycle_violation());
    }

    #[test]
    fn backend_not_found_names_backend() {
        let err = GateError::BackendNotFound("kuberun".into());
        assert_eq!(err.to_string(), "unknown backend: kuberun");
    }
}
