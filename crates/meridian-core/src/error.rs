//! Per-subsystem error taxonomies.
//!
//! Each component converts downstream failures into its own enum at its
//! public boundary rather than leaking `meridian_storage::StoreError` or
//! runtime-specific detail upward. `meridian-server` is the only place these
//! get mapped to HTTP status codes.

use meridian_storage::StoreError;

/// Errors from the Cluster Coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("lost leadership: {0}")]
    LostLeadership(String),

    #[error("invalid coordinator state: {0}")]
    Invalid(String),
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { reason } => Self::StoreUnavailable(reason),
            other => Self::Invalid(other.to_string()),
        }
    }
}

/// Errors from the Runtime Adapter.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("runtime unavailable: {0}")]
    Unavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid: {0}")]
    Invalid(String),
}

/// Errors from the Health Supervisor.
#[derive(Debug, thiserror::Error)]
pub enum HealthError {
    #[error("probe timed out")]
    Timeout,

    #[error("connection refused")]
    ConnectionRefused,

    #[error("dns resolution failed: {0}")]
    Dns(String),

    #[error("unexpected status code: {0}")]
    StatusMismatch(u16),

    #[error("response content did not match")]
    ContentMismatch,

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl From<StoreError> for HealthError {
    fn from(err: StoreError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

/// The cause a failed probe or a runtime report is attributed to, used to
/// pick a strategy from the App Manager's failure table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    HealthCheckFailed,
    HealthCheckTimeout,
    HighResponseLatency,
    HighResourceUsage,
    ContainerStopped,
    OomKilled,
    NetworkUnreachable,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::HealthCheckFailed => "health_check_failed",
            Self::HealthCheckTimeout => "health_check_timeout",
            Self::HighResponseLatency => "high_response_latency",
            Self::HighResourceUsage => "high_resource_usage",
            Self::ContainerStopped => "container_stopped",
            Self::OomKilled => "oom_killed",
            Self::NetworkUnreachable => "network_unreachable",
        })
    }
}

/// Errors from the App Manager (reconciler).
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("proxy unavailable: {0}")]
    ProxyUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid: {0}")]
    Invalid(String),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable { reason } => Self::StoreUnavailable(reason),
            StoreError::Conflict { reason } => Self::Conflict(reason),
            StoreError::NotFound { what } => Self::NotFound(what),
            StoreError::Invalid { reason } => Self::Invalid(reason),
        }
    }
}

impl From<RuntimeError> for ReconcileError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(reason) => Self::RuntimeUnavailable(reason),
            RuntimeError::NotFound(what) => Self::NotFound(what),
            RuntimeError::ResourceExhausted(reason) | RuntimeError::Invalid(reason) => {
                Self::Invalid(reason)
            }
        }
    }
}

impl From<ProxyError> for ReconcileError {
    fn from(err: ProxyError) -> Self {
        Self::ProxyUnavailable(err.to_string())
    }
}

/// Errors from the Proxy Manager.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("config test failed: {0}")]
    ConfigTestFailed(String),

    #[error("reload failed: {0}")]
    ReloadFailed(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
