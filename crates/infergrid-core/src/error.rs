//! Error types for the InferGrid cluster coordinator.
//!
//! Only lifecycle misuse and invalid configuration surface to callers as
//! errors. Per-node check failures and cache subsystem failures are always
//! recovered at the point of occurrence and show up in status snapshots
//! and callbacks instead.

use thiserror::Error;

use crate::types::NodeId;

/// Result type alias for cluster coordination operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Configuration validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be positive")]
    NonPositive(&'static str),

    #[error("{0} is out of range")]
    OutOfRange(&'static str),

    #[error("health.max_backoff_ms must be >= health.initial_backoff_ms")]
    BackoffRange,
}

/// Errors surfaced by the cluster coordinator's entry points.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster is already initialized")]
    AlreadyInitialized,

    #[error("cluster initialization is already in progress")]
    CurrentlyInitializing,

    #[error("invalid cluster configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),

    #[error("cluster initialization failed: {0}")]
    InitializationFailed(String),

    #[error("cluster is not initialized")]
    NotInitialized,

    #[error("unknown node: {0}")]
    UnknownNode(NodeId),

    #[error("health monitoring is already running")]
    HealthMonitorRunning,
}

impl ClusterError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            ClusterError::AlreadyInitialized => "already-initialized",
            ClusterError::CurrentlyInitializing => "currently-initializing",
            ClusterError::InvalidConfiguration(_) => "invalid-configuration",
            ClusterError::InitializationFailed(_) => "initialization-failed",
            ClusterError::NotInitialized => "not-initialized",
            ClusterError::UnknownNode(_) => "unknown-node",
            ClusterError::HealthMonitorRunning => "health-monitor-running",
        }
    }
}
