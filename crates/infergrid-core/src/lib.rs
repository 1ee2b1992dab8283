//! infergrid-core — shared domain types for the InferGrid cluster coordinator.
//!
//! Holds the types that cross crate boundaries: node descriptors and status,
//! health snapshots, cache entries, sticky sessions, routing decisions, the
//! cluster status snapshot, the wire payloads for the cluster-management
//! endpoints, and the validated cluster configuration.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CacheConfig, ClusterConfig, HealthConfig, RoutingConfig};
pub use error::{ClusterError, ClusterResult, ConfigError};
pub use types::*;
