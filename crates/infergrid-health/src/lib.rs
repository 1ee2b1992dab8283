//! infergrid-health — health monitoring for InferGrid inference nodes.
//!
//! Provides rolling-window success/latency metrics, a per-node circuit
//! breaker with exponential backoff, and a cluster-wide monitor that runs
//! one self-rescheduling probe loop per node.
//!
//! # Architecture
//!
//! ```text
//! ClusterHealth
//!   ├── Per-node background probe loop
//!   │   ├── NodeHealthTracker (circuit breaker, backoff)
//!   │   │   └── RollingWindowMetrics (time-windowed samples)
//!   │   └── http_probe() → latency | ProbeError
//!   └── Status-change / per-check listener registry
//! ```
//!
//! Probe loops never use fixed-rate timers: the next check for a node is
//! scheduled only after the previous one resolves, so a slow check cannot
//! overlap the next. Unhealthy and offline nodes are probed on the
//! tracker's backoff-adjusted delay instead of the base interval, and a
//! jitter of up to 25% keeps probes from synchronizing across nodes.
//!
//! Callers feed real traffic outcomes into the same trackers through
//! `record_success`/`record_failure`, closing the feedback loop between
//! routing and health.

pub mod checker;
pub mod metrics;
pub mod monitor;

pub use checker::{http_probe, NodeHealthTracker, ProbeError};
pub use metrics::{RollingWindowMetrics, WindowMetrics};
pub use monitor::ClusterHealth;
