//! infergrid-cluster — the top-level cluster orchestrator.
//!
//! Wires discovery, per-node backend handles, health monitoring, cache
//! coordination, and routing into a single `select_node` decision point.
//!
//! # Lifecycle
//!
//! ```text
//! ClusterContext::initialize(config, discovery, backend_factory)
//!   ├── validate config (structured error before any I/O)
//!   ├── discovery.start() → node list
//!   ├── one Backend handle per node (single failures skip the node)
//!   ├── ClusterHealth::start (probe loops)
//!   ├── ClusterCache::initialize (warmup + sync; failure degrades, never fatal)
//!   └── ClusterRouter (strategy + sticky sessions)
//! ```
//!
//! The context replaces a process-wide singleton: callers own it and
//! pass it where needed, and the "currently initializing" guard is an
//! explicit state value rather than ambient global state.

pub mod backend;
pub mod discovery;
pub mod manager;

pub use backend::{Backend, BackendFactory, HttpBackend, HttpBackendFactory, InferenceRequest, InferenceResponse};
pub use discovery::{BoxFuture, NodeDiscovery, StaticDiscovery};
pub use manager::{ClusterContext, ClusterManager};
