//! infergrid-cache — warm prompt cache coordination across the cluster.
//!
//! Tracks which node holds which cached prompt so routing can prefer
//! cache-warm nodes.
//!
//! # Components
//!
//! - **`registry`** — dual-indexed store of per-node cache state
//! - **`warmup`** — concurrency-bounded parallel cache priming
//! - **`sync`** — periodic cache-state polling that refreshes the registry
//! - **`coordinator`** — wires warmup → registry → sync together
//!
//! Cache coordination is best-effort by design: a node that fails warmup
//! or sync is skipped, never fatal. A cluster with zero warm nodes is a
//! degraded-but-valid starting state; routing falls back to non-affinity
//! strategies until sync catches up.

pub mod coordinator;
pub mod http;
pub mod registry;
pub mod sync;
pub mod warmup;

pub use coordinator::ClusterCache;
pub use registry::CacheRegistry;
pub use sync::{CacheSynchronizer, SyncReport};
pub use warmup::{content_hash, CacheWarmup, WarmupResult};
