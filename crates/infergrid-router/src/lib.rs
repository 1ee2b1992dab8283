//! infergrid-router — node selection for incoming inference requests.
//!
//! # Components
//!
//! - **`session`** — TTL-keyed session→node pinning with a background
//!   expiry sweep
//! - **`router`** — strategy-dispatching node selector (round-robin,
//!   least-loaded, latency-based, cache-affinity) layered with a
//!   sticky-session override
//!
//! The router is a pure reader: it scores the `RouteNode` views it is
//! handed and never mutates health or cache state.

pub mod router;
pub mod session;

pub use router::ClusterRouter;
pub use session::StickySessionManager;
