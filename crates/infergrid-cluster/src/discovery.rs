//! Node discovery seam.
//!
//! How nodes are found — static list, DNS, an orchestrator API — is not
//! the cluster manager's concern. It consumes this trait and nothing
//! else. `StaticDiscovery` covers fixed fleets and tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use tracing::debug;

use infergrid_core::NodeDescriptor;

/// Boxed future type for trait-object async methods.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Source of the cluster's node list.
pub trait NodeDiscovery: Send + Sync {
    /// Begin discovering nodes.
    fn start(&self) -> BoxFuture<anyhow::Result<()>>;

    /// Stop discovering. Must be safe to call more than once.
    fn stop(&self) -> BoxFuture<()>;

    /// The currently known nodes.
    fn discovered_nodes(&self) -> Vec<NodeDescriptor>;
}

/// Discovery over a fixed node list.
pub struct StaticDiscovery {
    nodes: RwLock<Vec<NodeDescriptor>>,
    started: AtomicBool,
}

impl StaticDiscovery {
    pub fn new(nodes: Vec<NodeDescriptor>) -> Self {
        Self {
            nodes: RwLock::new(nodes),
            started: AtomicBool::new(false),
        }
    }

    /// Replace the node list (e.g. after a config reload).
    pub fn set_nodes(&self, nodes: Vec<NodeDescriptor>) {
        *self.nodes.write().expect("nodes lock") = nodes;
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl NodeDiscovery for StaticDiscovery {
    fn start(&self) -> BoxFuture<anyhow::Result<()>> {
        self.started.store(true, Ordering::SeqCst);
        debug!(
            nodes = self.nodes.read().expect("nodes lock").len(),
            "static discovery started"
        );
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) -> BoxFuture<()> {
        self.started.store(false, Ordering::SeqCst);
        Box::pin(async {})
    }

    fn discovered_nodes(&self) -> Vec<NodeDescriptor> {
        if !self.started.load(Ordering::SeqCst) {
            return Vec::new();
        }
        self.nodes.read().expect("nodes lock").clone()
    }
}
