//! Periodic cache-state synchronization.
//!
//! Polls every node's cache endpoint on a self-rescheduling loop and
//! refreshes the registry. Individual node failures are skipped, their
//! errors collected into the sweep report; a sweep never aborts because
//! one node is down.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use infergrid_core::{epoch_millis, CacheEntry, CacheStateResponse, NodeDescriptor, NodeId};

use crate::http::get_json;
use crate::registry::CacheRegistry;

/// Path each node must report its cache state on.
const CACHE_PATH: &str = "/v1/cluster/cache";

/// Summary of one completed sync sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Nodes whose registry entry was refreshed.
    pub synced: usize,
    /// Nodes that failed, with the error text.
    pub failed: Vec<(NodeId, String)>,
    /// Stale entries expired after the sweep.
    pub expired: usize,
}

/// Listener invoked after every completed sweep.
pub type SyncListener = Arc<dyn Fn(&SyncReport) + Send + Sync>;

struct LoopSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Keeps the cache registry fresh by polling node cache state.
pub struct CacheSynchronizer {
    registry: Arc<CacheRegistry>,
    timeout: Duration,
    max_cache_age_secs: u64,
    running: AtomicBool,
    /// Belt-and-braces overlap guard shared with the loop task.
    in_progress: Arc<AtomicBool>,
    slot: Mutex<Option<LoopSlot>>,
    listeners: Arc<RwLock<Vec<SyncListener>>>,
}

impl CacheSynchronizer {
    pub fn new(registry: Arc<CacheRegistry>, timeout: Duration, max_cache_age_secs: u64) -> Self {
        Self {
            registry,
            timeout,
            max_cache_age_secs,
            running: AtomicBool::new(false),
            in_progress: Arc::new(AtomicBool::new(false)),
            slot: Mutex::new(None),
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a listener for sweep reports.
    pub fn on_sweep(&self, listener: SyncListener) {
        self.listeners.write().expect("sync listeners lock").push(listener);
    }

    /// Start the sync loop over the given nodes. No-op if already running.
    pub fn start(&self, nodes: Vec<NodeDescriptor>, interval: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let in_progress = Arc::clone(&self.in_progress);
        let listeners = Arc::clone(&self.listeners);
        let timeout = self.timeout;
        let max_age = self.max_cache_age_secs;

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }

                // The loop itself never overlaps; the flag makes that
                // robust even under reentrant scheduling.
                if in_progress.swap(true, Ordering::SeqCst) {
                    debug!("cache sync still in progress, skipping sweep");
                    continue;
                }
                let report = sweep(&nodes, &registry, timeout, max_age).await;
                in_progress.store(false, Ordering::SeqCst);

                dispatch(&listeners, &report);
            }
        });

        let mut slot = self.slot.lock().expect("sync slot lock");
        *slot = Some(LoopSlot {
            handle,
            shutdown_tx,
        });
        debug!(interval_ms = interval.as_millis() as u64, "cache synchronizer started");
    }

    /// Stop the sync loop. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut slot = self.slot.lock().expect("sync slot lock");
        if let Some(slot) = slot.take() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!("cache synchronizer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run one sweep immediately (used by tests and manual refresh).
    pub async fn sync_once(&self, nodes: &[NodeDescriptor]) -> SyncReport {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            return SyncReport {
                synced: 0,
                failed: Vec::new(),
                expired: 0,
            };
        }
        let report = sweep(nodes, &self.registry, self.timeout, self.max_cache_age_secs).await;
        self.in_progress.store(false, Ordering::SeqCst);
        dispatch(&self.listeners, &report);
        report
    }
}

impl Drop for CacheSynchronizer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Poll every node in parallel and refresh the registry. Failed nodes
/// are skipped; their errors go into the report.
async fn sweep(
    nodes: &[NodeDescriptor],
    registry: &CacheRegistry,
    timeout: Duration,
    max_age_secs: u64,
) -> SyncReport {
    let mut set = JoinSet::new();
    for node in nodes {
        let node = node.clone();
        set.spawn(async move {
            let result: Result<CacheStateResponse, _> =
                get_json(&node.url, CACHE_PATH, timeout).await;
            (node, result)
        });
    }

    let mut synced = 0;
    let mut failed = Vec::new();
    while let Some(joined) = set.join_next().await {
        let Ok((node, result)) = joined else {
            continue;
        };
        match result {
            Ok(state) => {
                registry.set(CacheEntry {
                    node_id: node.id,
                    node_url: node.url,
                    content_hash: state.system_prompt_hash,
                    token_count: state.tokens,
                    last_updated_ms: epoch_millis(),
                    hit_rate: state.hit_rate,
                });
                synced += 1;
            }
            Err(e) => {
                debug!(node_id = %node.id, error = %e, "cache sync failed for node");
                failed.push((node.id, e.to_string()));
            }
        }
    }

    let expired = registry.expire_stale(max_age_secs);
    debug!(synced, failed = failed.len(), expired, "cache sync sweep complete");
    SyncReport {
        synced,
        failed,
        expired,
    }
}

fn dispatch(listeners: &RwLock<Vec<SyncListener>>, report: &SyncReport) {
    let listeners = listeners.read().expect("sync listeners lock");
    for listener in listeners.iter() {
        if std::panic::catch_unwind(AssertUnwindSafe(|| listener(report))).is_err() {
            warn!("sync listener panicked");
        }
    }
}
