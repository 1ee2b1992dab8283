//! Cluster health monitor — one self-rescheduling probe loop per node.
//!
//! `ClusterHealth` owns a `NodeHealthTracker` per node and drives a
//! background check loop for each. Loops are individually serialized (a
//! node's next check is scheduled only after the previous resolves) but
//! run concurrently across nodes. Real traffic outcomes feed the same
//! trackers through `record_success`/`record_failure`.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use infergrid_core::{
    ClusterError, ClusterResult, HealthConfig, NodeDescriptor, NodeHealthSnapshot, NodeId,
    NodeStatus,
};

use crate::checker::{http_probe, NodeHealthTracker, ProbeError};

/// Path each node must answer health checks on.
const HEALTH_PATH: &str = "/v1/cluster/health";

/// Listener for node status transitions: `(node_id, old, new)`.
pub type StatusChangeListener = Arc<dyn Fn(&str, NodeStatus, NodeStatus) + Send + Sync>;

/// Listener for every completed check: `(node_id, result)`.
pub type CheckListener = Arc<dyn Fn(&str, &Result<f64, ProbeError>) + Send + Sync>;

/// Per-node loop handle.
struct LoopSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Shared tracker map, readable from the loops and the recording API.
type TrackerMap = Arc<RwLock<HashMap<NodeId, NodeHealthTracker>>>;

/// Runs periodic health checks against all nodes and tracks per-node
/// circuit-breaker state.
pub struct ClusterHealth {
    config: HealthConfig,
    trackers: TrackerMap,
    loops: Mutex<HashMap<NodeId, LoopSlot>>,
    running: AtomicBool,
    status_listeners: Arc<RwLock<Vec<StatusChangeListener>>>,
    check_listeners: Arc<RwLock<Vec<CheckListener>>>,
}

impl ClusterHealth {
    /// Create a monitor from the validated health config.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            trackers: Arc::new(RwLock::new(HashMap::new())),
            loops: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            status_listeners: Arc::new(RwLock::new(Vec::new())),
            check_listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a listener for status transitions.
    pub fn on_status_change(&self, listener: StatusChangeListener) {
        self.status_listeners
            .write()
            .expect("status listeners lock")
            .push(listener);
    }

    /// Register a listener invoked after every completed check.
    pub fn on_check(&self, listener: CheckListener) {
        self.check_listeners
            .write()
            .expect("check listeners lock")
            .push(listener);
    }

    /// Start one check loop per node.
    ///
    /// Errors with [`ClusterError::HealthMonitorRunning`] if already started.
    pub fn start(&self, nodes: &[NodeDescriptor]) -> ClusterResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::HealthMonitorRunning);
        }

        {
            let mut trackers = self.trackers.write().expect("trackers lock");
            for node in nodes {
                let tracker = match NodeHealthTracker::new(&self.config) {
                    Ok(t) => t,
                    Err(e) => {
                        self.running.store(false, Ordering::SeqCst);
                        return Err(ClusterError::InvalidConfiguration(e));
                    }
                };
                trackers.insert(node.id.clone(), tracker);
            }
        }

        let mut loops = self.loops.lock().expect("loops lock");
        for node in nodes {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let handle = tokio::spawn(run_check_loop(
                node.id.clone(),
                node.url.clone(),
                self.config.clone(),
                Arc::clone(&self.trackers),
                Arc::clone(&self.status_listeners),
                Arc::clone(&self.check_listeners),
                shutdown_rx,
            ));
            loops.insert(
                node.id.clone(),
                LoopSlot {
                    handle,
                    shutdown_tx,
                },
            );
        }

        info!(nodes = nodes.len(), "cluster health checks started");
        Ok(())
    }

    /// Stop all check loops. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let mut loops = self.loops.lock().expect("loops lock");
        for (node_id, slot) in loops.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%node_id, "health check loop stopped");
        }
    }

    /// Whether check loops are currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Feed a real traffic success into a node's tracker.
    pub fn record_success(&self, node_id: &str, latency_ms: f64) -> ClusterResult<()> {
        let (old, new) = {
            let mut trackers = self.trackers.write().expect("trackers lock");
            let tracker = trackers
                .get_mut(node_id)
                .ok_or_else(|| ClusterError::UnknownNode(node_id.to_string()))?;
            let old = tracker.status();
            let new = tracker.record_success(latency_ms);
            (old, new)
        };
        if old != new {
            dispatch_status_change(&self.status_listeners, node_id, old, new);
        }
        Ok(())
    }

    /// Feed a real traffic failure into a node's tracker.
    pub fn record_failure(&self, node_id: &str, error: &str) -> ClusterResult<()> {
        let (old, new) = {
            let mut trackers = self.trackers.write().expect("trackers lock");
            let tracker = trackers
                .get_mut(node_id)
                .ok_or_else(|| ClusterError::UnknownNode(node_id.to_string()))?;
            let old = tracker.status();
            let new = tracker.record_failure(error);
            (old, new)
        };
        if old != new {
            dispatch_status_change(&self.status_listeners, node_id, old, new);
        }
        Ok(())
    }

    /// Whether a node is currently a routable target.
    pub fn is_healthy(&self, node_id: &str) -> ClusterResult<bool> {
        let trackers = self.trackers.read().expect("trackers lock");
        let tracker = trackers
            .get(node_id)
            .ok_or_else(|| ClusterError::UnknownNode(node_id.to_string()))?;
        Ok(tracker.status().is_eligible())
    }

    /// Health snapshot for one node.
    pub fn node_health(&self, node_id: &str) -> ClusterResult<NodeHealthSnapshot> {
        let trackers = self.trackers.read().expect("trackers lock");
        let tracker = trackers
            .get(node_id)
            .ok_or_else(|| ClusterError::UnknownNode(node_id.to_string()))?;
        Ok(tracker.health_snapshot())
    }

    /// Health snapshots for every tracked node.
    pub fn all_node_health(&self) -> HashMap<NodeId, NodeHealthSnapshot> {
        let trackers = self.trackers.read().expect("trackers lock");
        trackers
            .iter()
            .map(|(id, t)| (id.clone(), t.health_snapshot()))
            .collect()
    }
}

impl Drop for ClusterHealth {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The check loop for a single node.
///
/// Sleeps, probes, records, then sleeps again — the next check is only
/// scheduled after the current one fully resolves, so a slow probe can
/// never overlap the next. Unhealthy/offline nodes use the tracker's
/// backoff-adjusted delay; every other status, including a node still
/// initializing, uses the base interval.
async fn run_check_loop(
    node_id: NodeId,
    url: String,
    config: HealthConfig,
    trackers: TrackerMap,
    status_listeners: Arc<RwLock<Vec<StatusChangeListener>>>,
    check_listeners: Arc<RwLock<Vec<CheckListener>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let timeout = Duration::from_millis(config.timeout_ms);
    let base_interval = Duration::from_millis(config.check_interval_ms);

    debug!(%node_id, %url, "health check loop starting");

    loop {
        let delay = {
            let guard = trackers.read().expect("trackers lock");
            match guard.get(&node_id) {
                Some(tracker) => match tracker.status() {
                    NodeStatus::Unhealthy | NodeStatus::Offline => tracker.next_check_delay(),
                    _ => base_interval,
                },
                // Tracker removed — node no longer monitored.
                None => break,
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                debug!(%node_id, "health check loop shutting down");
                break;
            }
        }

        let result = http_probe(&url, HEALTH_PATH, timeout).await;

        let transition = {
            let mut guard = trackers.write().expect("trackers lock");
            match guard.get_mut(&node_id) {
                Some(tracker) => {
                    let old = tracker.status();
                    let new = match &result {
                        Ok(latency_ms) => tracker.record_success(*latency_ms),
                        Err(e) => tracker.record_failure(&e.to_string()),
                    };
                    (old != new).then_some((old, new))
                }
                None => break,
            }
        };

        if let Some((old, new)) = transition {
            dispatch_status_change(&status_listeners, &node_id, old, new);
        }
        dispatch_check(&check_listeners, &node_id, &result);
    }
}

/// Invoke every status-change listener, each behind its own failure
/// boundary so one broken listener cannot block the rest.
fn dispatch_status_change(
    listeners: &RwLock<Vec<StatusChangeListener>>,
    node_id: &str,
    old: NodeStatus,
    new: NodeStatus,
) {
    let listeners = listeners.read().expect("status listeners lock");
    for listener in listeners.iter() {
        if std::panic::catch_unwind(AssertUnwindSafe(|| listener(node_id, old, new))).is_err() {
            warn!(%node_id, "status-change listener panicked");
        }
    }
}

fn dispatch_check(
    listeners: &RwLock<Vec<CheckListener>>,
    node_id: &str,
    result: &Result<f64, ProbeError>,
) {
    let listeners = listeners.read().expect("check listeners lock");
    for listener in listeners.iter() {
        if std::panic::catch_unwind(AssertUnwindSafe(|| listener(node_id, result))).is_err() {
            warn!(%node_id, "check listener panicked");
        }
    }
}
