//! Sticky sessions — TTL-bound pinning of session ids to nodes.
//!
//! A session pins a multi-turn interaction to one node so its warm
//! prompt cache stays local. Sessions are refreshed on every route
//! decision and removed by a background sweep once past their TTL.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use infergrid_core::{epoch_millis, ConfigError, NodeId, SessionId, StickySession};

/// Interval between expiry sweeps. Each sweep's successor is scheduled
/// only after the sweep finishes.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Listener invoked with every expired or removed session.
pub type ExpiryListener = Arc<dyn Fn(&StickySession) + Send + Sync>;

type SessionMap = Arc<RwLock<HashMap<SessionId, StickySession>>>;

struct SweepSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// TTL-keyed session→node map with background expiry.
pub struct StickySessionManager {
    ttl_ms: u64,
    sessions: SessionMap,
    listeners: Arc<RwLock<Vec<ExpiryListener>>>,
    sweep: Mutex<Option<SweepSlot>>,
}

impl StickySessionManager {
    /// Create a manager and start its expiry sweep.
    /// Rejects a non-positive TTL.
    pub fn new(ttl_ms: u64) -> Result<Self, ConfigError> {
        if ttl_ms == 0 {
            return Err(ConfigError::NonPositive("session_ttl_ms"));
        }

        let sessions: SessionMap = Arc::new(RwLock::new(HashMap::new()));
        let listeners: Arc<RwLock<Vec<ExpiryListener>>> = Arc::new(RwLock::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let sweep_sessions = Arc::clone(&sessions);
        let sweep_listeners = Arc::clone(&listeners);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
                    _ = shutdown_rx.changed() => break,
                }
                sweep_expired(&sweep_sessions, &sweep_listeners);
            }
        });

        Ok(Self {
            ttl_ms,
            sessions,
            listeners,
            sweep: Mutex::new(Some(SweepSlot {
                handle,
                shutdown_tx,
            })),
        })
    }

    /// Register a listener for expired/removed sessions.
    pub fn on_expiry(&self, listener: ExpiryListener) {
        self.listeners.write().expect("expiry listeners lock").push(listener);
    }

    /// Pin (or refresh) a session to a node.
    pub fn create_session(&self, session_id: &str, node_id: &str) {
        let now = epoch_millis();
        let session = StickySession {
            session_id: session_id.to_string(),
            node_id: node_id.to_string(),
            created_at_ms: now,
            expires_at_ms: now + self.ttl_ms,
        };
        self.sessions
            .write()
            .expect("sessions lock")
            .insert(session_id.to_string(), session);
    }

    /// The node pinned for a session, or `None` if absent or expired.
    /// Expiry is checked lazily; reads never mutate the map.
    pub fn get_session(&self, session_id: &str) -> Option<NodeId> {
        let sessions = self.sessions.read().expect("sessions lock");
        sessions.get(session_id).and_then(|s| {
            if epoch_millis() < s.expires_at_ms {
                Some(s.node_id.clone())
            } else {
                None
            }
        })
    }

    /// Remove a session explicitly, firing the expiry listener.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = self
            .sessions
            .write()
            .expect("sessions lock")
            .remove(session_id);
        match removed {
            Some(session) => {
                dispatch_expiry(&self.listeners, &session);
                true
            }
            None => false,
        }
    }

    /// Number of live (non-expired) sessions.
    pub fn active_session_count(&self) -> usize {
        let now = epoch_millis();
        let sessions = self.sessions.read().expect("sessions lock");
        sessions.values().filter(|s| now < s.expires_at_ms).count()
    }

    /// Halt the background sweep. Idempotent; must be called on teardown.
    pub fn stop_cleanup(&self) {
        let mut sweep = self.sweep.lock().expect("sweep slot lock");
        if let Some(slot) = sweep.take() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!("session expiry sweep stopped");
        }
    }
}

impl Drop for StickySessionManager {
    fn drop(&mut self) {
        self.stop_cleanup();
    }
}

/// Remove every expired session and fire the expiry listener for each.
fn sweep_expired(sessions: &SessionMap, listeners: &Arc<RwLock<Vec<ExpiryListener>>>) {
    let now = epoch_millis();
    let expired: Vec<StickySession> = {
        let mut map = sessions.write().expect("sessions lock");
        let ids: Vec<SessionId> = map
            .iter()
            .filter(|(_, s)| now >= s.expires_at_ms)
            .map(|(id, _)| id.clone())
            .collect();
        ids.iter().filter_map(|id| map.remove(id)).collect()
    };

    for session in &expired {
        debug!(session_id = %session.session_id, node_id = %session.node_id, "session expired");
        dispatch_expiry(listeners, session);
    }
}

fn dispatch_expiry(listeners: &Arc<RwLock<Vec<ExpiryListener>>>, session: &StickySession) {
    let listeners = listeners.read().expect("expiry listeners lock");
    for listener in listeners.iter() {
        if std::panic::catch_unwind(AssertUnwindSafe(|| listener(session))).is_err() {
            warn!(session_id = %session.session_id, "expiry listener panicked");
        }
    }
}
