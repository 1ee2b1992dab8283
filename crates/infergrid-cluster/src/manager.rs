//! Cluster manager and initialization lifecycle.
//!
//! `ClusterContext` owns the initialize/reset lifecycle with an explicit
//! state value guarding concurrent initialization. `ClusterManager` is
//! the assembled cluster: discovery results, one backend handle per
//! node, health monitoring, cache coordination, and routing behind a
//! single `select_node` decision point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use infergrid_cache::ClusterCache;
use infergrid_core::{
    ClusterConfig, ClusterError, ClusterResult, ClusterStatus, NodeCacheView, NodeDescriptor,
    NodeHealthSnapshot, NodeId, NodeStatus, NodeStatusSummary, RouteNode, RoutingContext,
};
use infergrid_health::ClusterHealth;
use infergrid_router::ClusterRouter;

use crate::backend::{Backend, BackendFactory};
use crate::discovery::NodeDiscovery;

/// Initialization lifecycle of a [`ClusterContext`].
enum InitState {
    Idle,
    Initializing,
    Ready(Arc<ClusterManager>),
}

/// Owns the cluster's initialize/reset lifecycle.
///
/// Callers construct one context, initialize it once, and pass it (or
/// the manager it yields) to whatever needs routing decisions. The
/// "currently initializing" guard is part of the state machine, so a
/// second caller racing into `initialize` gets a structured error
/// instead of a half-built cluster.
pub struct ClusterContext {
    state: Mutex<InitState>,
}

impl ClusterContext {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InitState::Idle),
        }
    }

    /// Build and start the cluster.
    ///
    /// Fails with a structured error if already initialized, if another
    /// initialization is in progress, or if the config is invalid — all
    /// checked before any network activity. A hard failure during the
    /// startup sequence tears down whatever was already started.
    pub async fn initialize(
        &self,
        config: ClusterConfig,
        discovery: Arc<dyn NodeDiscovery>,
        backend_factory: Arc<dyn BackendFactory>,
    ) -> ClusterResult<Arc<ClusterManager>> {
        {
            let mut state = self.state.lock().await;
            match &*state {
                InitState::Ready(_) => return Err(ClusterError::AlreadyInitialized),
                InitState::Initializing => return Err(ClusterError::CurrentlyInitializing),
                InitState::Idle => {}
            }
            config.validate()?;
            *state = InitState::Initializing;
        }

        let result = ClusterManager::start(config, discovery, backend_factory).await;

        let mut state = self.state.lock().await;
        let manager = match result {
            Ok(manager) => manager,
            Err(e) => {
                if matches!(&*state, InitState::Initializing) {
                    *state = InitState::Idle;
                }
                return Err(e);
            }
        };

        // A reset that raced this initialization has already put the
        // state back to Idle; honor it by tearing down what was built.
        if !matches!(&*state, InitState::Initializing) {
            drop(state);
            manager.shutdown().await;
            return Err(ClusterError::InitializationFailed(
                "reset during initialization".to_string(),
            ));
        }

        let manager = Arc::new(manager);
        *state = InitState::Ready(Arc::clone(&manager));
        Ok(manager)
    }

    /// The initialized manager, or [`ClusterError::NotInitialized`].
    pub async fn manager(&self) -> ClusterResult<Arc<ClusterManager>> {
        match &*self.state.lock().await {
            InitState::Ready(manager) => Ok(Arc::clone(manager)),
            _ => Err(ClusterError::NotInitialized),
        }
    }

    /// Tear the cluster down and return to idle. Idempotent; safe to
    /// call even if `initialize` never ran or failed. A reset issued
    /// while an initialization is in flight wins: the initialization
    /// tears down what it built and reports a structured failure.
    pub async fn reset(&self) {
        let previous = {
            let mut state = self.state.lock().await;
            std::mem::replace(&mut *state, InitState::Idle)
        };
        if let InitState::Ready(manager) = previous {
            manager.shutdown().await;
        }
    }
}

impl Default for ClusterContext {
    fn default() -> Self {
        Self::new()
    }
}

/// The assembled cluster.
pub struct ClusterManager {
    discovery: Arc<dyn NodeDiscovery>,
    backends: RwLock<HashMap<NodeId, Arc<dyn Backend>>>,
    health: Arc<ClusterHealth>,
    cache: Arc<ClusterCache>,
    router: ClusterRouter,
    /// Requests currently in flight per node. Incremented at selection,
    /// decremented when the outcome is recorded.
    in_flight: RwLock<HashMap<NodeId, Arc<AtomicU64>>>,
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("nodes", &self.discovery.discovered_nodes().len())
            .finish_non_exhaustive()
    }
}

impl ClusterManager {
    /// Run the startup sequence. Rolls back on any hard failure.
    async fn start(
        config: ClusterConfig,
        discovery: Arc<dyn NodeDiscovery>,
        backend_factory: Arc<dyn BackendFactory>,
    ) -> ClusterResult<Self> {
        if let Err(e) = discovery.start().await {
            return Err(ClusterError::InitializationFailed(format!(
                "discovery failed to start: {e}"
            )));
        }
        let nodes = discovery.discovered_nodes();
        info!(nodes = nodes.len(), "cluster discovery started");

        // One backend handle per node. A failure creating a single
        // handle skips that node, it is not fatal.
        let mut backends: HashMap<NodeId, Arc<dyn Backend>> = HashMap::new();
        let mut in_flight: HashMap<NodeId, Arc<AtomicU64>> = HashMap::new();
        for node in &nodes {
            match backend_factory.create(node) {
                Ok(backend) => {
                    backends.insert(node.id.clone(), backend);
                    in_flight.insert(node.id.clone(), Arc::new(AtomicU64::new(0)));
                }
                Err(e) => {
                    error!(node_id = %node.id, error = %e, "failed to create backend, skipping node");
                }
            }
        }

        let health = Arc::new(ClusterHealth::new(config.health.clone()));
        if let Err(e) = health.start(&nodes) {
            discovery.stop().await;
            return Err(ClusterError::InitializationFailed(format!(
                "health monitoring failed to start: {e}"
            )));
        }

        // Cache coordination is best-effort: the cluster runs without
        // cache affinity if warmup and sync cannot reach any node.
        let cache = Arc::new(ClusterCache::new(config.cache.clone()));
        let warmed = cache
            .initialize(&nodes)
            .await
            .iter()
            .filter(|r| r.success)
            .count();
        if warmed == 0 && !nodes.is_empty() {
            warn!("no nodes warmed, starting without cache affinity");
        }

        let router = match ClusterRouter::new(&config.routing) {
            Ok(router) => router,
            Err(e) => {
                health.stop();
                cache.stop();
                discovery.stop().await;
                return Err(ClusterError::InvalidConfiguration(e));
            }
        };

        info!(
            nodes = nodes.len(),
            backends = backends.len(),
            warmed,
            "cluster manager initialized"
        );

        Ok(Self {
            discovery,
            backends: RwLock::new(backends),
            health,
            cache,
            router,
            in_flight: RwLock::new(in_flight),
        })
    }

    /// Pick a node for a request.
    ///
    /// Considers only nodes that discovery currently reports healthy,
    /// that the health monitor currently tracks as routable, and that
    /// hold a backend handle — a selected node is always invokable
    /// through `node_provider`. Returns `None` when no node qualifies —
    /// reacting to that (retry, queue, reject) is the caller's
    /// decision; this never errors.
    pub fn select_node(
        &self,
        system_prompt_hash: Option<&str>,
        tools_hash: Option<&str>,
        session_id: Option<&str>,
    ) -> Option<NodeDescriptor> {
        let nodes = self.discovery.discovered_nodes();
        let candidates: Vec<RouteNode> = {
            let backends = self.backends.read().expect("backends lock");
            nodes
                .iter()
                .filter(|n| {
                    n.status == NodeStatus::Healthy
                        && backends.contains_key(&n.id)
                        && self.health.is_healthy(&n.id).unwrap_or(false)
                })
                .map(|n| self.route_view(n))
                .collect()
        };

        let context = RoutingContext {
            system_prompt_hash: system_prompt_hash.map(str::to_string),
            tools_hash: tools_hash.map(str::to_string),
        };

        let decision = match session_id {
            Some(sid) => self.router.select_node_with_sticky(&candidates, &context, sid),
            None => self.router.select_node(&candidates, &context),
        }?;

        let selected = nodes.into_iter().find(|n| n.id == decision.node_id)?;
        if let Some(counter) = self.in_flight.read().expect("in-flight lock").get(&selected.id) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
        debug!(node_id = %selected.id, confidence = decision.confidence, "node selected");
        Some(selected)
    }

    /// Report a completed request so health tracking sees real traffic.
    pub fn record_node_success(&self, node_id: &str, latency_ms: f64) -> ClusterResult<()> {
        self.decrement_in_flight(node_id);
        self.health.record_success(node_id, latency_ms)
    }

    /// Report a failed request.
    pub fn record_node_failure(&self, node_id: &str, error: &str) -> ClusterResult<()> {
        self.decrement_in_flight(node_id);
        self.health.record_failure(node_id, error)
    }

    /// The backend handle for a node, if one was created.
    pub fn node_provider(&self, node_id: &str) -> Option<Arc<dyn Backend>> {
        self.backends.read().expect("backends lock").get(node_id).cloned()
    }

    /// Read-only snapshot combining discovery, health, and cache state.
    ///
    /// A node whose health lookup fails is reported with default values
    /// rather than failing the whole snapshot.
    pub fn status(&self) -> ClusterStatus {
        let nodes = self.discovery.discovered_nodes();
        let in_flight = self.in_flight.read().expect("in-flight lock");

        let summaries: Vec<NodeStatusSummary> = nodes
            .iter()
            .map(|n| NodeStatusSummary {
                id: n.id.clone(),
                url: n.url.clone(),
                health: self
                    .health
                    .node_health(&n.id)
                    .unwrap_or_else(|_| NodeHealthSnapshot::default()),
                in_flight: in_flight
                    .get(&n.id)
                    .map(|c| c.load(Ordering::Relaxed))
                    .unwrap_or(0),
            })
            .collect();

        let healthy_count = summaries
            .iter()
            .filter(|s| s.health.status.is_eligible())
            .count();

        ClusterStatus {
            node_count: nodes.len(),
            healthy_count,
            nodes: summaries,
            cache: Some(self.cache.stats()),
        }
    }

    /// Direct access to the health monitor (listener registration).
    pub fn health(&self) -> &ClusterHealth {
        &self.health
    }

    /// Direct access to the cluster cache.
    pub fn cache(&self) -> &ClusterCache {
        &self.cache
    }

    /// Direct access to the router (session management).
    pub fn router(&self) -> &ClusterRouter {
        &self.router
    }

    /// Stop everything: discovery, health, cache, router, then release
    /// the backend handles. Each step is isolated; safe to call more
    /// than once.
    pub async fn shutdown(&self) {
        self.discovery.stop().await;
        self.health.stop();
        self.cache.stop();
        self.router.destroy();
        self.backends.write().expect("backends lock").clear();
        self.in_flight.write().expect("in-flight lock").clear();
        info!("cluster manager shut down");
    }

    fn route_view(&self, node: &NodeDescriptor) -> RouteNode {
        let health = self
            .health
            .node_health(&node.id)
            .unwrap_or_else(|_| NodeHealthSnapshot::default());
        let cache = self.cache_view(&node.id);
        let in_flight = self
            .in_flight
            .read()
            .expect("in-flight lock")
            .get(&node.id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0);

        // An empty window reads as a 0.0 success rate; that would look
        // like a 100% error rate to the scorer, so treat no data as no
        // errors instead.
        let error_rate = if health.sample_count == 0 {
            0.0
        } else {
            1.0 - health.success_rate
        };

        RouteNode {
            id: node.id.clone(),
            url: node.url.clone(),
            status: health.status,
            avg_latency_ms: health.avg_latency_ms,
            error_rate,
            in_flight,
            cache,
        }
    }

    fn cache_view(&self, node_id: &str) -> Option<NodeCacheView> {
        self.cache
            .entries()
            .into_iter()
            .find(|e| e.node_id == node_id)
            .map(|e| NodeCacheView {
                content_hash: e.content_hash,
                tools_hash: None,
                last_updated_ms: e.last_updated_ms,
            })
    }

    fn decrement_in_flight(&self, node_id: &str) {
        if let Some(counter) = self.in_flight.read().expect("in-flight lock").get(node_id) {
            // Saturating: a success reported without a matching selection
            // must not wrap the counter.
            let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                v.checked_sub(1)
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InferenceRequest, InferenceResponse};
    use crate::discovery::{BoxFuture, StaticDiscovery};
    use infergrid_core::{CacheConfig, HealthConfig, RoutingConfig};
    use infergrid_core::RoutingStrategy;

    struct StubBackend {
        node_id: String,
    }

    impl Backend for StubBackend {
        fn node_id(&self) -> &str {
            &self.node_id
        }

        fn invoke(&self, _request: InferenceRequest) -> BoxFuture<anyhow::Result<InferenceResponse>> {
            let node_id = self.node_id.clone();
            Box::pin(async move {
                Ok(InferenceResponse {
                    body: serde_json::json!({"node": node_id}),
                    latency_ms: 1.0,
                })
            })
        }
    }

    struct StubFactory {
        /// Node ids the factory refuses to build handles for.
        fail_for: Vec<String>,
    }

    impl BackendFactory for StubFactory {
        fn create(&self, node: &NodeDescriptor) -> anyhow::Result<Arc<dyn Backend>> {
            if self.fail_for.contains(&node.id) {
                anyhow::bail!("no credentials for {}", node.id);
            }
            Ok(Arc::new(StubBackend {
                node_id: node.id.clone(),
            }))
        }
    }

    fn test_config() -> ClusterConfig {
        ClusterConfig {
            health: HealthConfig {
                check_interval_ms: 60_000,
                timeout_ms: 200,
                initial_backoff_ms: 60_000,
                max_backoff_ms: 120_000,
                ..HealthConfig::default()
            },
            cache: CacheConfig {
                warmup_concurrency: 2,
                warmup_timeout_ms: 200,
                sync_interval_ms: 60_000,
                system_prompt: "prompt".to_string(),
                ..CacheConfig::default()
            },
            routing: RoutingConfig {
                strategy: RoutingStrategy::RoundRobin,
                ..RoutingConfig::default()
            },
        }
    }

    fn node(id: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: id.to_string(),
            url: "http://127.0.0.1:1".to_string(),
            status: NodeStatus::Healthy,
        }
    }

    async fn ready_manager(nodes: Vec<NodeDescriptor>) -> (ClusterContext, Arc<ClusterManager>) {
        let context = ClusterContext::new();
        let manager = context
            .initialize(
                test_config(),
                Arc::new(StaticDiscovery::new(nodes)),
                Arc::new(StubFactory { fail_for: vec![] }),
            )
            .await
            .unwrap();
        (context, manager)
    }

    #[tokio::test]
    async fn select_node_none_until_traffic_confirms_health() {
        let (context, manager) = ready_manager(vec![node("n1")]).await;

        // Trackers still initializing: nothing routable yet.
        assert!(manager.select_node(None, None, None).is_none());

        manager.record_node_success("n1", 12.0).unwrap();
        let selected = manager.select_node(None, None, None).unwrap();
        assert_eq!(selected.id, "n1");
        context.reset().await;
    }

    #[tokio::test]
    async fn in_flight_counts_selection_and_completion() {
        let (context, manager) = ready_manager(vec![node("n1")]).await;
        manager.record_node_success("n1", 10.0).unwrap();

        manager.select_node(None, None, None).unwrap();
        manager.select_node(None, None, None).unwrap();
        let status = manager.status();
        assert_eq!(status.nodes[0].in_flight, 2);

        manager.record_node_success("n1", 10.0).unwrap();
        let status = manager.status();
        assert_eq!(status.nodes[0].in_flight, 1);

        // Extra completions saturate at zero.
        manager.record_node_success("n1", 10.0).unwrap();
        manager.record_node_success("n1", 10.0).unwrap();
        assert_eq!(manager.status().nodes[0].in_flight, 0);
        context.reset().await;
    }

    #[tokio::test]
    async fn failed_backend_creation_skips_node() {
        let context = ClusterContext::new();
        let manager = context
            .initialize(
                test_config(),
                Arc::new(StaticDiscovery::new(vec![node("n1"), node("n2")])),
                Arc::new(StubFactory {
                    fail_for: vec!["n2".to_string()],
                }),
            )
            .await
            .unwrap();

        assert!(manager.node_provider("n1").is_some());
        assert!(manager.node_provider("n2").is_none());
        // The node is still discovered and health-tracked.
        assert_eq!(manager.status().node_count, 2);
        context.reset().await;
    }

    #[tokio::test]
    async fn node_without_backend_is_never_selected() {
        let context = ClusterContext::new();
        let manager = context
            .initialize(
                test_config(),
                Arc::new(StaticDiscovery::new(vec![node("n1"), node("n2")])),
                Arc::new(StubFactory {
                    fail_for: vec!["n2".to_string()],
                }),
            )
            .await
            .unwrap();

        // Both nodes report healthy traffic, but n2 has no handle.
        manager.record_node_success("n1", 10.0).unwrap();
        manager.record_node_success("n2", 10.0).unwrap();

        for _ in 0..6 {
            let selected = manager.select_node(None, None, None).unwrap();
            assert_eq!(selected.id, "n1");
        }
        context.reset().await;
    }

    #[tokio::test]
    async fn status_snapshot_is_serializable() {
        let (context, manager) = ready_manager(vec![node("n1")]).await;
        manager.record_node_failure("n1", "boom").unwrap();

        let status = manager.status();
        assert_eq!(status.node_count, 1);
        assert_eq!(status.healthy_count, 0);
        assert!(status.cache.is_some());
        serde_json::to_string(&status).unwrap();
        context.reset().await;
    }

    #[tokio::test]
    async fn record_for_unknown_node_errors() {
        let (context, manager) = ready_manager(vec![node("n1")]).await;
        assert!(matches!(
            manager.record_node_success("ghost", 1.0),
            Err(ClusterError::UnknownNode(_))
        ));
        context.reset().await;
    }

    #[tokio::test]
    async fn shutdown_clears_backends_and_is_repeatable() {
        let (context, manager) = ready_manager(vec![node("n1")]).await;
        assert!(manager.node_provider("n1").is_some());

        manager.shutdown().await;
        assert!(manager.node_provider("n1").is_none());
        manager.shutdown().await;
        context.reset().await;
    }
}
