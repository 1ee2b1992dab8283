//! Strategy-dispatching node selector.
//!
//! Filters to eligible nodes, then picks one by the configured strategy.
//! The cache-aware strategy scores each node on cache match, health,
//! load, and recency; when no node holds the requested prompt it falls
//! back to round-robin so requests still spread evenly. A sticky-session
//! layer can short-circuit the whole selection for multi-turn
//! interactions.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use infergrid_core::{
    epoch_millis, ConfigError, RouteNode, RoutingConfig, RoutingContext, RoutingDecision,
    RoutingStrategy,
};

use crate::session::StickySessionManager;

/// Cache-affinity score weights. Maximum total is 120.
const SCORE_HASH_MATCH: f64 = 50.0;
const SCORE_TOOLS_MATCH: f64 = 20.0;
const SCORE_HEALTH_MAX: f64 = 25.0;
const SCORE_LOW_LOAD: f64 = 15.0;
const SCORE_RECENT_CACHE: f64 = 10.0;
const SCORE_MAX: f64 =
    SCORE_HASH_MATCH + SCORE_TOOLS_MATCH + SCORE_HEALTH_MAX + SCORE_LOW_LOAD + SCORE_RECENT_CACHE;

/// In-flight requests below this count as lightly loaded.
const LOW_LOAD_THRESHOLD: u64 = 5;
/// Cache refreshes within this window count as recent.
const RECENT_CACHE_MS: u64 = 60_000;
/// Confidence assigned when a live sticky session short-circuits scoring.
const STICKY_CONFIDENCE: f64 = 0.95;

/// Listener fired when selection finds zero eligible nodes.
pub type RoutingFailedListener = Arc<dyn Fn(&RoutingContext) + Send + Sync>;

/// Multi-strategy node selector with sticky-session override.
pub struct ClusterRouter {
    strategy: RoutingStrategy,
    /// Shared by the round-robin strategy and the cache-aware fallback.
    counter: AtomicUsize,
    sessions: StickySessionManager,
    failed_listeners: Arc<RwLock<Vec<RoutingFailedListener>>>,
}

impl ClusterRouter {
    /// Create a router from the routing config. Starts the session
    /// manager's background sweep.
    pub fn new(config: &RoutingConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            strategy: config.strategy,
            counter: AtomicUsize::new(0),
            sessions: StickySessionManager::new(config.session_ttl_ms)?,
            failed_listeners: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Register a listener for failed routing attempts.
    pub fn on_routing_failed(&self, listener: RoutingFailedListener) {
        self.failed_listeners
            .write()
            .expect("routing listeners lock")
            .push(listener);
    }

    /// Select a node by the configured strategy.
    ///
    /// Returns `None` if and only if no supplied node is eligible.
    pub fn select_node(
        &self,
        nodes: &[RouteNode],
        context: &RoutingContext,
    ) -> Option<RoutingDecision> {
        let eligible: Vec<&RouteNode> = nodes.iter().filter(|n| n.status.is_eligible()).collect();
        if eligible.is_empty() {
            self.dispatch_failed(context);
            return None;
        }

        let decision = match self.strategy {
            RoutingStrategy::RoundRobin => self.round_robin(&eligible),
            RoutingStrategy::LeastLoaded => least_loaded(&eligible),
            RoutingStrategy::LatencyBased => latency_based(&eligible),
            RoutingStrategy::CacheAware => self.cache_aware(&eligible, context),
        };
        debug!(
            node_id = %decision.node_id,
            confidence = decision.confidence,
            reason = %decision.reason,
            "routing decision"
        );
        Some(decision)
    }

    /// Sticky-aware selection: a live session whose pinned node is still
    /// eligible wins immediately, skipping re-scoring. Otherwise select
    /// normally and pin the result under the session id.
    pub fn select_node_with_sticky(
        &self,
        nodes: &[RouteNode],
        context: &RoutingContext,
        session_id: &str,
    ) -> Option<RoutingDecision> {
        if let Some(pinned) = self.sessions.get_session(session_id) {
            let still_eligible = nodes
                .iter()
                .any(|n| n.id == pinned && n.status.is_eligible());
            if still_eligible {
                // Every route decision refreshes the session TTL.
                self.sessions.create_session(session_id, &pinned);
                return Some(RoutingDecision {
                    node_id: pinned,
                    reason: format!("sticky session {session_id}"),
                    confidence: STICKY_CONFIDENCE,
                });
            }
        }

        let decision = self.select_node(nodes, context)?;
        self.sessions.create_session(session_id, &decision.node_id);
        Some(decision)
    }

    /// Pin a session explicitly.
    pub fn create_session(&self, session_id: &str, node_id: &str) {
        self.sessions.create_session(session_id, node_id);
    }

    /// Drop a session pin.
    pub fn clear_session(&self, session_id: &str) -> bool {
        self.sessions.remove_session(session_id)
    }

    /// Number of live sessions.
    pub fn active_session_count(&self) -> usize {
        self.sessions.active_session_count()
    }

    /// Stop the session manager's background sweep.
    pub fn destroy(&self) {
        self.sessions.stop_cleanup();
    }

    fn round_robin(&self, eligible: &[&RouteNode]) -> RoutingDecision {
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % eligible.len();
        RoutingDecision {
            node_id: eligible[idx].id.clone(),
            reason: format!("round-robin ({} of {})", idx + 1, eligible.len()),
            confidence: 0.8,
        }
    }

    fn cache_aware(&self, eligible: &[&RouteNode], context: &RoutingContext) -> RoutingDecision {
        let now = epoch_millis();
        let mut best: Option<(&RouteNode, f64, bool)> = None;
        let mut any_hash_match = false;

        for node in eligible {
            let (score, hash_match) = affinity_score(node, context, now);
            any_hash_match |= hash_match;
            let better = match best {
                Some((_, best_score, _)) => score > best_score,
                None => true,
            };
            if better {
                best = Some((node, score, hash_match));
            }
        }

        if !any_hash_match {
            // Nobody holds the requested prompt: spread the load instead
            // of pretending affinity exists.
            let mut decision = self.round_robin(eligible);
            decision.reason = format!("cache-aware fallback, no hash match: {}", decision.reason);
            decision.confidence = 0.5;
            return decision;
        }

        let (node, score, _) = best.expect("eligible is non-empty");
        RoutingDecision {
            node_id: node.id.clone(),
            reason: format!("cache-affinity score {score:.1}/{SCORE_MAX:.0}"),
            confidence: (score / SCORE_MAX).clamp(0.0, 1.0),
        }
    }

    fn dispatch_failed(&self, context: &RoutingContext) {
        warn!("no eligible nodes for routing");
        let listeners = self.failed_listeners.read().expect("routing listeners lock");
        for listener in listeners.iter() {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(context))).is_err() {
                warn!("routing-failed listener panicked");
            }
        }
    }
}

fn least_loaded(eligible: &[&RouteNode]) -> RoutingDecision {
    let node = eligible
        .iter()
        .min_by_key(|n| n.in_flight)
        .expect("eligible is non-empty");
    RoutingDecision {
        node_id: node.id.clone(),
        reason: format!("least loaded ({} in flight)", node.in_flight),
        confidence: 0.85,
    }
}

fn latency_based(eligible: &[&RouteNode]) -> RoutingDecision {
    let node = eligible
        .iter()
        .min_by(|a, b| {
            a.avg_latency_ms
                .partial_cmp(&b.avg_latency_ms)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("eligible is non-empty");
    RoutingDecision {
        node_id: node.id.clone(),
        reason: format!("lowest latency ({:.1}ms)", node.avg_latency_ms),
        confidence: 0.85,
    }
}

/// Score one node for cache affinity. Returns `(score, hash_matched)`.
///
/// +50 cache hash match, +20 tools match (only when the hash matched),
/// +25×(1−error_rate), +15 when lightly loaded, +10 when the cache was
/// refreshed recently. Maximum 120.
fn affinity_score(node: &RouteNode, context: &RoutingContext, now_ms: u64) -> (f64, bool) {
    let mut score = 0.0;
    let mut hash_match = false;

    if let (Some(cache), Some(wanted)) = (&node.cache, &context.system_prompt_hash) {
        if &cache.content_hash == wanted {
            hash_match = true;
            score += SCORE_HASH_MATCH;
            // Tools bonus is gated on the prompt hash matching.
            if let (Some(tools), Some(wanted_tools)) = (&cache.tools_hash, &context.tools_hash) {
                if tools == wanted_tools {
                    score += SCORE_TOOLS_MATCH;
                }
            }
        }
    }

    score += SCORE_HEALTH_MAX * (1.0 - node.error_rate.clamp(0.0, 1.0));

    if node.in_flight < LOW_LOAD_THRESHOLD {
        score += SCORE_LOW_LOAD;
    }

    if let Some(cache) = &node.cache {
        if now_ms.saturating_sub(cache.last_updated_ms) < RECENT_CACHE_MS {
            score += SCORE_RECENT_CACHE;
        }
    }

    (score, hash_match)
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergrid_core::{NodeCacheView, NodeStatus};

    fn route_node(id: &str, status: NodeStatus) -> RouteNode {
        RouteNode {
            id: id.to_string(),
            url: format!("http://{id}:8080"),
            status,
            avg_latency_ms: 100.0,
            error_rate: 0.0,
            in_flight: 0,
            cache: None,
        }
    }

    fn cached_node(id: &str, hash: &str) -> RouteNode {
        let mut node = route_node(id, NodeStatus::Healthy);
        node.cache = Some(NodeCacheView {
            content_hash: hash.to_string(),
            tools_hash: None,
            last_updated_ms: epoch_millis(),
        });
        node
    }

    fn router(strategy: RoutingStrategy) -> ClusterRouter {
        ClusterRouter::new(&RoutingConfig {
            strategy,
            session_ttl_ms: 60_000,
            ..RoutingConfig::default()
        })
        .unwrap()
    }

    fn ctx(hash: &str) -> RoutingContext {
        RoutingContext {
            system_prompt_hash: Some(hash.to_string()),
            tools_hash: None,
        }
    }

    #[tokio::test]
    async fn no_eligible_nodes_returns_none_and_fires_listener() {
        use std::sync::atomic::AtomicUsize;

        let router = router(RoutingStrategy::RoundRobin);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        router.on_routing_failed(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let nodes = vec![
            route_node("n1", NodeStatus::Unhealthy),
            route_node("n2", NodeStatus::Offline),
            route_node("n3", NodeStatus::Initializing),
        ];
        assert!(router.select_node(&nodes, &RoutingContext::default()).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        router.destroy();
    }

    #[tokio::test]
    async fn degraded_nodes_are_still_eligible() {
        let router = router(RoutingStrategy::RoundRobin);
        let nodes = vec![route_node("n1", NodeStatus::Degraded)];
        let decision = router.select_node(&nodes, &RoutingContext::default()).unwrap();
        assert_eq!(decision.node_id, "n1");
        router.destroy();
    }

    #[tokio::test]
    async fn round_robin_cycles_with_confidence() {
        let router = router(RoutingStrategy::RoundRobin);
        let nodes = vec![
            route_node("n1", NodeStatus::Healthy),
            route_node("n2", NodeStatus::Healthy),
            route_node("n3", NodeStatus::Healthy),
        ];
        let picks: Vec<String> = (0..6)
            .map(|_| {
                let d = router.select_node(&nodes, &RoutingContext::default()).unwrap();
                assert_eq!(d.confidence, 0.8);
                d.node_id
            })
            .collect();
        assert_eq!(picks, vec!["n1", "n2", "n3", "n1", "n2", "n3"]);
        router.destroy();
    }

    #[tokio::test]
    async fn least_loaded_picks_fewest_in_flight() {
        let router = router(RoutingStrategy::LeastLoaded);
        let mut n1 = route_node("n1", NodeStatus::Healthy);
        n1.in_flight = 7;
        let mut n2 = route_node("n2", NodeStatus::Healthy);
        n2.in_flight = 2;

        let decision = router.select_node(&[n1, n2], &RoutingContext::default()).unwrap();
        assert_eq!(decision.node_id, "n2");
        assert_eq!(decision.confidence, 0.85);
        router.destroy();
    }

    #[tokio::test]
    async fn latency_based_picks_fastest() {
        let router = router(RoutingStrategy::LatencyBased);
        let mut n1 = route_node("n1", NodeStatus::Healthy);
        n1.avg_latency_ms = 250.0;
        let mut n2 = route_node("n2", NodeStatus::Healthy);
        n2.avg_latency_ms = 40.0;

        let decision = router.select_node(&[n1, n2], &RoutingContext::default()).unwrap();
        assert_eq!(decision.node_id, "n2");
        assert_eq!(decision.confidence, 0.85);
        router.destroy();
    }

    #[tokio::test]
    async fn cache_aware_prefers_hash_match() {
        let router = router(RoutingStrategy::CacheAware);
        let nodes = vec![cached_node("a", "h1"), cached_node("b", "h2")];
        let decision = router.select_node(&nodes, &ctx("h1")).unwrap();
        assert_eq!(decision.node_id, "a");
        router.destroy();
    }

    #[test]
    fn hash_match_is_worth_exactly_fifty() {
        let now = epoch_millis();
        let matched = cached_node("a", "h1");
        let unmatched = cached_node("b", "h2");
        let context = ctx("h1");

        let (matched_score, matched_hit) = affinity_score(&matched, &context, now);
        let (unmatched_score, unmatched_hit) = affinity_score(&unmatched, &context, now);
        assert!(matched_hit);
        assert!(!unmatched_hit);
        assert_eq!(matched_score - unmatched_score, SCORE_HASH_MATCH);
    }

    #[test]
    fn tools_bonus_gated_on_hash_match() {
        let now = epoch_millis();
        let mut node = cached_node("a", "h1");
        node.cache.as_mut().unwrap().tools_hash = Some("t1".to_string());

        let context = RoutingContext {
            system_prompt_hash: Some("h1".to_string()),
            tools_hash: Some("t1".to_string()),
        };
        let (with_match, _) = affinity_score(&node, &context, now);

        // Same tools hash but the prompt hash misses: no tools bonus.
        let miss_context = RoutingContext {
            system_prompt_hash: Some("other".to_string()),
            tools_hash: Some("t1".to_string()),
        };
        let (without_match, _) = affinity_score(&node, &miss_context, now);
        assert_eq!(
            with_match - without_match,
            SCORE_HASH_MATCH + SCORE_TOOLS_MATCH
        );
    }

    #[test]
    fn perfect_node_scores_max() {
        let now = epoch_millis();
        let mut node = cached_node("a", "h1");
        node.cache.as_mut().unwrap().tools_hash = Some("t1".to_string());
        let context = RoutingContext {
            system_prompt_hash: Some("h1".to_string()),
            tools_hash: Some("t1".to_string()),
        };
        let (score, _) = affinity_score(&node, &context, now);
        assert_eq!(score, SCORE_MAX);
        assert_eq!(SCORE_MAX, 120.0);
    }

    #[test]
    fn error_rate_reduces_health_points() {
        let now = epoch_millis();
        let healthy = cached_node("a", "h1");
        let mut flaky = cached_node("b", "h1");
        flaky.error_rate = 0.4;

        let context = ctx("h1");
        let (healthy_score, _) = affinity_score(&healthy, &context, now);
        let (flaky_score, _) = affinity_score(&flaky, &context, now);
        assert!((healthy_score - flaky_score - 10.0).abs() < 1e-9);
    }

    #[test]
    fn stale_cache_loses_recency_points() {
        let now = epoch_millis();
        let fresh = cached_node("a", "h1");
        let mut stale = cached_node("b", "h1");
        stale.cache.as_mut().unwrap().last_updated_ms = now.saturating_sub(120_000);

        let context = ctx("h1");
        let (fresh_score, _) = affinity_score(&fresh, &context, now);
        let (stale_score, _) = affinity_score(&stale, &context, now);
        assert_eq!(fresh_score - stale_score, SCORE_RECENT_CACHE);
    }

    #[test]
    fn heavy_load_loses_load_points() {
        let now = epoch_millis();
        let light = cached_node("a", "h1");
        let mut heavy = cached_node("b", "h1");
        heavy.in_flight = 5;

        let context = ctx("h1");
        let (light_score, _) = affinity_score(&light, &context, now);
        let (heavy_score, _) = affinity_score(&heavy, &context, now);
        assert_eq!(light_score - heavy_score, SCORE_LOW_LOAD);
    }

    #[tokio::test]
    async fn cache_aware_falls_back_to_round_robin_without_match() {
        let router = router(RoutingStrategy::CacheAware);
        let nodes = vec![cached_node("a", "h1"), cached_node("b", "h2")];

        let decision = router.select_node(&nodes, &ctx("h-missing")).unwrap();
        assert_eq!(decision.confidence, 0.5);
        assert!(decision.reason.contains("fallback"));
        router.destroy();
    }

    #[tokio::test]
    async fn fallback_shares_the_round_robin_counter() {
        let router = router(RoutingStrategy::CacheAware);
        let nodes = vec![cached_node("a", "h1"), cached_node("b", "h2")];

        // Two fallback selections advance the shared counter in turn.
        let first = router.select_node(&nodes, &ctx("h-missing")).unwrap();
        let second = router.select_node(&nodes, &ctx("h-missing")).unwrap();
        assert_ne!(first.node_id, second.node_id);
        router.destroy();
    }

    #[tokio::test]
    async fn confidence_is_score_over_max() {
        let router = router(RoutingStrategy::CacheAware);
        let nodes = vec![cached_node("a", "h1")];
        let decision = router.select_node(&nodes, &ctx("h1")).unwrap();
        // 50 (hash) + 25 (health) + 15 (load) + 10 (recent) = 100 of 120.
        assert!((decision.confidence - 100.0 / 120.0).abs() < 1e-9);
        router.destroy();
    }

    #[tokio::test]
    async fn sticky_session_short_circuits_scoring() {
        let router = router(RoutingStrategy::CacheAware);
        let nodes = vec![cached_node("a", "h1"), cached_node("b", "h2")];

        // First call pins b even though a would win on affinity.
        router.create_session("s1", "b");
        for _ in 0..3 {
            let decision = router
                .select_node_with_sticky(&nodes, &ctx("h1"), "s1")
                .unwrap();
            assert_eq!(decision.node_id, "b");
            assert_eq!(decision.confidence, STICKY_CONFIDENCE);
        }
        router.destroy();
    }

    #[tokio::test]
    async fn sticky_falls_through_when_pinned_node_ineligible() {
        let router = router(RoutingStrategy::CacheAware);
        router.create_session("s1", "dead");

        let nodes = vec![cached_node("a", "h1")];
        let decision = router
            .select_node_with_sticky(&nodes, &ctx("h1"), "s1")
            .unwrap();
        assert_eq!(decision.node_id, "a");
        // The session has been repinned to the new node.
        let repinned = router
            .select_node_with_sticky(&nodes, &ctx("h1"), "s1")
            .unwrap();
        assert_eq!(repinned.confidence, STICKY_CONFIDENCE);
        router.destroy();
    }

    #[tokio::test]
    async fn selection_pins_new_sessions() {
        let router = router(RoutingStrategy::RoundRobin);
        let nodes = vec![
            route_node("n1", NodeStatus::Healthy),
            route_node("n2", NodeStatus::Healthy),
        ];

        assert_eq!(router.active_session_count(), 0);
        let first = router
            .select_node_with_sticky(&nodes, &RoutingContext::default(), "s1")
            .unwrap();
        assert_eq!(router.active_session_count(), 1);

        // Later calls stick to the pinned node instead of rotating.
        let second = router
            .select_node_with_sticky(&nodes, &RoutingContext::default(), "s1")
            .unwrap();
        assert_eq!(first.node_id, second.node_id);

        assert!(router.clear_session("s1"));
        assert_eq!(router.active_session_count(), 0);
        router.destroy();
    }
}
