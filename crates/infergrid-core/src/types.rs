//! Domain types for the InferGrid cluster coordinator.
//!
//! These types represent node identity and status, per-node health and
//! cache snapshots, sticky sessions, routing decisions, and the wire
//! payloads of the cluster-management endpoints. All types serialize
//! to/from JSON.

use serde::{Deserialize, Serialize};

/// Unique identifier for an inference node.
pub type NodeId = String;

/// Hex-encoded content hash of a cached prompt.
pub type ContentHash = String;

/// Opaque session identifier supplied by the caller.
pub type SessionId = String;

// ── Node ──────────────────────────────────────────────────────────

/// Lifecycle status of a node as tracked by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Discovered but no successful check yet.
    Initializing,
    /// Passing checks at or above the degraded threshold.
    Healthy,
    /// Elevated failure rate but still routable.
    Degraded,
    /// Tripped the circuit breaker; not routable.
    Unhealthy,
    /// Persistently failing; probed on maximum backoff only.
    Offline,
}

impl NodeStatus {
    /// Whether a node in this status is a valid routing target.
    pub fn is_eligible(self) -> bool {
        matches!(self, NodeStatus::Healthy | NodeStatus::Degraded)
    }
}

/// A node as reported by the discovery collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: NodeId,
    /// Base URL, e.g. `http://10.0.0.4:8080`.
    pub url: String,
    pub status: NodeStatus,
}

/// Point-in-time health view of a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealthSnapshot {
    pub status: NodeStatus,
    /// Fraction of in-window samples that succeeded, 0.0 when empty.
    pub success_rate: f64,
    /// Mean latency over successful in-window samples.
    pub avg_latency_ms: f64,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
    /// Number of samples currently inside the window.
    pub sample_count: usize,
    pub last_error: Option<String>,
    /// Unix millis of the most recent check, if any.
    pub last_check_ms: Option<u64>,
}

impl Default for NodeHealthSnapshot {
    fn default() -> Self {
        Self {
            status: NodeStatus::Initializing,
            success_rate: 0.0,
            avg_latency_ms: 0.0,
            consecutive_successes: 0,
            consecutive_failures: 0,
            sample_count: 0,
            last_error: None,
            last_check_ms: None,
        }
    }
}

// ── Cache ─────────────────────────────────────────────────────────

/// Cache state of one node as held in the cluster cache registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub node_id: NodeId,
    pub node_url: String,
    pub content_hash: ContentHash,
    pub token_count: u64,
    /// Unix millis of the last warmup or sync refresh.
    pub last_updated_ms: u64,
    pub hit_rate: Option<f64>,
}

/// Aggregate cache statistics across the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Nodes with a registry entry.
    pub node_count: usize,
    /// Total cache entries (one per node).
    pub cache_count: usize,
    /// Distinct content hashes across all entries.
    pub unique_hashes: usize,
}

// ── Sessions ──────────────────────────────────────────────────────

/// A TTL-bound pinning of a session to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickySession {
    pub session_id: SessionId,
    pub node_id: NodeId,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

// ── Routing ───────────────────────────────────────────────────────

/// Node selection strategy for the cluster router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    RoundRobin,
    LeastLoaded,
    LatencyBased,
    CacheAware,
}

/// Outcome of a single routing call. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub node_id: NodeId,
    /// Human-readable explanation of the choice.
    pub reason: String,
    /// Selection confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Cache view of a node as seen by the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCacheView {
    pub content_hash: ContentHash,
    pub tools_hash: Option<ContentHash>,
    pub last_updated_ms: u64,
}

/// Per-request routing view of a node, assembled by the cluster manager
/// from health, cache, and load state. The router only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteNode {
    pub id: NodeId,
    pub url: String,
    pub status: NodeStatus,
    pub avg_latency_ms: f64,
    /// Fraction of recent requests that failed, in `[0, 1]`.
    pub error_rate: f64,
    /// Requests currently in flight on this node.
    pub in_flight: u64,
    pub cache: Option<NodeCacheView>,
}

/// Cache-relevant request attributes used for affinity scoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingContext {
    pub system_prompt_hash: Option<ContentHash>,
    pub tools_hash: Option<ContentHash>,
}

// ── Status snapshot ───────────────────────────────────────────────

/// Per-node summary inside a [`ClusterStatus`] snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusSummary {
    pub id: NodeId,
    pub url: String,
    pub health: NodeHealthSnapshot,
    pub in_flight: u64,
}

/// Read-only, JSON-serializable snapshot of the whole cluster.
/// Computed on demand, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub node_count: usize,
    pub healthy_count: usize,
    pub nodes: Vec<NodeStatusSummary>,
    pub cache: Option<CacheStats>,
}

// ── Wire payloads ─────────────────────────────────────────────────

/// Body of `POST {node}/v1/cluster/cache/warm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmCacheRequest {
    pub system_prompt: String,
}

/// Response of `POST {node}/v1/cluster/cache/warm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmCacheResponse {
    pub system_prompt_hash: ContentHash,
    pub tokens: u64,
}

/// Response of `GET {node}/v1/cluster/cache`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStateResponse {
    pub system_prompt_hash: ContentHash,
    pub tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_rate: Option<f64>,
}

/// Current time as Unix milliseconds.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
