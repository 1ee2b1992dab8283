//! Concurrency-bounded cache warmup across the fleet.
//!
//! `warm_up_nodes` primes every node's prompt cache by POSTing the
//! system prompt to the warm-cache endpoint, processing the node list in
//! fixed-size batches so at most `concurrency` calls are in flight at
//! once. Failures are per-node results, never errors.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use infergrid_core::{
    CacheConfig, ContentHash, NodeDescriptor, NodeId, WarmCacheRequest, WarmCacheResponse,
};

use crate::http::post_json;

/// Path each node must accept warmup requests on.
const WARM_PATH: &str = "/v1/cluster/cache/warm";

/// Outcome of priming a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarmupResult {
    pub node_id: NodeId,
    pub node_url: String,
    pub success: bool,
    pub content_hash: Option<ContentHash>,
    pub token_count: Option<u64>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Listener invoked with every warmup result as it completes.
pub type WarmupListener = Arc<dyn Fn(&WarmupResult) + Send + Sync>;

/// Primes node caches in concurrency-bounded batches.
pub struct CacheWarmup {
    concurrency: usize,
    timeout: Duration,
    retries: u32,
    listeners: Arc<RwLock<Vec<WarmupListener>>>,
}

impl CacheWarmup {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            concurrency: config.warmup_concurrency.max(1),
            timeout: Duration::from_millis(config.warmup_timeout_ms),
            retries: config.warmup_retries,
            listeners: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a listener for individual warmup results.
    pub fn on_result(&self, listener: WarmupListener) {
        self.listeners.write().expect("warmup listeners lock").push(listener);
    }

    /// Warm every node's cache with `system_prompt`.
    ///
    /// Nodes are processed in batches of the configured concurrency; the
    /// whole batch completes before the next starts. Always returns one
    /// result per node.
    pub async fn warm_up_nodes(
        &self,
        nodes: &[NodeDescriptor],
        system_prompt: &str,
    ) -> Vec<WarmupResult> {
        let hash = content_hash(system_prompt);
        let mut results = Vec::with_capacity(nodes.len());

        for batch in nodes.chunks(self.concurrency) {
            let mut set = JoinSet::new();
            for node in batch {
                let node = node.clone();
                let prompt = system_prompt.to_string();
                let expected_hash = hash.clone();
                let timeout = self.timeout;
                let retries = self.retries;
                set.spawn(async move {
                    warm_single_node(node, prompt, expected_hash, timeout, retries).await
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok(result) => {
                        self.dispatch(&result);
                        results.push(result);
                    }
                    Err(e) => warn!(error = %e, "warmup task failed to join"),
                }
            }
        }

        let warmed = results.iter().filter(|r| r.success).count();
        info!(
            nodes = nodes.len(),
            warmed,
            failed = results.len() - warmed,
            "cache warmup complete"
        );
        results
    }

    fn dispatch(&self, result: &WarmupResult) {
        let listeners = self.listeners.read().expect("warmup listeners lock");
        for listener in listeners.iter() {
            if std::panic::catch_unwind(AssertUnwindSafe(|| listener(result))).is_err() {
                warn!(node_id = %result.node_id, "warmup listener panicked");
            }
        }
    }
}

/// Prime one node's cache, retrying up to `retries` times after a
/// failure. The per-call deadline is enforced inside `post_json`, so
/// every exit path — success, failure, or timeout — resolves the call
/// without leaving a pending timer.
async fn warm_single_node(
    node: NodeDescriptor,
    system_prompt: String,
    expected_hash: ContentHash,
    timeout: Duration,
    retries: u32,
) -> WarmupResult {
    let started = std::time::Instant::now();
    let request = WarmCacheRequest {
        system_prompt,
    };

    let mut outcome: Result<WarmCacheResponse, _> =
        post_json(&node.url, WARM_PATH, &request, timeout).await;
    for attempt in 1..=retries {
        if outcome.is_ok() {
            break;
        }
        debug!(node_id = %node.id, attempt, "retrying cache warmup");
        outcome = post_json(&node.url, WARM_PATH, &request, timeout).await;
    }
    let duration_ms = started.elapsed().as_millis() as u64;

    match outcome {
        Ok(resp) => {
            if resp.system_prompt_hash != expected_hash {
                debug!(
                    node_id = %node.id,
                    reported = %resp.system_prompt_hash,
                    expected = %expected_hash,
                    "node reported a different prompt hash"
                );
            }
            WarmupResult {
                node_id: node.id,
                node_url: node.url,
                success: true,
                content_hash: Some(resp.system_prompt_hash),
                token_count: Some(resp.tokens),
                error: None,
                duration_ms,
            }
        }
        Err(e) => WarmupResult {
            node_id: node.id,
            node_url: node.url,
            success: false,
            content_hash: None,
            token_count: None,
            error: Some(e.to_string()),
            duration_ms,
        },
    }
}

/// SHA-256 content hash of a prompt, hex-encoded.
pub fn content_hash(prompt: &str) -> ContentHash {
    let digest = Sha256::digest(prompt.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergrid_core::NodeStatus;

    fn dead_node(id: &str) -> NodeDescriptor {
        NodeDescriptor {
            id: id.to_string(),
            url: "http://127.0.0.1:1".to_string(),
            status: NodeStatus::Healthy,
        }
    }

    fn fast_warmup(concurrency: usize) -> CacheWarmup {
        CacheWarmup::new(&CacheConfig {
            warmup_concurrency: concurrency,
            warmup_timeout_ms: 200,
            warmup_retries: 0,
            ..CacheConfig::default()
        })
    }

    #[test]
    fn content_hash_is_stable_hex_sha256() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("world"));
    }

    #[tokio::test]
    async fn one_result_per_node_even_on_failure() {
        let warmup = fast_warmup(2);
        let nodes: Vec<NodeDescriptor> =
            (0..5).map(|i| dead_node(&format!("n{i}"))).collect();

        let results = warmup.warm_up_nodes(&nodes, "prompt").await;
        assert_eq!(results.len(), 5);
        for result in &results {
            assert!(!result.success);
            assert!(result.error.is_some());
            assert!(result.content_hash.is_none());
        }
    }

    #[tokio::test]
    async fn batches_never_exceed_concurrency() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        // Serve slow responses so batch members overlap: a listener can't
        // observe in-flight counts, so count via a local TCP acceptor.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let accept_in_flight = Arc::clone(&in_flight);
        let accept_peak = Arc::clone(&peak);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let in_flight = Arc::clone(&accept_in_flight);
                let peak = Arc::clone(&accept_peak);
                tokio::spawn(async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    use tokio::io::AsyncReadExt;
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    // Hold the connection long enough for batch overlap.
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    use tokio::io::AsyncWriteExt;
                    let body = r#"{"systemPromptHash":"h","tokens":1}"#;
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });

        let warmup = fast_warmup(2);
        let nodes: Vec<NodeDescriptor> = (0..5)
            .map(|i| NodeDescriptor {
                id: format!("n{i}"),
                url: format!("http://{addr}"),
                status: NodeStatus::Healthy,
            })
            .collect();

        let results = warmup.warm_up_nodes(&nodes, "prompt").await;
        assert_eq!(results.len(), 5);
        assert!(peak.load(Ordering::SeqCst) <= 2, "batch exceeded concurrency");
    }

    #[tokio::test]
    async fn failed_warmup_is_retried() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        // First attempt gets a 503, the retry succeeds.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let attempts = Arc::new(AtomicUsize::new(0));

        let accept_attempts = Arc::clone(&attempts);
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let attempt = accept_attempts.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let resp = if attempt == 1 {
                        "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n".to_string()
                    } else {
                        let body = r#"{"systemPromptHash":"h","tokens":1}"#;
                        format!(
                            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        )
                    };
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });

        let warmup = CacheWarmup::new(&CacheConfig {
            warmup_concurrency: 1,
            warmup_timeout_ms: 200,
            warmup_retries: 1,
            ..CacheConfig::default()
        });
        let node = NodeDescriptor {
            id: "n1".to_string(),
            url: format!("http://{addr}"),
            status: NodeStatus::Healthy,
        };

        let results = warmup.warm_up_nodes(&[node], "prompt").await;
        assert!(results[0].success);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_retries_give_up_after_one_attempt() {
        let warmup = fast_warmup(1);
        let results = warmup.warm_up_nodes(&[dead_node("n1")], "prompt").await;
        assert!(!results[0].success);
    }

    #[tokio::test]
    async fn listeners_receive_every_result() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let warmup = fast_warmup(3);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        warmup.on_result(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        // A panicking listener must not suppress the counting one.
        warmup.on_result(Arc::new(|_| panic!("broken listener")));

        let nodes: Vec<NodeDescriptor> =
            (0..3).map(|i| dead_node(&format!("n{i}"))).collect();
        warmup.warm_up_nodes(&nodes, "prompt").await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
