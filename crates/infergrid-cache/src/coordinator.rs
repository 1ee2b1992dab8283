//! Cluster cache orchestrator — warmup, registry population, sync.
//!
//! Thin coordinator over the three cache components. Warmup failures are
//! recorded but never prevent initialization: a cluster with zero warm
//! nodes simply starts without cache affinity and relies on the
//! synchronizer to catch up.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use infergrid_core::{epoch_millis, CacheConfig, CacheEntry, CacheStats, NodeDescriptor};

use crate::registry::CacheRegistry;
use crate::sync::CacheSynchronizer;
use crate::warmup::{CacheWarmup, WarmupResult};

/// Orchestrates warmup → registry population → periodic sync.
pub struct ClusterCache {
    config: CacheConfig,
    registry: Arc<CacheRegistry>,
    warmup: CacheWarmup,
    synchronizer: CacheSynchronizer,
}

impl ClusterCache {
    pub fn new(config: CacheConfig) -> Self {
        let registry = Arc::new(CacheRegistry::new());
        let warmup = CacheWarmup::new(&config);
        let synchronizer = CacheSynchronizer::new(
            Arc::clone(&registry),
            Duration::from_millis(config.warmup_timeout_ms),
            config.max_cache_age_secs,
        );
        Self {
            config,
            registry,
            warmup,
            synchronizer,
        }
    }

    /// Warm all nodes, record successful results in the registry, then
    /// start the periodic synchronizer. Per-node warmup failures are
    /// logged and skipped.
    pub async fn initialize(&self, nodes: &[NodeDescriptor]) -> Vec<WarmupResult> {
        let results = self
            .warmup
            .warm_up_nodes(nodes, &self.config.system_prompt)
            .await;

        for result in &results {
            if result.success {
                if let (Some(hash), Some(tokens)) =
                    (result.content_hash.clone(), result.token_count)
                {
                    self.registry.set(CacheEntry {
                        node_id: result.node_id.clone(),
                        node_url: result.node_url.clone(),
                        content_hash: hash,
                        token_count: tokens,
                        last_updated_ms: epoch_millis(),
                        hit_rate: None,
                    });
                }
            } else {
                warn!(
                    node_id = %result.node_id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "cache warmup failed for node"
                );
            }
        }

        self.synchronizer.start(
            nodes.to_vec(),
            Duration::from_millis(self.config.sync_interval_ms),
        );
        info!(
            nodes = nodes.len(),
            warmed = results.iter().filter(|r| r.success).count(),
            "cluster cache initialized"
        );
        results
    }

    /// Stop the periodic synchronizer. Idempotent.
    pub fn stop(&self) {
        self.synchronizer.stop();
    }

    /// Registry entries for every node caching `hash`.
    pub fn find_nodes_with_cache(&self, hash: &str) -> Vec<CacheEntry> {
        self.registry.find_nodes_with_cache(hash)
    }

    /// Read-only snapshot of all registry entries.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.registry.entries()
    }

    /// Aggregate cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.registry.stats()
    }

    /// Access the warmup component (for listener registration).
    pub fn warmup(&self) -> &CacheWarmup {
        &self.warmup
    }

    /// Access the synchronizer (for listener registration).
    pub fn synchronizer(&self) -> &CacheSynchronizer {
        &self.synchronizer
    }
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

    fn fast_cache() -> ClusterCache {
        ClusterCache::new(CacheConfig {
            warmup_concurrency: 2,
            warmup_timeout_ms: 200,
            sync_interval_ms: 10_000,
            system_prompt: "You are a helpful assistant.".to_string(),
            ..CacheConfig::default()
        })
    }

    #[tokio::test]
    async fn initialize_completes_with_all_nodes_failing() {
        let cache = fast_cache();
        let results = cache
            .initialize(&[dead_node("n1"), dead_node("n2")])
            .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| !r.success));
        // Zero warm nodes is a valid degraded start.
        assert_eq!(cache.stats().cache_count, 0);
        assert!(cache.synchronizer().is_running());
        cache.stop();
    }

    #[tokio::test]
    async fn successful_warmup_populates_registry() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    use tokio::io::{AsyncReadExt, AsyncWriteExt};
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let body = r#"{"systemPromptHash":"warm-hash","tokens":321}"#;
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                });
            }
        });

        let cache = fast_cache();
        let node = NodeDescriptor {
            id: "n1".to_string(),
            url: format!("http://{addr}"),
            status: NodeStatus::Healthy,
        };
        let results = cache.initialize(&[node]).await;
        assert!(results[0].success);

        let found = cache.find_nodes_with_cache("warm-hash");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].node_id, "n1");
        assert_eq!(found[0].token_count, 321);
        assert_eq!(cache.stats().unique_hashes, 1);
        cache.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let cache = fast_cache();
        cache.initialize(&[dead_node("n1")]).await;
        cache.stop();
        cache.stop();
        assert!(!cache.synchronizer().is_running());
    }
}
