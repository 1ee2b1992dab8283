//! Dual-indexed store of per-node cache state.
//!
//! The registry answers two questions: "what does node N have cached?"
//! (primary index) and "which nodes hold hash H?" (secondary index). Both
//! indexes are mutated under the same write guard so they can never
//! drift apart.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::debug;

use infergrid_core::{epoch_millis, CacheEntry, CacheStats, ContentHash, NodeId};

/// Cluster-wide registry of which node caches which prompt.
///
/// Exactly one entry per node; a node's entry is replaced wholesale on
/// every warmup or sync refresh.
pub struct CacheRegistry {
    inner: RwLock<Indexes>,
}

#[derive(Default)]
struct Indexes {
    /// Primary: node → its current cache entry.
    nodes: HashMap<NodeId, CacheEntry>,
    /// Secondary: content hash → nodes currently holding it.
    by_hash: HashMap<ContentHash, HashSet<NodeId>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Indexes::default()),
        }
    }

    /// Insert or replace a node's cache entry, keeping both indexes
    /// consistent. If the node's hash changed, it is removed from its
    /// old hash bucket first.
    pub fn set(&self, entry: CacheEntry) {
        let mut inner = self.inner.write().expect("registry lock");

        let old_hash = inner
            .nodes
            .get(&entry.node_id)
            .filter(|old| old.content_hash != entry.content_hash)
            .map(|old| old.content_hash.clone());
        if let Some(old_hash) = old_hash {
            remove_from_bucket(&mut inner.by_hash, &old_hash, &entry.node_id);
        }

        inner
            .by_hash
            .entry(entry.content_hash.clone())
            .or_default()
            .insert(entry.node_id.clone());
        debug!(node_id = %entry.node_id, hash = %entry.content_hash, "cache entry updated");
        inner.nodes.insert(entry.node_id.clone(), entry);
    }

    /// Remove a node's entry from both indexes.
    pub fn delete(&self, node_id: &str) -> bool {
        let mut inner = self.inner.write().expect("registry lock");
        match inner.nodes.remove(node_id) {
            Some(entry) => {
                remove_from_bucket(&mut inner.by_hash, &entry.content_hash, node_id);
                true
            }
            None => false,
        }
    }

    /// The entry for one node, if present.
    pub fn get(&self, node_id: &str) -> Option<CacheEntry> {
        let inner = self.inner.read().expect("registry lock");
        inner.nodes.get(node_id).cloned()
    }

    /// All current entries.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let inner = self.inner.read().expect("registry lock");
        inner.nodes.values().cloned().collect()
    }

    /// Every entry whose content hash equals `hash`.
    pub fn find_nodes_with_cache(&self, hash: &str) -> Vec<CacheEntry> {
        let inner = self.inner.read().expect("registry lock");
        inner
            .by_hash
            .get(hash)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.nodes.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Aggregate statistics over the registry.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read().expect("registry lock");
        CacheStats {
            node_count: inner.nodes.len(),
            cache_count: inner.nodes.len(),
            unique_hashes: inner.by_hash.len(),
        }
    }

    /// Remove every entry older than `max_age_secs`. Returns the number
    /// removed.
    pub fn expire_stale(&self, max_age_secs: u64) -> usize {
        let cutoff = epoch_millis().saturating_sub(max_age_secs * 1_000);
        let mut inner = self.inner.write().expect("registry lock");

        let stale: Vec<(NodeId, ContentHash)> = inner
            .nodes
            .iter()
            .filter(|(_, e)| e.last_updated_ms < cutoff)
            .map(|(id, e)| (id.clone(), e.content_hash.clone()))
            .collect();

        for (node_id, hash) in &stale {
            inner.nodes.remove(node_id);
            remove_from_bucket(&mut inner.by_hash, hash, node_id);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "expired stale cache entries");
        }
        stale.len()
    }

    #[cfg(test)]
    fn assert_indexes_consistent(&self) {
        let inner = self.inner.read().expect("registry lock");
        for (hash, ids) in &inner.by_hash {
            assert!(!ids.is_empty(), "empty bucket left behind for {hash}");
            for id in ids {
                let entry = inner.nodes.get(id).expect("node in bucket has no entry");
                assert_eq!(&entry.content_hash, hash);
            }
        }
        for (id, entry) in &inner.nodes {
            let bucket = inner
                .by_hash
                .get(&entry.content_hash)
                .expect("entry hash has no bucket");
            assert!(bucket.contains(id));
        }
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove a node from a hash bucket, dropping the bucket when it empties.
fn remove_from_bucket(
    by_hash: &mut HashMap<ContentHash, HashSet<NodeId>>,
    hash: &str,
    node_id: &str,
) {
    if let Some(bucket) = by_hash.get_mut(hash) {
        bucket.remove(node_id);
        if bucket.is_empty() {
            by_hash.remove(hash);
        }
    }
}
