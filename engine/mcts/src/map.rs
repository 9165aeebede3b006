//! Process-shared transposition map.
//!
//! Maps position hashes to their canonical tree node so positions reached
//! through different move orders share one node. The map also carries the
//! total node count of the tree, which the worker's limit guard reads
//! without taking the lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::node::Node;

struct MapInner {
    table: HashMap<u64, Arc<Node>>,
    hits: u64,
    misses: u64,
}

/// Mutex-guarded hash-to-node map shared by all workers of one search.
pub struct TranspositionMap {
    inner: Mutex<MapInner>,
    node_count: AtomicUsize,
}

impl TranspositionMap {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(MapInner {
                table: HashMap::with_capacity(capacity),
                hits: 0,
                misses: 0,
            }),
            node_count: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MapInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Find the canonical node for `hash` or build and register a fresh
    /// one. Returns the node and whether it was already present (a
    /// transposition). The first inserter wins; terminal nodes are never
    /// inserted since their value is exact and cheap to recompute.
    pub fn lookup_or_insert_with<F>(&self, hash: u64, make: F) -> (Arc<Node>, bool)
    where
        F: FnOnce() -> Arc<Node>,
    {
        let mut guard = self.lock();
        if let Some(existing) = guard.table.get(&hash).cloned() {
            guard.hits += 1;
            return (existing, true);
        }
        guard.misses += 1;
        let node = make();
        if !node.is_terminal() {
            guard.table.insert(hash, node.clone());
        }
        drop(guard);
        self.node_count.fetch_add(1, Ordering::Relaxed);
        (node, false)
    }

    /// Count a node that bypasses hash-based reuse (rollout mode with the
    /// table disabled).
    pub fn count_node(&self) {
        self.node_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Register a root node created outside the expansion path.
    pub fn register_root(&self, root: &Arc<Node>) {
        let mut guard = self.lock();
        if !root.is_terminal() {
            guard.table.insert(root.hash_key(), root.clone());
        }
        drop(guard);
        self.node_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Total nodes attached to the tree, including uninserted terminals.
    pub fn node_count(&self) -> usize {
        self.node_count.load(Ordering::Relaxed)
    }

    /// Number of canonical entries.
    pub fn len(&self) -> usize {
        self.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().table.is_empty()
    }

    /// Lookup hits and misses since creation.
    pub fn stats(&self) -> (u64, u64) {
        let guard = self.lock();
        (guard.hits, guard.misses)
    }

    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.stats();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Drop all entries and counters, e.g. between games.
    pub fn clear(&self) {
        let mut guard = self.lock();
        guard.table.clear();
        guard.hits = 0;
        guard.misses = 0;
        drop(guard);
        self.node_count.store(0, Ordering::Relaxed);
    }
}

impl Default for TranspositionMap {
    fn default() -> Self {
        Self::new()
    }
}
