use std::fmt::{self, Write as _};
use std::num::NonZeroUsize;

use lru::LruCache;
use serde::Serialize;

use hexgraph_core::{OpKind, TensorMeta};

use crate::graph::{CachedGraph, Template};

/// Graph signature: op kind, template tag and every participating
/// tensor's type and extents. Buffer addresses never enter the key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphKey(String);

impl GraphKey {
    pub fn new(op: OpKind, template: Template, srcs: &[TensorMeta], dst: &TensorMeta) -> Self {
        let mut key = String::with_capacity(64);
        key.push_str(op.name());
        key.push_str(template.tag());
        for meta in srcs.iter().chain(std::iter::once(dst)) {
            let _ = write!(key, "_{}_", meta.dtype);
            for (i, d) in meta.shape.dims().iter().enumerate() {
                if i > 0 {
                    key.push('x');
                }
                let _ = write!(key, "{d}");
            }
        }
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GraphKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub builds: u64,
    pub evictions: u64,
    pub entries: usize,
}

/// Compiled graphs by signature.
///
/// Unbounded by default. With a capacity, the least recently used entry is
/// handed back to the caller on overflow so its accelerator resources can
/// be released.
pub struct GraphCache {
    entries: LruCache<GraphKey, CachedGraph>,
    stats: CacheStats,
}

impl GraphCache {
    pub fn new(capacity: Option<NonZeroUsize>) -> Self {
        let entries = match capacity {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            entries,
            stats: CacheStats::default(),
        }
    }

    /// Look up a graph, counting a hit or a miss.
    pub fn get(&mut self, key: &GraphKey) -> Option<&mut CachedGraph> {
        match self.entries.get_mut(key) {
            Some(graph) => {
                self.stats.hits += 1;
                Some(graph)
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Look up a graph without touching statistics or recency.
    pub fn peek_mut(&mut self, key: &GraphKey) -> Option<&mut CachedGraph> {
        self.entries.peek_mut(key)
    }

    pub fn contains(&self, key: &GraphKey) -> bool {
        self.entries.contains(key)
    }

    /// Store a freshly built graph. Returns the entry pushed out to make
    /// room, if any.
    pub fn insert(&mut self, key: GraphKey, graph: CachedGraph) -> Option<(GraphKey, CachedGraph)> {
        self.stats.builds += 1;
        let evicted = self.entries.push(key.clone(), graph);
        if let Some((old_key, _)) = &evicted {
            debug_assert_ne!(old_key, &key, "graph inserted twice under one key");
            self.stats.evictions += 1;
            tracing::debug!(evicted = %old_key, "graph cache full, evicting");
        }
        evicted
    }

    /// Remove every entry, least recently used first.
    pub fn drain(&mut self) -> Vec<(GraphKey, CachedGraph)> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(entry) = self.entries.pop_lru() {
            out.push(entry);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            ..self.stats
        }
    }
}
