//! In-memory layer data cache
//!
//! One entry per layer id holding the fully merged feature collection plus
//! metadata. Pure key-value semantics: last write wins, no TTL, entries leave
//! only through explicit eviction. Caching is an optimization — nothing here
//! can fail in a way that costs the caller data it already holds in memory.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use lru::LruCache;

use crate::layer::{FeatureCollection, LayerId};

/// Cached merged result for one layer.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub layer_id: LayerId,
    pub layer_name: String,
    pub features: Arc<FeatureCollection>,
    pub inserted_at: Instant,
}

/// Session-lifetime cache of merged layer data.
///
/// The default store is unbounded, matching the observed behavior of the
/// system this replaces; hosts that want a bound can construct one with
/// [`LayerCache::with_capacity`], which evicts least-recently-used layers.
pub struct LayerCache {
    entries: Mutex<LruCache<LayerId, CacheEntry>>,
}

impl LayerCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn with_capacity(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, layer_id: LayerId) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(&layer_id).cloned()
    }

    pub fn contains(&self, layer_id: LayerId) -> bool {
        self.entries.lock().unwrap().contains(&layer_id)
    }

    /// Store the merged collection for a layer, replacing any previous entry
    /// wholesale (no partial invalidation).
    pub fn insert(
        &self,
        layer_id: LayerId,
        layer_name: impl Into<String>,
        features: Arc<FeatureCollection>,
    ) {
        let entry = CacheEntry {
            layer_id,
            layer_name: layer_name.into(),
            features,
            inserted_at: Instant::now(),
        };
        self.entries.lock().unwrap().put(layer_id, entry);
    }

    /// Explicitly drop one layer's entry.
    pub fn evict(&self, layer_id: LayerId) -> bool {
        self.entries.lock().unwrap().pop(&layer_id).is_some()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

impl Default for LayerCache {
    fn default() -> Self {
        Self::new()
    }
}
