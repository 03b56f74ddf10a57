//! Session-scoped cache of allocation patterns, keyed by the concrete shapes
//! a run was fed with. Successive runs with identical feed shapes can size
//! their arenas up front from a cached pattern.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use lru::LruCache;

use crate::env;
use crate::hashing::{fnv1a_bytes, fnv1a_init};
use crate::spec::{DType, DeviceMemoryInfo, ValueId};

/// Snapshot of one run's allocation behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryPattern {
    /// Byte size of every freshly allocated value, in value order.
    pub per_value: Vec<(ValueId, usize)>,
    /// Total bytes allocated per placement.
    pub total_bytes: Vec<(DeviceMemoryInfo, usize)>,
}

/// LRU cache of memory patterns. The cache is owned by the session and is the
/// only session-scoped state the executor mutates.
pub struct MemoryPatternCache {
    inner: Mutex<LruCache<u64, Arc<MemoryPattern>>>,
}

impl MemoryPatternCache {
    /// Builds a cache with the configured capacity (`WEFT_PATTERN_CACHE_CAP`,
    /// default 64).
    pub fn new() -> Self {
        Self::with_capacity(env::pattern_cache_capacity())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least one");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<MemoryPattern>> {
        self.inner
            .lock()
            .expect("pattern cache mutex poisoned")
            .get(&key)
            .cloned()
    }

    pub fn insert(&self, key: u64, pattern: MemoryPattern) {
        self.inner
            .lock()
            .expect("pattern cache mutex poisoned")
            .put(key, Arc::new(pattern));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pattern cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryPatternCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic key over the dtypes and concrete dimensions of a run's
/// feeds.
pub fn feed_shapes_key(feeds: &[(DType, Vec<usize>)]) -> u64 {
    let mut hash = fnv1a_init();
    for (dtype, dims) in feeds {
        hash = fnv1a_bytes(hash, format!("{dtype:?}").as_bytes());
        hash = fnv1a_bytes(hash, &(dims.len() as u64).to_le_bytes());
        for dim in dims {
            hash = fnv1a_bytes(hash, &(*dim as u64).to_le_bytes());
        }
    }
    hash
}
