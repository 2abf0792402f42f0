//! Block Cache
//!
//! Bounded LRU map from address to decoded block. Only published, immutable
//! blocks enter the cache; blocks under construction live in their write
//! handle until commit, so eviction can never drop an in-flight write.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

use super::{Block, BlockAddr};

/// LRU cache of decoded blocks
pub struct BlockCache {
    entries: Mutex<LruCache<BlockAddr, Arc<Block>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl BlockCache {
    /// Create a cache holding at most `capacity` blocks (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, addr: BlockAddr) -> Option<Arc<Block>> {
        let found = self.entries.lock().get(&addr).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, addr: BlockAddr, block: Arc<Block>) {
        self.entries.lock().put(addr, block);
    }

    /// Drop a freed address so a later reuse cannot serve stale contents
    pub fn invalidate(&self, addr: BlockAddr) {
        self.entries.lock().pop(&addr);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
