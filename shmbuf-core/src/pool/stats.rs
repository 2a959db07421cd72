//! Pool counters.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub(super) struct PoolCounters {
    pub rents: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub returned_to_cache: AtomicU64,
    pub returned_to_allocator: AtomicU64,
}

impl PoolCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, cached: usize, idle_handles: usize) -> PoolStats {
        PoolStats {
            rents: self.rents.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            returned_to_cache: self.returned_to_cache.load(Ordering::Relaxed),
            returned_to_allocator: self.returned_to_allocator.load(Ordering::Relaxed),
            cached,
            idle_handles,
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total `rent` calls.
    pub rents: u64,
    /// Rents served from the per-process cache.
    pub cache_hits: u64,
    /// Rents that went to the allocator.
    pub cache_misses: u64,
    /// Returns kept in the cache.
    pub returned_to_cache: u64,
    /// Returns freed through the allocator.
    pub returned_to_allocator: u64,
    /// Buffers currently cached.
    pub cached: usize,
    /// Empty handles waiting for reuse.
    pub idle_handles: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rents:                 {}", self.rents)?;
        writeln!(f, "cache hits:            {}", self.cache_hits)?;
        writeln!(f, "cache misses:          {}", self.cache_misses)?;
        writeln!(f, "returned to cache:     {}", self.returned_to_cache)?;
        writeln!(f, "returned to allocator: {}", self.returned_to_allocator)?;
        writeln!(f, "cached buffers:        {}", self.cached)?;
        write!(f, "idle handles:          {}", self.idle_handles)
    }
}
