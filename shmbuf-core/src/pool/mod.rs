//! Per-process buffer pool.
//!
//! ```text
//!            rent(size)                              drop / release
//!                │                                         │
//!     ┌──────────▼─────────┐  hit            ┌─────────────▼───────────┐
//!     │ cache[bucket]      ├──────▶ owned ◀──┤ cache[bucket] has room?  │
//!     └──────────┬─────────┘                 └─────────────┬───────────┘
//!          miss  │                                   full  │
//!     allocate + acquire_owned               mark_disposed + release + free
//!                                            handle ──▶ handle arena
//! ```
//!
//! Two arenas are kept apart: the physical buffers, addressed by
//! [`BufferRef`] and owned by the allocator, and the process-local
//! [`BufferHandle`]s, which are recycled independently of the buffers they
//! happen to wrap. Cached buffers stay in the owned state and stay
//! allocated; [`BufferPool::trim`] gives them back.

mod handle;
mod size_policy;
mod stats;

pub use handle::{BlockReader, BufferHandle, RentedBuffer};
pub use size_policy::SizePolicy;
pub use stats::PoolStats;

use crate::allocator::Allocator;
use crate::bucket::BufferRegion;
use crate::config::PoolConfig;
use crate::error::Result;
use crate::header::{BufferState, protocol_violation};
use crate::types::BufferRef;
use crossbeam_queue::ArrayQueue;
use stats::PoolCounters;
use std::sync::Arc;

/// Rents buffers to this process, caching returned ones for reuse.
///
/// Cloning is cheap and shares the caches.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    allocator: Arc<Allocator>,
    policy: SizePolicy,
    caches: Vec<ArrayQueue<Box<BufferHandle>>>,
    handles: ArrayQueue<Box<BufferHandle>>,
    counters: PoolCounters,
}

impl BufferPool {
    /// Create a pool over `allocator`.
    pub fn new(allocator: Arc<Allocator>, config: &PoolConfig) -> Self {
        let layout = allocator.storage().layout().clone();
        let caches = (0..=layout.max_bucket_index())
            .map(|_| ArrayQueue::new(config.cache_per_bucket.max(1)))
            .collect();
        Self {
            inner: Arc::new(PoolInner {
                allocator,
                policy: SizePolicy::new(layout),
                caches,
                handles: ArrayQueue::new(config.handle_arena_capacity.max(1)),
                counters: PoolCounters::default(),
            }),
        }
    }

    /// Rent a buffer with at least `min_size` payload bytes.
    ///
    /// # Errors
    /// `RequestTooLarge` and the allocator's capacity and transaction errors.
    pub fn rent(&self, min_size: usize) -> Result<RentedBuffer> {
        let inner = &self.inner;
        let bucket = inner.policy.bucket_for(min_size)?;
        PoolCounters::bump(&inner.counters.rents);

        if let Some(handle) = inner.caches[bucket as usize].pop() {
            match handle.region().cloned() {
                Some(region) => {
                    let word = region.header().load();
                    if !word.is(BufferState::Owned) {
                        protocol_violation("rent", "owned (cached)", word);
                    }
                    PoolCounters::bump(&inner.counters.cache_hits);
                    tracing::trace!(buffer = %region.buffer_ref(), "Rented cached buffer");
                    return Ok(RentedBuffer::new(region, handle, Arc::clone(inner)));
                }
                None => inner.park_handle(handle),
            }
        }

        PoolCounters::bump(&inner.counters.cache_misses);
        let r = inner.allocator.allocate(bucket)?;
        let region = match inner.allocator.storage().region(r) {
            Ok(region) => region,
            Err(e) => {
                if let Err(free_err) = inner.allocator.free(r) {
                    tracing::warn!(buffer = %r, error = %free_err, "Failed to free unmappable buffer");
                }
                return Err(e);
            }
        };
        region.header().acquire_owned();

        let mut handle = inner.handles.pop().unwrap_or_default();
        handle.attach(region.clone());
        tracing::debug!(buffer = %r, bucket, "Rented buffer from allocator");
        Ok(RentedBuffer::new(region, handle, Arc::clone(inner)))
    }

    /// Resolve a ref to its region.
    pub fn region(&self, r: BufferRef) -> Result<BufferRegion> {
        self.inner.allocator.storage().region(r)
    }

    /// Pin an indexed or packed block for reading.
    ///
    /// Returns `None` if the block has already been reclaimed.
    pub fn open_block(&self, r: BufferRef) -> Result<Option<BlockReader>> {
        Ok(BlockReader::pin(self.region(r)?))
    }

    /// Take back a block buffer that has been reset to the owned state.
    pub fn release_block(&self, r: BufferRef) -> Result<()> {
        let region = self.region(r)?;
        let word = region.header().load();
        if !word.is(BufferState::Owned) {
            protocol_violation("release_block", "owned", word);
        }
        let mut handle = self.inner.handles.pop().unwrap_or_default();
        handle.attach(region);
        self.inner.give_back(handle)
    }

    /// Free every cached buffer through the allocator. Returns how many were
    /// freed.
    pub fn trim(&self) -> Result<usize> {
        self.inner.trim()
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// The size policy used to pick buckets.
    #[must_use]
    pub fn size_policy(&self) -> &SizePolicy {
        &self.inner.policy
    }

    /// The allocator behind this pool.
    #[must_use]
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.inner.allocator
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl PoolInner {
    /// Return path for a handle that wraps an owned buffer.
    pub(crate) fn give_back(&self, handle: Box<BufferHandle>) -> Result<()> {
        let Some(region) = handle.region() else {
            self.park_handle(handle);
            return Ok(());
        };
        let word = region.header().load();
        if !word.is(BufferState::Owned) {
            protocol_violation("return", "owned", word);
        }
        let bucket = region.buffer_ref().bucket_index() as usize;

        match self.caches[bucket].push(handle) {
            Ok(()) => {
                PoolCounters::bump(&self.counters.returned_to_cache);
                Ok(())
            }
            Err(handle) => {
                PoolCounters::bump(&self.counters.returned_to_allocator);
                self.free_handle(handle)
            }
        }
    }

    /// Hand an owned buffer back to the allocator and park the handle.
    fn free_handle(&self, mut handle: Box<BufferHandle>) -> Result<()> {
        let Some(region) = handle.detach() else {
            self.park_handle(handle);
            return Ok(());
        };
        self.park_handle(handle);

        let header = region.header();
        header.mark_disposed();
        header.release();
        self.allocator.free(region.buffer_ref())
    }

    pub(crate) fn park_handle(&self, handle: Box<BufferHandle>) {
        // A full arena just lets the handle drop.
        let _ = self.handles.push(handle);
    }

    fn trim(&self) -> Result<usize> {
        let mut freed = 0;
        let mut first_err = None;
        for cache in &self.caches {
            while let Some(handle) = cache.pop() {
                match self.free_handle(handle) {
                    Ok(()) => freed += 1,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to free cached buffer");
                        first_err.get_or_insert(e);
                    }
                }
            }
        }
        if freed > 0 {
            tracing::debug!(freed, "Trimmed pool cache");
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(freed),
        }
    }

    fn stats(&self) -> PoolStats {
        let cached = self.caches.iter().map(ArrayQueue::len).sum();
        self.counters.snapshot(cached, self.handles.len())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Err(e) = self.trim() {
            tracing::warn!(error = %e, "Pool shutdown left cached buffers allocated");
        }
    }
}
