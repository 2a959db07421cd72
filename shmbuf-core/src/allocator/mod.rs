//! Transactional buffer allocator.
//!
//! Every allocate or free is one write transaction against the
//! [`AllocationTable`]. The table serializes all processes attached to the
//! store, so two live buffers never share a [`BufferRef`].
//!
//! The header of a buffer handed out by [`Allocator::allocate`] always reads
//! releasing+disposed, stamped with the allocating instance, whether the
//! buffer is new or comes off the free list.

mod capacity;
mod snapshot;
mod table;

pub use capacity::HIGH_UTILIZATION;
pub use snapshot::AllocationSnapshot;
pub use table::{ALLOCATED_TABLE, AllocationTable, DEFAULT_TABLE_MAP_SIZE, FREE_TABLE, RefTable};

use crate::bucket::BucketStorage;
use crate::config::AllocatorConfig;
use crate::error::{Result, StoreError};
use crate::header::BufferState;
use crate::types::{BufferRef, InstanceId, MAX_BUFFER_INDEX};
use capacity::CapacityTracker;
use heed::RwTxn;
use std::sync::Arc;

/// Allocates and frees buffers for one instance.
pub struct Allocator {
    table: AllocationTable,
    storage: Arc<BucketStorage>,
    owner: InstanceId,
    capacity: CapacityTracker,
    sync_new_buffers: bool,
}

impl Allocator {
    /// Create an allocator over a shared table and bucket storage.
    pub fn new(
        table: AllocationTable,
        storage: Arc<BucketStorage>,
        owner: InstanceId,
        config: &AllocatorConfig,
    ) -> Self {
        Self {
            table,
            storage,
            owner,
            capacity: CapacityTracker::new(config.max_total_bytes, config.capacity_check_interval),
            sync_new_buffers: config.sync_new_buffers,
        }
    }

    /// Instance stamped into buffers this allocator hands out.
    #[must_use]
    pub fn owner(&self) -> InstanceId {
        self.owner
    }

    /// The allocation table.
    #[must_use]
    pub fn table(&self) -> &AllocationTable {
        &self.table
    }

    /// Bucket storage backing the buffers.
    #[must_use]
    pub fn storage(&self) -> &Arc<BucketStorage> {
        &self.storage
    }

    /// Allocate a buffer from `bucket`.
    ///
    /// Reuses the lowest free index if there is one, otherwise issues one
    /// past the highest allocated index. A new buffer's transaction is
    /// forced to disk when `sync_new_buffers` is set.
    ///
    /// # Errors
    /// `InvalidBucketIndex`, capacity errors (`CapacityExceeded`,
    /// `BucketExhausted`, `DiskSpace`), or transaction errors. The
    /// transaction is aborted in every error case.
    pub fn allocate(&self, bucket: u8) -> Result<BufferRef> {
        self.storage.layout().check_bucket(bucket)?;

        let (r, fresh) = self.table.write(|wtxn| self.allocate_in(wtxn, bucket))?;
        if fresh && self.sync_new_buffers {
            self.table.sync()?;
        }

        tracing::debug!(buffer = %r, fresh, owner = %self.owner, "Allocated buffer");
        Ok(r)
    }

    fn allocate_in(&self, wtxn: &mut RwTxn<'_>, bucket: u8) -> Result<(BufferRef, bool)> {
        let layout = self.storage.layout();
        let slot_len = layout.slot_len(bucket);

        if self.capacity.should_check(slot_len) {
            let used = self.table.allocated_bytes(wtxn, layout)?;
            self.capacity.check(used, slot_len)?;
        }

        if let Some(r) = self.table.first_free(wtxn, bucket)? {
            self.table.take_free(wtxn, r)?;
            // SAFETY: refs in the table were validated when first issued.
            let region = unsafe { self.storage.region_unchecked(r)? };
            region.header().restamp(self.owner);
            return Ok((r, false));
        }

        let index = match self.table.last_allocated(wtxn, bucket)? {
            Some(last) => last.buffer_index() + 1,
            None => 1,
        };
        if index > MAX_BUFFER_INDEX {
            return Err(StoreError::BucketExhausted { bucket });
        }

        let r = BufferRef::new(bucket, index)?;
        self.table.insert_allocated(wtxn, r)?;
        let region = self.storage.region(r)?;
        region.header().init_fresh(self.owner);
        Ok((r, true))
    }

    /// Return `r` to the free list.
    ///
    /// The caller must already have moved the header to releasing+disposed.
    ///
    /// # Errors
    /// `BufferNotAllocated` if `r` is not in the allocated table; both
    /// tables are left unchanged.
    pub fn free(&self, r: BufferRef) -> Result<()> {
        let r = r.clear_flag();
        self.storage.layout().check(r)?;

        self.table.write(|wtxn| {
            if self.table.move_to_free(wtxn, r)? {
                Ok(())
            } else {
                Err(StoreError::BufferNotAllocated { buffer_ref: r })
            }
        })?;

        tracing::debug!(buffer = %r, "Freed buffer");
        Ok(())
    }

    /// Repair a buffer whose holder died between releasing its header and
    /// freeing it.
    ///
    /// Frees `r` only if its header reads releasing+disposed, it is not
    /// already free, and it is still allocated. Returns whether it was freed.
    pub fn retry_return(&self, r: BufferRef) -> Result<bool> {
        let r = r.clear_flag();
        let region = self.storage.region(r)?;

        let repaired = self.table.write(|wtxn| {
            if !region.header().load().is(BufferState::ReleasingDisposed) {
                return Ok(false);
            }
            if self.table.contains(wtxn, self.table.free(), r)? {
                return Ok(false);
            }
            self.table.move_to_free(wtxn, r)
        })?;

        if repaired {
            tracing::info!(buffer = %r, "Returned stranded buffer to the free list");
        }
        Ok(repaired)
    }

    /// Repair every stranded buffer, optionally only those stamped by `owner`.
    ///
    /// A buffer between allocation and its first rent also reads
    /// releasing+disposed, so an unfiltered repair must only run when no
    /// other instance is allocating.
    pub fn repair_all(&self, owner: Option<InstanceId>) -> Result<Vec<BufferRef>> {
        let repaired = self.table.write(|wtxn| {
            let allocated = self.table.collect(wtxn, self.table.allocated())?;
            let mut repaired = Vec::new();
            for r in allocated.into_values().flatten() {
                let region = self.storage.region(r)?;
                let word = region.header().load();
                if !word.is(BufferState::ReleasingDisposed) {
                    continue;
                }
                if owner.is_some_and(|o| o != word.owner) {
                    continue;
                }
                if self.table.contains(wtxn, self.table.free(), r)? {
                    continue;
                }
                if self.table.move_to_free(wtxn, r)? {
                    repaired.push(r);
                }
            }
            Ok(repaired)
        })?;

        tracing::info!(count = repaired.len(), owner = ?owner, "Repair pass complete");
        Ok(repaired)
    }

    /// Copy of both tables.
    pub fn snapshot(&self) -> Result<AllocationSnapshot> {
        self.table.read(|rtxn| {
            Ok(AllocationSnapshot {
                allocated: self.table.collect(rtxn, self.table.allocated())?,
                free: self.table.collect(rtxn, self.table.free())?,
            })
        })
    }

    /// Human-readable dump of both tables.
    pub fn dump(&self) -> Result<String> {
        Ok(self.snapshot()?.to_string())
    }

    /// Bytes currently held by allocated buffers.
    pub fn allocated_bytes(&self) -> Result<u64> {
        self.table
            .read(|rtxn| self.table.allocated_bytes(rtxn, self.storage.layout()))
    }

    /// Number of capacity recomputations so far.
    #[must_use]
    pub fn capacity_checks(&self) -> u64 {
        self.capacity.checks()
    }

    /// Utilization seen by the last capacity recomputation.
    #[must_use]
    pub fn last_utilization(&self) -> f64 {
        self.capacity.utilization()
    }

    /// Configured budget in bytes.
    #[must_use]
    pub fn budget(&self) -> u64 {
        self.capacity.budget()
    }
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("owner", &self.owner)
            .field("table", &self.table)
            .field("budget", &self.capacity.budget())
            .finish_non_exhaustive()
    }
}
