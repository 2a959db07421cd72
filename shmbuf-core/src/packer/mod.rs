//! Packer: compresses indexed blocks, persists them, and reclaims their
//! buffers.
//!
//! For each block of a stream, oldest first:
//!
//! ```text
//! indexed ──(retains history: compress + put_block)──▶ mark_packed ──▶ packed
//! packed  ──try_unpack──▶ stream-block ──▶ index.remove ──▶ reset_block ──▶ pool
//!            │
//!            └─ readers still pinned: leave it packed, retry next pass
//! ```
//!
//! A stream that does not retain history skips the persist step, so its
//! blocks are deleted rather than packed. Only one packer works on a stream
//! at a time, guarded by a per-stream lease.

mod frame;
mod lease;
mod memory;
mod service;
mod traits;

pub use frame::{pack_frame, unpack_frame};
pub use memory::{LocalPackerLocks, MemoryBlockIndex, MemoryBlockStorage};
pub use service::PackerService;
pub use traits::{BlockIndex, BlockStorage, IndexedBlock, PackerLocks};

use crate::config::PackerConfig;
use crate::error::{Result, StoreError};
use crate::header::{BufferState, protocol_violation};
use crate::pool::BufferPool;
use crate::types::{InstanceId, StreamId};
use lease::LeaseGuard;
use std::sync::Arc;
use std::time::Duration;

/// Counters from one or more pack runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    /// Streams visited.
    pub streams: u64,
    /// Streams skipped because another packer holds the lease.
    pub skipped: u64,
    /// Streams that failed.
    pub failed: u64,
    /// Blocks persisted and reclaimed.
    pub packed: u64,
    /// Blocks reclaimed without persisting.
    pub deleted: u64,
    /// Blocks left in place because readers still pin them.
    pub deferred: u64,
    /// Uncompressed bytes persisted.
    pub bytes_in: u64,
    /// Compressed frame bytes persisted.
    pub bytes_out: u64,
}

impl PackStats {
    /// Add another run's counters.
    pub fn merge(&mut self, other: &PackStats) {
        self.streams += other.streams;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.packed += other.packed;
        self.deleted += other.deleted;
        self.deferred += other.deferred;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
    }
}

enum BlockOutcome {
    Reclaimed,
    Deferred,
}

/// Packs the blocks of indexed streams.
pub struct Packer {
    pool: BufferPool,
    storage: Arc<dyn BlockStorage>,
    index: Arc<dyn BlockIndex>,
    locks: Arc<dyn PackerLocks>,
    holder: InstanceId,
    lease: Duration,
    max_blocks_per_lease: usize,
}

impl Packer {
    /// Create a packer that returns reclaimed buffers to `pool`.
    pub fn new(
        pool: BufferPool,
        storage: Arc<dyn BlockStorage>,
        index: Arc<dyn BlockIndex>,
        locks: Arc<dyn PackerLocks>,
        config: &PackerConfig,
    ) -> Self {
        let holder = pool.allocator().owner();
        Self {
            pool,
            storage,
            index,
            locks,
            holder,
            lease: config.lease(),
            max_blocks_per_lease: config.max_blocks_per_lease.max(1),
        }
    }

    /// Instance recorded as the lease holder.
    #[must_use]
    pub fn holder(&self) -> InstanceId {
        self.holder
    }

    /// Streams the index reports as having blocks.
    pub fn pending_streams(&self) -> Result<Vec<StreamId>> {
        self.index.pending_streams()
    }

    /// Pack one stream under its lease.
    ///
    /// Processes up to `max_blocks_per_lease` blocks, oldest first, and
    /// stops early at a block that readers still pin.
    pub fn pack_stream(&self, stream: StreamId) -> Result<PackStats> {
        let mut stats = PackStats {
            streams: 1,
            ..PackStats::default()
        };

        let Some(lease) = LeaseGuard::acquire(self.locks.as_ref(), stream, self.holder, self.lease)?
        else {
            tracing::debug!(%stream, "Packer lease held elsewhere, skipping stream");
            stats.skipped = 1;
            return Ok(stats);
        };

        let retain = self.index.retains_history(stream);
        for processed in 0..self.max_blocks_per_lease {
            if processed > 0 && !lease.renew()? {
                tracing::warn!(%stream, "Lost packer lease, stopping stream");
                break;
            }
            let Some(block) = self.index.next_block(stream)? else {
                break;
            };
            match self.pack_block(&block, retain, &mut stats)? {
                BlockOutcome::Reclaimed => {}
                BlockOutcome::Deferred => {
                    stats.deferred += 1;
                    tracing::debug!(%stream, version = block.first_version, "Block pinned by readers, deferring");
                    break;
                }
            }
        }

        drop(lease);
        Ok(stats)
    }

    fn pack_block(
        &self,
        block: &IndexedBlock,
        retain: bool,
        stats: &mut PackStats,
    ) -> Result<BlockOutcome> {
        let region = self.pool.region(block.buffer_ref)?;
        let header = region.header();
        let word = header.load();

        let unpacked = match word.state() {
            Some(BufferState::IndexedStreamBlock) => {
                if retain {
                    if block.len > region.data_len() {
                        return Err(StoreError::CorruptBlock {
                            cause: format!(
                                "block {}@{} claims {} bytes in a {}-byte buffer",
                                block.stream,
                                block.first_version,
                                block.len,
                                region.data_len()
                            ),
                        });
                    }
                    // SAFETY: an indexed block is immutable.
                    let content = unsafe { &region.data()[..block.len] };
                    let frame = pack_frame(content);
                    stats.bytes_in += content.len() as u64;
                    stats.bytes_out += frame.len() as u64;
                    self.storage
                        .put_block(block.stream, block.first_version, frame)
                        .map_err(|e| StoreError::PackFailed {
                            stream: block.stream,
                            cause: e.to_string(),
                        })?;
                }
                header.mark_packed();
                header.try_unpack()
            }
            // Persisted on an earlier pass, waiting for readers to leave.
            Some(BufferState::PackedStreamBlock) => header.try_unpack(),
            // Unpacked on an earlier pass whose index removal failed.
            Some(BufferState::StreamBlock) => true,
            _ => protocol_violation("pack", "indexed, packed or stream-block", word),
        };

        if !unpacked {
            return Ok(BlockOutcome::Deferred);
        }

        self.index.remove(block.stream, block.first_version)?;
        header.reset_block();
        self.pool.release_block(block.buffer_ref)?;

        if retain {
            stats.packed += 1;
        } else {
            stats.deleted += 1;
        }
        tracing::debug!(
            stream = %block.stream,
            version = block.first_version,
            buffer = %block.buffer_ref,
            persisted = retain,
            "Reclaimed block"
        );
        Ok(BlockOutcome::Reclaimed)
    }

    /// Pack every pending stream once. Per-stream failures are logged and
    /// counted, not returned.
    pub fn run_pass(&self) -> Result<PackStats> {
        let mut total = PackStats::default();
        for stream in self.index.pending_streams()? {
            match self.pack_stream(stream) {
                Ok(stats) => total.merge(&stats),
                Err(e) => {
                    tracing::warn!(%stream, error = %e, "Packing stream failed");
                    total.streams += 1;
                    total.failed += 1;
                }
            }
        }
        Ok(total)
    }
}

impl std::fmt::Debug for Packer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packer")
            .field("holder", &self.holder)
            .field("lease", &self.lease)
            .field("max_blocks_per_lease", &self.max_blocks_per_lease)
            .finish_non_exhaustive()
    }
}
