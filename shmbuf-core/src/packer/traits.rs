//! Collaborators the packer depends on.

use crate::error::Result;
use crate::types::{BufferRef, InstanceId, StreamId};
use std::time::Duration;

/// Durable store for packed blocks, keyed by stream and first version.
pub trait BlockStorage: Send + Sync {
    /// Persist a packed frame.
    fn put_block(&self, stream: StreamId, first_version: u64, frame: Vec<u8>) -> Result<()>;

    /// Load a packed frame.
    fn get_block(&self, stream: StreamId, first_version: u64) -> Result<Option<Vec<u8>>>;

    /// Highest first-version persisted for `stream`.
    fn last_version(&self, stream: StreamId) -> Result<Option<u64>>;
}

/// A block discoverable through the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexedBlock {
    /// Stream the block belongs to.
    pub stream: StreamId,
    /// Version of the block's first record.
    pub first_version: u64,
    /// Buffer holding the block.
    pub buffer_ref: BufferRef,
    /// Bytes of the payload used by the block.
    pub len: usize,
}

/// The index that makes blocks discoverable to readers.
pub trait BlockIndex: Send + Sync {
    /// Streams with at least one indexed block.
    fn pending_streams(&self) -> Result<Vec<StreamId>>;

    /// Oldest indexed block of `stream`.
    fn next_block(&self, stream: StreamId) -> Result<Option<IndexedBlock>>;

    /// Drop a block from the index.
    fn remove(&self, stream: StreamId, first_version: u64) -> Result<()>;

    /// Whether the stream's blocks are persisted before reclaiming.
    fn retains_history(&self, stream: StreamId) -> bool;
}

/// Per-stream leased locks held by packers.
pub trait PackerLocks: Send + Sync {
    /// Take the lease on `stream` for `holder`. `false` if another holder
    /// has an unexpired lease.
    fn try_acquire(&self, stream: StreamId, holder: InstanceId, lease: Duration) -> Result<bool>;

    /// Extend a held lease. `false` if the lease was lost.
    fn renew(&self, stream: StreamId, holder: InstanceId, lease: Duration) -> Result<bool>;

    /// Give up the lease.
    fn release(&self, stream: StreamId, holder: InstanceId) -> Result<()>;
}
