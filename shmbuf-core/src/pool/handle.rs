//! Process-local handles over shared buffers.

use super::PoolInner;
use crate::bucket::BufferRegion;
use crate::error::Result;
use crate::header::BufferHeader;
use crate::types::BufferRef;
use std::sync::Arc;

/// A reusable process-local wrapper.
///
/// A handle's lifetime is unrelated to any physical buffer: it is attached
/// to a buffer on rent, detached when the buffer goes back to the allocator,
/// and parked in the pool's handle arena until the next rent.
#[derive(Debug, Default)]
pub struct BufferHandle {
    region: Option<BufferRegion>,
    attachments: u64,
}

impl BufferHandle {
    pub(super) fn attach(&mut self, region: BufferRegion) {
        self.region = Some(region);
        self.attachments += 1;
    }

    pub(super) fn detach(&mut self) -> Option<BufferRegion> {
        self.region.take()
    }

    pub(super) fn region(&self) -> Option<&BufferRegion> {
        self.region.as_ref()
    }

    /// How many buffers this handle has wrapped so far.
    #[must_use]
    pub fn attachments(&self) -> u64 {
        self.attachments
    }
}

/// Exclusive, temporary ownership of one buffer (header state owned).
///
/// Dropping the buffer returns it to the pool: to the per-process cache if
/// there is room, otherwise through the allocator to the free list.
pub struct RentedBuffer {
    region: BufferRegion,
    handle: Option<Box<BufferHandle>>,
    pool: Arc<PoolInner>,
}

impl RentedBuffer {
    pub(super) fn new(region: BufferRegion, handle: Box<BufferHandle>, pool: Arc<PoolInner>) -> Self {
        Self {
            region,
            handle: Some(handle),
            pool,
        }
    }

    /// Identifier of the underlying buffer.
    #[must_use]
    pub fn buffer_ref(&self) -> BufferRef {
        self.region.buffer_ref()
    }

    /// Payload length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.region.data_len()
    }

    /// Whether the payload is empty. Never true for a real slot.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The shared header.
    #[must_use]
    pub fn header(&self) -> &BufferHeader {
        self.region.header()
    }

    /// The underlying region.
    #[must_use]
    pub fn region(&self) -> &BufferRegion {
        &self.region
    }

    /// Number of buffers the wrapping handle has held, this one included.
    #[must_use]
    pub fn handle_attachments(&self) -> u64 {
        self.handle.as_ref().map_or(0, |h| h.attachments())
    }

    /// The payload.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the owned state excludes every other writer.
        unsafe { self.region.data() }
    }

    /// The payload, mutably.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the owned state excludes every other accessor, and the
        // returned slice borrows `self` mutably.
        unsafe { self.region.data_mut() }
    }

    /// Publish the content as a stream block and give up the handle.
    ///
    /// The buffer stays allocated; from here on it is governed by the block
    /// states and comes back through [`super::BufferPool::release_block`].
    pub fn seal_block(mut self) -> BufferRef {
        self.header().publish_block();
        if let Some(mut handle) = self.handle.take() {
            handle.detach();
            self.pool.park_handle(handle);
        }
        self.buffer_ref()
    }

    /// Return the buffer now, reporting allocator errors.
    pub fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self.pool.give_back(handle),
            None => Ok(()),
        }
    }
}

impl Drop for RentedBuffer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let buffer = self.buffer_ref();
            if let Err(e) = self.pool.give_back(handle) {
                tracing::warn!(%buffer, error = %e, "Failed to return buffer");
            }
        }
    }
}

impl std::fmt::Debug for RentedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RentedBuffer")
            .field("buffer_ref", &self.buffer_ref())
            .field("len", &self.len())
            .field("header", self.header())
            .finish()
    }
}

/// A reader's pin on an indexed or packed block.
///
/// Holds one reference in the block header; dropping the reader releases it.
pub struct BlockReader {
    region: BufferRegion,
}

impl BlockReader {
    /// Pin the block in `region`, or `None` if it is no longer readable.
    pub(super) fn pin(region: BufferRegion) -> Option<Self> {
        region.header().try_add_ref().then_some(Self { region })
    }

    /// Identifier of the block's buffer.
    #[must_use]
    pub fn buffer_ref(&self) -> BufferRef {
        self.region.buffer_ref()
    }

    /// The block's shared header.
    #[must_use]
    pub fn header(&self) -> &BufferHeader {
        self.region.header()
    }

    /// The block content.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: a published block is immutable while readers pin it.
        unsafe { self.region.data() }
    }
}

impl Drop for BlockReader {
    fn drop(&mut self) {
        self.region.header().remove_ref();
    }
}

impl std::fmt::Debug for BlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReader")
            .field("buffer_ref", &self.buffer_ref())
            .field("header", self.header())
            .finish()
    }
}
