//! The 8-byte atomic header embedded in every buffer.
//!
//! The header is the only fine-grained mutable state shared between
//! processes. Every transition is a compare-and-swap over the packed 64-bit
//! word:
//!
//! ```text
//! releasing+disposed ──acquire_owned──▶ owned ──publish_block──▶ stream-block
//!        ▲                               │  ▲                       │    ▲
//!     release                 mark_disposed  reset_block    mark_indexed  try_unpack
//!        │                               ▼  │                       ▼    │
//!  owned+disposed ◀──────────────────────┘  └──── indexed ──mark_packed──▶ packed
//! ```
//!
//! A transition that observes an unexpected prior state calls
//! [`protocol_violation`]. The two exceptions are [`BufferHeader::try_unpack`]
//! and [`BufferHeader::try_add_ref`], which report failure to the caller.
//!
//! Flags are flipped only after the payload is initialized, with release
//! ordering on the store and acquire ordering on the load, so a reader that
//! observes a block state may trust the block's content.

mod state;
mod violation;

pub use state::{
    BufferState, DISPOSED_SENTINEL, HEADER_SIZE, HeaderWord, MAX_REFS, flags,
};
pub use violation::protocol_violation;

use crate::types::InstanceId;
use std::sync::atomic::{AtomicU64, Ordering};

/// An atomic view of a buffer header.
///
/// Usually borrowed from a mapped bucket file through
/// [`crate::bucket::BufferRegion::header`]; [`BufferHeader::new`] creates a
/// heap-owned header for callers that need one outside shared memory.
#[repr(transparent)]
pub struct BufferHeader(AtomicU64);

impl BufferHeader {
    /// Create a header holding `word`.
    #[must_use]
    pub const fn new(word: HeaderWord) -> Self {
        Self(AtomicU64::new(word.to_u64()))
    }

    /// View the 8 bytes at `ptr` as a header.
    ///
    /// # Safety
    /// `ptr` must be 8-byte aligned, valid for reads and writes for `'a`, and
    /// only accessed atomically while the reference lives.
    #[must_use]
    pub unsafe fn from_ptr<'a>(ptr: *mut u8) -> &'a Self {
        // SAFETY: BufferHeader is repr(transparent) over AtomicU64; the caller
        // guarantees alignment and validity.
        unsafe { &*ptr.cast::<Self>() }
    }

    /// Current header value.
    #[must_use]
    pub fn load(&self) -> HeaderWord {
        HeaderWord::from_u64(self.0.load(Ordering::Acquire))
    }

    /// Current state, `None` if the flags byte is illegal.
    #[must_use]
    pub fn state(&self) -> Option<BufferState> {
        self.load().state()
    }

    /// Current counter value.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.load().count()
    }

    /// Current owning instance.
    #[must_use]
    pub fn owner(&self) -> InstanceId {
        self.load().owner
    }

    // =========================================================================
    // Allocator transitions
    // =========================================================================

    /// Stamp a brand-new buffer as releasing+disposed for `owner`.
    ///
    /// Runs inside the allocation transaction, so no other writer can exist
    /// yet; a failed CAS is fatal.
    pub fn init_fresh(&self, owner: InstanceId) {
        let current = self.0.load(Ordering::Acquire);
        let next = HeaderWord::new(BufferState::ReleasingDisposed, DISPOSED_SENTINEL, owner);
        if let Err(observed) =
            self.0
                .compare_exchange(current, next.to_u64(), Ordering::AcqRel, Ordering::Acquire)
        {
            protocol_violation(
                "init_fresh",
                "no concurrent writer",
                HeaderWord::from_u64(observed),
            );
        }
    }

    /// Re-stamp the owner of a buffer leaving the free list.
    ///
    /// The header must show releasing+disposed; anything else means the
    /// allocation table and shared memory disagree.
    pub fn restamp(&self, owner: InstanceId) {
        self.update("restamp", "releasing+disposed", |w| {
            w.is(BufferState::ReleasingDisposed)
                .then(|| w.with_owner(owner))
        });
    }

    // =========================================================================
    // Pool transitions
    // =========================================================================

    /// releasing+disposed → owned, counter reset to 0.
    pub fn acquire_owned(&self) {
        self.update("acquire_owned", "releasing+disposed", |w| {
            w.is(BufferState::ReleasingDisposed)
                .then(|| w.with_state(BufferState::Owned, 0))
        });
    }

    /// owned → owned+disposed.
    pub fn mark_disposed(&self) {
        self.update("mark_disposed", "owned", |w| {
            w.is(BufferState::Owned)
                .then(|| w.with_state(BufferState::OwnedDisposed, w.count()))
        });
    }

    /// owned+disposed → releasing+disposed.
    pub fn release(&self) {
        self.update("release", "owned+disposed", |w| {
            w.is(BufferState::OwnedDisposed)
                .then(|| w.with_state(BufferState::ReleasingDisposed, DISPOSED_SENTINEL))
        });
    }

    // =========================================================================
    // Block transitions
    // =========================================================================

    /// owned → stream-block. Call only after the block content is written.
    pub fn publish_block(&self) {
        self.update("publish_block", "owned", |w| {
            w.is(BufferState::Owned)
                .then(|| w.with_state(BufferState::StreamBlock, 0))
        });
    }

    /// stream-block → indexed, returning the resulting reference count.
    ///
    /// The index holds one reference; `with_reader` adds one for a reader
    /// that re-rented the block concurrently. If the transition was already
    /// applied by the other path, a reader increments instead of failing.
    pub fn mark_indexed(&self, with_reader: bool) -> u32 {
        let initial = if with_reader { 2 } else { 1 };
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let word = HeaderWord::from_u64(current);
            let next = match word.state() {
                Some(BufferState::StreamBlock) => {
                    word.with_state(BufferState::IndexedStreamBlock, initial)
                }
                Some(BufferState::IndexedStreamBlock) if !with_reader => return word.count(),
                Some(BufferState::IndexedStreamBlock) if word.count() < MAX_REFS => {
                    word.with_state(BufferState::IndexedStreamBlock, word.count() + 1)
                }
                _ => protocol_violation("mark_indexed", "stream-block", word),
            };
            match self.0.compare_exchange_weak(
                current,
                next.to_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next.count(),
                Err(observed) => current = observed,
            }
        }
    }

    /// Pin an indexed or packed block.
    pub fn add_ref(&self) {
        self.update("add_ref", "indexed or packed with free count", |w| match w.state() {
            Some(s) if s.is_readable() && w.count() < MAX_REFS => {
                Some(w.with_state(s, w.count() + 1))
            }
            _ => None,
        });
    }

    /// Pin a block if it is still readable; `false` if it has been reclaimed.
    pub fn try_add_ref(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let word = HeaderWord::from_u64(current);
            let next = match word.state() {
                Some(s) if s.is_readable() && word.count() >= 1 && word.count() < MAX_REFS => {
                    word.with_state(s, word.count() + 1)
                }
                _ => return false,
            };
            match self.0.compare_exchange_weak(
                current,
                next.to_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Unpin a block. The index's own reference cannot be dropped here.
    pub fn remove_ref(&self) {
        self.update("remove_ref", "indexed or packed with count > 1", |w| {
            match w.state() {
                Some(s) if s.is_readable() && w.count() > 1 => {
                    Some(w.with_state(s, w.count() - 1))
                }
                _ => None,
            }
        });
    }

    /// indexed → packed, count preserved.
    pub fn mark_packed(&self) {
        self.update("mark_packed", "indexed", |w| {
            w.is(BufferState::IndexedStreamBlock)
                .then(|| w.with_state(BufferState::PackedStreamBlock, w.count()))
        });
    }

    /// packed → stream-block when only the index reference remains.
    ///
    /// Returns `false` while readers still pin the block.
    pub fn try_unpack(&self) -> bool {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let word = HeaderWord::from_u64(current);
            match (word.state(), word.count()) {
                (Some(BufferState::PackedStreamBlock), 1) => {}
                (Some(BufferState::PackedStreamBlock), n) if n > 1 => return false,
                _ => protocol_violation("try_unpack", "packed with count >= 1", word),
            }
            let next = word.with_state(BufferState::StreamBlock, 0);
            match self.0.compare_exchange_weak(
                current,
                next.to_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// stream-block (or an unpinned indexed block) → owned, ready for reuse.
    pub fn reset_block(&self) {
        self.update("reset_block", "stream-block or indexed with count <= 1", |w| {
            match w.state() {
                Some(BufferState::StreamBlock) => Some(w.with_state(BufferState::Owned, 0)),
                Some(BufferState::IndexedStreamBlock) if w.count() <= 1 => {
                    Some(w.with_state(BufferState::Owned, 0))
                }
                _ => None,
            }
        });
    }

    /// CAS loop that retries while `next` accepts the observed word.
    ///
    /// A concurrent counter change is retried against the fresh value; a
    /// state the closure rejects is a protocol violation.
    fn update<F>(&self, op: &str, expected: &str, next: F) -> HeaderWord
    where
        F: Fn(HeaderWord) -> Option<HeaderWord>,
    {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let word = HeaderWord::from_u64(current);
            let Some(target) = next(word) else {
                protocol_violation(op, expected, word);
            };
            match self.0.compare_exchange_weak(
                current,
                target.to_u64(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return target,
                Err(observed) => current = observed,
            }
        }
    }
}

impl std::fmt::Debug for BufferHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferHeader({})", self.load())
    }
}
