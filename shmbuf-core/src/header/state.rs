//! Header word layout and lifecycle states.

use crate::types::InstanceId;
use std::fmt;

/// Size of the buffer header in bytes.
pub const HEADER_SIZE: usize = 8;

/// Counter value stored while a buffer is releasing+disposed.
pub const DISPOSED_SENTINEL: u32 = 0x00FF_FFFF;

/// Highest reference count a header can hold.
pub const MAX_REFS: u32 = DISPOSED_SENTINEL - 1;

const COUNTER_MASK: u32 = 0x00FF_FFFF;
const FLAGS_SHIFT: u32 = 24;

/// Individual flag bits of the header's high byte.
pub mod flags {
    /// Buffer has been given up by its holder.
    pub const DISPOSED: u8 = 0x01;
    /// Buffer is on its way back to the allocator.
    pub const RELEASING: u8 = 0x02;
    /// Buffer is held by a consumer.
    pub const OWNED: u8 = 0x04;
    /// Buffer holds an initialized append-only block.
    pub const STREAM_BLOCK: u8 = 0x08;
    /// Block is discoverable through the block index.
    pub const INDEXED: u8 = 0x10;
    /// Block has been durably persisted by the packer.
    pub const PACKED: u8 = 0x20;
}

/// Legal header states. Any other flags byte is shared-memory corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BufferState {
    /// Free or freshly allocated, waiting for a consumer.
    ReleasingDisposed = flags::RELEASING | flags::DISPOSED,
    /// Held by a consumer.
    Owned = flags::OWNED,
    /// Held, but the consumer has given it up.
    OwnedDisposed = flags::OWNED | flags::DISPOSED,
    /// Sealed block, not yet indexed.
    StreamBlock = flags::OWNED | flags::STREAM_BLOCK,
    /// Block visible through the index; counter is its reference count.
    IndexedStreamBlock = flags::OWNED | flags::STREAM_BLOCK | flags::INDEXED,
    /// Indexed block whose content has been persisted.
    PackedStreamBlock = flags::OWNED | flags::STREAM_BLOCK | flags::INDEXED | flags::PACKED,
}

impl BufferState {
    /// Decode a flags byte.
    #[must_use]
    pub const fn from_flags(bits: u8) -> Option<Self> {
        match bits {
            0x03 => Some(Self::ReleasingDisposed),
            0x04 => Some(Self::Owned),
            0x05 => Some(Self::OwnedDisposed),
            0x0C => Some(Self::StreamBlock),
            0x1C => Some(Self::IndexedStreamBlock),
            0x3C => Some(Self::PackedStreamBlock),
            _ => None,
        }
    }

    /// The flags byte for this state.
    #[must_use]
    pub const fn flags(self) -> u8 {
        self as u8
    }

    /// Whether readers may pin a block in this state.
    #[must_use]
    pub const fn is_readable(self) -> bool {
        matches!(self, Self::IndexedStreamBlock | Self::PackedStreamBlock)
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReleasingDisposed => "releasing+disposed",
            Self::Owned => "owned",
            Self::OwnedDisposed => "owned+disposed",
            Self::StreamBlock => "stream-block",
            Self::IndexedStreamBlock => "indexed-stream-block",
            Self::PackedStreamBlock => "packed-stream-block",
        };
        f.write_str(name)
    }
}

/// Decoded value of the 8-byte header.
///
/// In memory the header is one little-endian `u64`: the low four bytes hold
/// `flags << 24 | counter`, the high four bytes the owning instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderWord {
    /// Flags (bits 24..32) and counter (bits 0..24).
    pub flags_counter: u32,
    /// Instance that last took the buffer from the allocator.
    pub owner: InstanceId,
}

impl HeaderWord {
    /// A header of all zeroes, as found in a never-touched sparse slot.
    pub const ZERO: Self = Self {
        flags_counter: 0,
        owner: InstanceId::new(0),
    };

    /// Build a word from a state, counter and owner.
    #[must_use]
    pub const fn new(state: BufferState, count: u32, owner: InstanceId) -> Self {
        Self {
            flags_counter: ((state.flags() as u32) << FLAGS_SHIFT) | (count & COUNTER_MASK),
            owner,
        }
    }

    /// Unpack from the atomic representation.
    #[must_use]
    pub const fn from_u64(raw: u64) -> Self {
        Self {
            flags_counter: raw as u32,
            owner: InstanceId::new((raw >> 32) as u32),
        }
    }

    /// Pack into the atomic representation.
    #[must_use]
    pub const fn to_u64(self) -> u64 {
        (self.flags_counter as u64) | ((self.owner.as_u32() as u64) << 32)
    }

    /// Raw flags byte.
    #[must_use]
    pub const fn flag_bits(self) -> u8 {
        (self.flags_counter >> FLAGS_SHIFT) as u8
    }

    /// Decoded state, `None` if the flags byte is not a legal state.
    #[must_use]
    pub const fn state(self) -> Option<BufferState> {
        BufferState::from_flags(self.flag_bits())
    }

    /// Counter value (reference count, or the disposed sentinel).
    #[must_use]
    pub const fn count(self) -> u32 {
        self.flags_counter & COUNTER_MASK
    }

    /// Same owner, new state and counter.
    #[must_use]
    pub const fn with_state(self, state: BufferState, count: u32) -> Self {
        Self::new(state, count, self.owner)
    }

    /// Same state and counter, new owner.
    #[must_use]
    pub const fn with_owner(self, owner: InstanceId) -> Self {
        Self {
            flags_counter: self.flags_counter,
            owner,
        }
    }

    /// `true` if the word is in `state`.
    #[must_use]
    pub fn is(self, state: BufferState) -> bool {
        self.state() == Some(state)
    }
}

impl fmt::Display for HeaderWord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state() {
            Some(state) => write!(f, "{state}")?,
            None => write!(f, "illegal(0x{:02x})", self.flag_bits())?,
        }
        write!(f, " count={} owner={}", self.count(), self.owner)
    }
}
