//! Strongly-typed identifiers for processes and streams.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies the process (or worker) that owns a buffer.
///
/// Stamped into the high half of every buffer header by the allocator, so an
/// administrator can tell which instance left a buffer behind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
#[repr(transparent)]
pub struct InstanceId(u32);

impl InstanceId {
    /// Create an instance ID from a raw value.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// The instance ID of the current process (its process id).
    #[must_use]
    pub fn current() -> Self {
        Self(std::process::id())
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance_{}", self.0)
    }
}

impl From<u32> for InstanceId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Identifier of an append-only stream whose blocks live in pool buffers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StreamId(u64);

impl StreamId {
    /// Create a stream ID from a raw value.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream_{}", self.0)
    }
}

impl From<u64> for StreamId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_display() {
        assert_eq!(InstanceId::new(42).to_string(), "instance_42");
        assert_eq!(InstanceId::current().as_u32(), std::process::id());
    }

    #[test]
    fn stream_id_roundtrip() {
        let id = StreamId::from(9u64);
        assert_eq!(id.as_u64(), 9);
        assert_eq!(id.to_string(), "stream_9");
    }
}
