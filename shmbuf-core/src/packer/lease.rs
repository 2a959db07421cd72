//! Scoped packer lease.

use super::traits::PackerLocks;
use crate::types::{InstanceId, StreamId};
use std::time::Duration;

/// Holds a stream's packer lease and releases it on drop.
///
/// Failing to release is fatal: the stream would stay locked for the rest
/// of the lease with no one to finish it.
pub(super) struct LeaseGuard<'a> {
    locks: &'a dyn PackerLocks,
    stream: StreamId,
    holder: InstanceId,
    lease: Duration,
}

impl<'a> LeaseGuard<'a> {
    /// Try to take the lease. `Ok(None)` if another holder has it.
    pub fn acquire(
        locks: &'a dyn PackerLocks,
        stream: StreamId,
        holder: InstanceId,
        lease: Duration,
    ) -> crate::error::Result<Option<Self>> {
        if !locks.try_acquire(stream, holder, lease)? {
            return Ok(None);
        }
        Ok(Some(Self {
            locks,
            stream,
            holder,
            lease,
        }))
    }

    /// Extend the lease; `false` if it was lost.
    pub fn renew(&self) -> crate::error::Result<bool> {
        self.locks.renew(self.stream, self.holder, self.lease)
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.locks.release(self.stream, self.holder) {
            tracing::error!(stream = %self.stream, holder = %self.holder, error = %e, "Failed to release packer lease");
            panic!("failed to release packer lease on {}: {e}", self.stream);
        }
    }
}
