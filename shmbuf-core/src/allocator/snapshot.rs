//! Point-in-time copy of the allocation table.

use crate::types::BufferRef;
use std::collections::BTreeMap;
use std::fmt;

/// Both tables as seen by one read transaction.
///
/// The `Display` form is a human-readable dump; it is not a stable format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationSnapshot {
    /// Live buffers by bucket, in index order.
    pub allocated: BTreeMap<u8, Vec<BufferRef>>,
    /// Free buffers by bucket, in index order.
    pub free: BTreeMap<u8, Vec<BufferRef>>,
}

impl AllocationSnapshot {
    /// Total number of allocated refs.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.allocated.values().map(Vec::len).sum()
    }

    /// Total number of free refs.
    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.values().map(Vec::len).sum()
    }

    /// Whether `r` is in the allocated table.
    #[must_use]
    pub fn is_allocated(&self, r: BufferRef) -> bool {
        contains(&self.allocated, r)
    }

    /// Whether `r` is on the free list.
    #[must_use]
    pub fn is_free(&self, r: BufferRef) -> bool {
        contains(&self.free, r)
    }
}

fn contains(table: &BTreeMap<u8, Vec<BufferRef>>, r: BufferRef) -> bool {
    table
        .get(&r.bucket_index())
        .is_some_and(|refs| refs.binary_search(&r).is_ok())
}

fn write_table(
    f: &mut fmt::Formatter<'_>,
    name: &str,
    table: &BTreeMap<u8, Vec<BufferRef>>,
) -> fmt::Result {
    let total: usize = table.values().map(Vec::len).sum();
    writeln!(f, "{name} ({total}):")?;
    for (bucket, refs) in table {
        write!(f, "  bucket {bucket:>2} [{}]:", refs.len())?;
        for r in refs {
            write!(f, " {}", r.buffer_index())?;
        }
        writeln!(f)?;
    }
    Ok(())
}

impl fmt::Display for AllocationSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_table(f, "allocated", &self.allocated)?;
        write_table(f, "free", &self.free)
    }
}
