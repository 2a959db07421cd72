//! Repair command - return stranded buffers to the free list.

use super::StoreSource;
use anyhow::{Context, Result};
use shmbuf_core::{BufferRef, InstanceId};

/// Run the repair command.
///
/// With `buffer`, retries the return of that one ref. Otherwise scans the
/// allocated table, restricted to `instance` when given.
pub fn run(source: &StoreSource, instance: Option<u32>, buffer: Option<u32>) -> Result<()> {
    let store = source.open()?;

    if let Some(raw) = buffer {
        let r = BufferRef::from_raw(raw);
        let freed = store
            .retry_return(r)
            .with_context(|| format!("Failed to repair buffer {r}"))?;
        if freed {
            println!("Returned {r} to the free list.");
        } else {
            println!("{r} is not stranded; nothing to do.");
        }
        return Ok(());
    }

    if instance.is_none() {
        tracing::warn!("Repairing without --instance; no other process should be allocating");
    }
    let owner = instance.map(InstanceId::new);
    let repaired = store.repair(owner).context("Repair failed")?;

    if repaired.is_empty() {
        println!("No stranded buffers found.");
        return Ok(());
    }
    println!("Returned {} buffer(s) to the free list:", repaired.len());
    for r in repaired {
        println!("  {r}");
    }
    Ok(())
}
