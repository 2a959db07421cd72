//! Stats command - capacity and per-bucket usage.

use super::StoreSource;
use anyhow::{Context, Result};
use shmbuf_core::AllocationSnapshot;
use shmbuf_core::bucket::BucketLayout;
use std::collections::BTreeSet;

/// Run the stats command.
pub fn run(source: &StoreSource) -> Result<()> {
    let store = source.open()?;
    let allocator = store.allocator();
    let snapshot = store
        .snapshot()
        .context("Failed to read allocation table")?;
    let used = allocator
        .allocated_bytes()
        .context("Failed to read allocation table")?;
    let budget = allocator.budget();

    println!("Store Statistics");
    println!("================");
    println!("Directory:    {}", store.config().directory.display());
    println!("Allocated:    {} buffers", snapshot.allocated_count());
    println!("Free:         {} buffers", snapshot.free_count());
    println!("Used:         {} bytes", used);
    println!("Budget:       {} bytes", budget);
    println!("Utilization:  {:.1}%", utilization(used, budget) * 100.0);
    println!();

    let rows = bucket_rows(&snapshot, allocator.storage().layout());
    if rows.is_empty() {
        println!("No buffers have been allocated.");
        return Ok(());
    }

    println!("{:>6} {:>10} {:>10} {:>8} {:>14}", "BUCKET", "SLOT", "ALLOCATED", "FREE", "BYTES");
    for row in rows {
        println!(
            "{:>6} {:>10} {:>10} {:>8} {:>14}",
            row.bucket, row.slot_len, row.allocated, row.free, row.bytes
        );
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct BucketRow {
    bucket: u8,
    slot_len: u64,
    allocated: usize,
    free: usize,
    bytes: u64,
}

fn bucket_rows(snapshot: &AllocationSnapshot, layout: &BucketLayout) -> Vec<BucketRow> {
    let buckets: BTreeSet<u8> = snapshot
        .allocated
        .keys()
        .chain(snapshot.free.keys())
        .copied()
        .collect();

    buckets
        .into_iter()
        .map(|bucket| {
            let slot_len = layout.slot_len(bucket);
            let allocated = snapshot.allocated.get(&bucket).map_or(0, Vec::len);
            BucketRow {
                bucket,
                slot_len,
                allocated,
                free: snapshot.free.get(&bucket).map_or(0, Vec::len),
                bytes: allocated as u64 * slot_len,
            }
        })
        .collect()
}

fn utilization(used: u64, budget: u64) -> f64 {
    if budget == 0 {
        return 0.0;
    }
    used as f64 / budget as f64
}
