//! Integration tests for the allocator against a real allocation table and
//! bucket files.

use proptest::prelude::*;
use shmbuf_core::allocator::{AllocationTable, Allocator};
use shmbuf_core::bucket::{BucketLayout, BucketStorage};
use shmbuf_core::config::AllocatorConfig;
use shmbuf_core::{BufferRef, BufferState, BufferStore, InstanceId, StoreConfig};
use std::collections::HashSet;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use tempfile::tempdir;

fn open_store(dir: &Path) -> BufferStore {
    BufferStore::open(
        StoreConfig::in_memory()
            .with_directory(dir)
            .with_instance_id(1),
    )
    .unwrap()
}

/// Take a freshly allocated buffer through the full release sequence.
fn release(store: &BufferStore, r: BufferRef) {
    let region = store.pool().region(r).unwrap();
    let header = region.header();
    header.acquire_owned();
    header.mark_disposed();
    header.release();
    store.allocator().free(r).unwrap();
}

#[test]
fn test_freed_buffer_is_reallocated() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let allocator = store.allocator();

    let r = allocator.allocate(2).unwrap();
    assert_eq!(r.bucket_index(), 2);
    assert_eq!(r.buffer_index(), 1);
    release(&store, r);
    assert!(store.snapshot().unwrap().is_free(r));

    let again = allocator.allocate(2).unwrap();
    assert_eq!(again, r);
    let snapshot = store.snapshot().unwrap();
    assert!(snapshot.is_allocated(r));
    assert_eq!(snapshot.free_count(), 0);
}

#[test]
fn test_fresh_and_reused_headers_read_releasing_disposed() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    let r = store.allocator().allocate(0).unwrap();
    let header = store.pool().region(r).unwrap().header().load();
    assert!(header.is(BufferState::ReleasingDisposed));
    assert_eq!(header.owner, InstanceId::new(1));

    release(&store, r);
    let r = store.allocator().allocate(0).unwrap();
    let header = store.pool().region(r).unwrap().header().load();
    assert!(header.is(BufferState::ReleasingDisposed));
}

#[test]
fn test_failed_free_leaves_tables_unchanged() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let kept = store.allocator().allocate(0).unwrap();
    let freed = store.allocator().allocate(0).unwrap();
    release(&store, freed);

    let before = store.snapshot().unwrap();
    let never = BufferRef::new(0, 77).unwrap();
    let err = store.allocator().free(never).unwrap_err();
    assert_eq!(err.code(), "E101");
    assert_eq!(store.snapshot().unwrap(), before);

    // Double free is rejected the same way.
    assert!(store.allocator().free(freed).is_err());
    assert_eq!(store.snapshot().unwrap(), before);
    assert!(before.is_allocated(kept));
}

#[test]
fn test_flagged_ref_frees_the_underlying_buffer() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let r = store.allocator().allocate(1).unwrap();
    let region = store.pool().region(r).unwrap();
    region.header().acquire_owned();
    region.header().mark_disposed();
    region.header().release();

    store.allocator().free(r.set_flag()).unwrap();
    assert!(store.snapshot().unwrap().is_free(r));
}

#[test]
fn test_capacity_checks_follow_cadence() {
    let dir = tempdir().unwrap();
    let store = BufferStore::open(
        StoreConfig::in_memory()
            .with_directory(dir.path())
            .with_capacity_check_interval(10),
    )
    .unwrap();

    for _ in 0..100 {
        store.allocator().allocate(0).unwrap();
    }
    assert_eq!(store.allocator().capacity_checks(), 10);
}

#[test]
fn test_high_utilization_checks_every_allocation() {
    let dir = tempdir().unwrap();
    let store = BufferStore::open(
        StoreConfig::in_memory()
            .with_directory(dir.path())
            .with_capacity_check_interval(10)
            .with_max_total_bytes(110 * 2048),
    )
    .unwrap();
    let allocator = store.allocator();

    for _ in 0..100 {
        allocator.allocate(0).unwrap();
    }
    assert_eq!(allocator.capacity_checks(), 10);
    // The 100th allocation projected 100/110 of the budget.
    assert!(allocator.last_utilization() > 0.9);

    for _ in 0..10 {
        allocator.allocate(0).unwrap();
    }
    assert_eq!(allocator.capacity_checks(), 20);

    let err = allocator.allocate(0).unwrap_err();
    assert!(err.is_capacity_error());
    assert_eq!(err.code(), "E201");
    assert_eq!(allocator.capacity_checks(), 21);
    assert_eq!(store.snapshot().unwrap().allocated_count(), 110);
}

#[test]
fn test_large_slots_are_always_checked() {
    let dir = tempdir().unwrap();
    // Bucket 4 slots are 32 KiB + one page: more than 1% of a 1 MiB budget.
    let store = BufferStore::open(
        StoreConfig::in_memory()
            .with_directory(dir.path())
            .with_max_total_bytes(1024 * 1024),
    )
    .unwrap();

    store.allocator().allocate(4).unwrap();
    store.allocator().allocate(4).unwrap();
    assert_eq!(store.allocator().capacity_checks(), 2);
}

#[test]
fn test_invalid_bucket_is_rejected() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());
    let err = store.allocator().allocate(16).unwrap_err();
    assert_eq!(err.code(), "E001");
    assert!(err.is_not_found());
}

#[test]
fn test_concurrent_allocators_never_share_a_ref() {
    let dir = tempdir().unwrap();
    let table = AllocationTable::open(&dir.path().join("table"), 1 << 26).unwrap();
    let layout = BucketLayout::new(4096, 2048, 8192, 15, 64).unwrap();
    let storage = Arc::new(BucketStorage::new(dir.path().join("buckets"), layout));
    let config = AllocatorConfig {
        sync_new_buffers: false,
        ..AllocatorConfig::default()
    };

    let allocators: Vec<_> = (1..=4)
        .map(|id| {
            Allocator::new(
                table.clone(),
                Arc::clone(&storage),
                InstanceId::new(id),
                &config,
            )
        })
        .collect();

    let refs: Vec<BufferRef> = std::thread::scope(|s| {
        let workers: Vec<_> = allocators
            .iter()
            .map(|allocator| {
                s.spawn(move || {
                    (0..50)
                        .map(|i| allocator.allocate((i % 3) as u8).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect()
    });

    let unique: HashSet<_> = refs.iter().copied().collect();
    assert_eq!(refs.len(), 200);
    assert_eq!(unique.len(), 200);
    assert_eq!(allocators[0].snapshot().unwrap().allocated_count(), 200);
}

/// Set by `test_separate_processes_never_share_a_ref` for its child.
const CHILD_DIR_ENV: &str = "SHMBUF_TEST_CHILD_DIR";
const CHILD_ALLOCATIONS: usize = 100;

/// Child half of `test_separate_processes_never_share_a_ref`. Does nothing
/// when run directly.
#[test]
fn allocating_child_process() {
    let Ok(dir) = std::env::var(CHILD_DIR_ENV) else {
        return;
    };
    let store = BufferStore::open(
        StoreConfig::in_memory()
            .with_directory(dir)
            .with_instance_id(2),
    )
    .unwrap();
    for i in 0..CHILD_ALLOCATIONS {
        store.allocator().allocate((i % 3) as u8).unwrap();
    }
}

#[test]
fn test_separate_processes_never_share_a_ref() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    // A second process with its own table environment and its own mappings.
    let mut child = Command::new(std::env::current_exe().unwrap())
        .args(["allocating_child_process", "--exact", "--test-threads=1"])
        .env(CHILD_DIR_ENV, dir.path())
        .stdout(Stdio::null())
        .spawn()
        .unwrap();
    let mine: Vec<BufferRef> = (0..CHILD_ALLOCATIONS)
        .map(|i| store.allocator().allocate((i % 3) as u8).unwrap())
        .collect();
    assert!(child.wait().unwrap().success());

    let snapshot = store.snapshot().unwrap();
    let all: Vec<BufferRef> = snapshot.allocated.values().flatten().copied().collect();
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 2 * CHILD_ALLOCATIONS);
    assert_eq!(unique.len(), 2 * CHILD_ALLOCATIONS);

    let header_owner = |r: BufferRef| store.pool().region(r).unwrap().header().load().owner;
    for &r in &all {
        let expected = if mine.contains(&r) { 1 } else { 2 };
        assert_eq!(header_owner(r), InstanceId::new(expected), "{r}");
    }
}

#[test]
fn test_tables_survive_reopen() {
    let dir = tempdir().unwrap();
    let before = {
        let store = open_store(dir.path());
        let refs: Vec<_> = (0..3)
            .map(|_| store.allocator().allocate(1).unwrap())
            .collect();
        release(&store, refs[1]);
        store.snapshot().unwrap()
    };

    let store = open_store(dir.path());
    assert_eq!(store.snapshot().unwrap(), before);
    assert_eq!(before.allocated_count(), 2);
    assert_eq!(before.free_count(), 1);
}

#[test]
fn test_dead_instance_buffers_are_repaired() {
    let dir = tempdir().unwrap();
    let store = open_store(dir.path());

    // A buffer whose holder released the header but died before freeing.
    let stranded = store.allocator().allocate(0).unwrap();
    let region = store.pool().region(stranded).unwrap();
    region.header().acquire_owned();
    region.header().mark_disposed();
    region.header().release();

    // A buffer still in use.
    let live = store.rent(100).unwrap();

    let repaired = store.repair(None).unwrap();
    assert_eq!(repaired, vec![stranded]);
    let snapshot = store.snapshot().unwrap();
    assert!(snapshot.is_free(stranded));
    assert!(snapshot.is_allocated(live.buffer_ref()));

    // Repairing again is a no-op.
    assert!(store.repair(None).unwrap().is_empty());
    assert!(!store.retry_return(stranded).unwrap());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_lowest_free_index_is_reused_first(
        count in 2usize..24,
        picks in proptest::collection::vec(any::<prop::sample::Index>(), 1..8),
    ) {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let refs: Vec<_> = (0..count)
            .map(|_| store.allocator().allocate(0).unwrap())
            .collect();

        let mut freed: Vec<BufferRef> = picks.iter().map(|p| refs[p.index(count)]).collect();
        freed.sort();
        freed.dedup();
        for r in &freed {
            release(&store, *r);
        }

        for expected in &freed {
            prop_assert_eq!(store.allocator().allocate(0).unwrap(), *expected);
        }
        // Free list drained: the next one is brand new.
        let next = store.allocator().allocate(0).unwrap();
        prop_assert_eq!(next.buffer_index() as usize, count + 1);
    }
}
