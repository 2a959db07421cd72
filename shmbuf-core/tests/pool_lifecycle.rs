//! Integration tests for renting and returning buffers through the pool.

use shmbuf_core::allocator::{AllocationTable, Allocator};
use shmbuf_core::bucket::{BucketLayout, BucketStorage};
use shmbuf_core::config::{AllocatorConfig, PoolConfig};
use shmbuf_core::{BufferPool, BufferState, BufferStore, InstanceId, StoreConfig};
use std::sync::Arc;
use tempfile::tempdir;

#[test]
fn test_separate_mappings_see_the_same_buffer() {
    let dir = tempdir().unwrap();
    let table = AllocationTable::open(&dir.path().join("table"), 1 << 24).unwrap();
    let layout = BucketLayout::new(4096, 2048, 8192, 15, 16).unwrap();
    let config = AllocatorConfig {
        sync_new_buffers: false,
        ..AllocatorConfig::default()
    };

    // Two instances, each with its own mappings of the same bucket files.
    let storage_a = Arc::new(BucketStorage::new(dir.path().join("buckets"), layout.clone()));
    let storage_b = Arc::new(BucketStorage::new(dir.path().join("buckets"), layout));
    let pool_a = BufferPool::new(
        Arc::new(Allocator::new(table.clone(), storage_a, InstanceId::new(1), &config)),
        &PoolConfig::default(),
    );
    let allocator_b = Allocator::new(table, Arc::clone(&storage_b), InstanceId::new(2), &config);

    let mut buf = pool_a.rent(500).unwrap();
    buf.as_mut_slice()[..4].copy_from_slice(b"ping");
    let r = buf.buffer_ref();

    let seen = storage_b.region(r).unwrap();
    let word = seen.header().load();
    assert!(word.is(BufferState::Owned));
    assert_eq!(word.owner, InstanceId::new(1));
    assert_eq!(unsafe { &seen.data()[..4] }, b"ping");

    // The other instance never receives a ref that is in use.
    let other = allocator_b.allocate(r.bucket_index()).unwrap();
    assert_ne!(other, r);
}

#[test]
fn test_requests_map_to_smallest_fitting_bucket() {
    let dir = tempdir().unwrap();
    let store = BufferStore::open(StoreConfig::in_memory().with_directory(dir.path())).unwrap();

    let cases = [(1, 0), (2040, 0), (2041, 1), (4088, 1), (8000, 2), (16384, 3), (20000, 4)];
    for (size, bucket) in cases {
        let buf = store.rent(size).unwrap();
        assert_eq!(buf.buffer_ref().bucket_index(), bucket, "size {size}");
        assert!(buf.len() >= size);
    }

    let err = store.rent(usize::MAX / 2).unwrap_err();
    assert_eq!(err.code(), "E204");
}

#[test]
fn test_large_rentals_get_page_aligned_power_of_two_payloads() {
    let dir = tempdir().unwrap();
    let store = BufferStore::open(StoreConfig::in_memory().with_directory(dir.path())).unwrap();

    for size in [8192, 16384, 1 << 20] {
        let mut buf = store.rent(size).unwrap();
        assert_eq!(buf.len(), size);
        assert_eq!(buf.as_slice().as_ptr() as usize % 4096, 0);
        buf.as_mut_slice().fill(0xAB);
        // The payload ends before the next slot's header page.
        assert!(buf.header().load().is(BufferState::Owned));
    }
}

#[test]
fn test_cached_buffers_are_freed_on_trim() {
    let dir = tempdir().unwrap();
    let store = BufferStore::open(
        StoreConfig::in_memory()
            .with_directory(dir.path())
            .with_cache_per_bucket(2),
    )
    .unwrap();

    let bufs: Vec<_> = (0..5).map(|_| store.rent(100).unwrap()).collect();
    drop(bufs);

    let stats = store.pool().stats();
    assert_eq!(stats.rents, 5);
    assert_eq!(stats.cache_misses, 5);
    assert_eq!(stats.returned_to_cache, 2);
    assert_eq!(stats.returned_to_allocator, 3);
    assert_eq!(store.snapshot().unwrap().allocated_count(), 2);

    assert_eq!(store.pool().trim().unwrap(), 2);
    let snapshot = store.snapshot().unwrap();
    assert_eq!(snapshot.allocated_count(), 0);
    assert_eq!(snapshot.free_count(), 5);
}

#[test]
fn test_concurrent_rent_and_return() {
    let dir = tempdir().unwrap();
    let store = BufferStore::open(
        StoreConfig::in_memory()
            .with_directory(dir.path())
            .with_cache_per_bucket(4),
    )
    .unwrap();
    let pool = store.pool();

    std::thread::scope(|s| {
        for t in 0..4u8 {
            s.spawn(move || {
                for i in 0..100 {
                    let mut buf = pool.rent(100 + i * 10).unwrap();
                    buf.as_mut_slice()[0] = t;
                    assert!(buf.header().load().is(BufferState::Owned));
                    assert_eq!(buf.as_slice()[0], t);
                }
            });
        }
    });

    let stats = pool.stats();
    assert_eq!(stats.rents, 400);
    assert_eq!(stats.cache_hits + stats.cache_misses, 400);

    pool.trim().unwrap();
    assert_eq!(store.snapshot().unwrap().allocated_count(), 0);
}
