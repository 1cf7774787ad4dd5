// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Registry tests. The registry is process-global and other tests
//! register pools concurrently, so assertions here are relative to the
//! pools this file creates.

mod common;

use vbl::{BufferPool, registry};

#[test]
fn pools_register_on_construction_and_unregister_on_drop() {
    common::init_logging();

    let pool = BufferPool::new_owned(2, 128, false, "RegistryLifecyclePool", "RegistryTest").unwrap();
    assert!(pool.registry_id() > 0);

    let stats = registry()
        .find_by_name("RegistryLifecyclePool")
        .expect("pool is registered");
    assert_eq!(stats.id, pool.registry_id());
    assert_eq!(stats.category, "RegistryTest");
    assert_eq!(stats.total, 2);
    assert_eq!(stats.free, 2);
    assert_eq!(stats.filled, 0);
    assert_eq!(stats.buffer_size, 128);
    assert_eq!(stats.memory_bytes, 256);

    drop(pool);
    assert!(registry().find_by_name("RegistryLifecyclePool").is_none());
}

#[test]
fn snapshots_track_queue_movement() {
    common::init_logging();
    let pool = BufferPool::new_owned(3, 64, false, "RegistrySnapshotPool", "RegistryTest").unwrap();

    let buffer = pool.try_acquire_free().unwrap();
    pool.submit_filled(&buffer);

    let stats = registry().find_by_name("RegistrySnapshotPool").unwrap();
    assert_eq!(stats.total, 3);
    assert_eq!(stats.free, 2);
    assert_eq!(stats.filled, 1);

    let frame = pool.try_acquire_filled().unwrap();
    pool.release_filled(frame);
}

#[test]
fn category_listing_and_global_sums_cover_live_pools() {
    common::init_logging();
    let pool_a = BufferPool::new_owned(1, 32, false, "RegistryCatPoolA", "RegistryCat").unwrap();
    let pool_b = BufferPool::new_owned(2, 32, false, "RegistryCatPoolB", "RegistryCat").unwrap();

    let in_category = registry().pools_in_category("RegistryCat");
    assert_eq!(in_category.len(), 2);
    let buffers: usize = in_category.iter().map(|p| p.total).sum();
    assert_eq!(buffers, 3);

    let global = registry().global_stats();
    assert!(global.total_pools >= 2);
    assert!(global.total_buffers >= 3);
    assert!(global.total_memory_bytes >= 3 * 32);
    assert!(registry().pool_count() >= 2);

    registry().log_all_stats();

    drop(pool_a);
    drop(pool_b);
    assert!(registry().pools_in_category("RegistryCat").is_empty());
}

/// Duplicate names are allowed (with a warning); the name index points
/// at one of them, the id index at both.
#[test]
fn duplicate_names_are_tolerated() {
    common::init_logging();
    let first = BufferPool::new_owned(1, 16, false, "RegistryDupPool", "RegistryTest").unwrap();
    let second = BufferPool::new_owned(1, 16, false, "RegistryDupPool", "RegistryTest").unwrap();

    assert_ne!(first.registry_id(), second.registry_id());
    assert!(registry().find_by_name("RegistryDupPool").is_some());

    drop(second);
    drop(first);
}
