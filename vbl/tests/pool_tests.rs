// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Pool protocol tests: ownership round-trips, blocking semantics,
//! dynamic injection and the capacity cap.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vbl::{BufferHandle, BufferPool, BufferState, Error, Ownership};

/// Owned pool, single-thread round-trip: every buffer cycles through all
/// four states and the queues return to their initial shape.
#[test]
fn owned_pool_single_thread_round_trip() {
    common::init_logging();
    // use_dma exercises the downgrade path on machines without a heap.
    let pool = BufferPool::new_owned(4, 8, true, "RoundTripPool", "Test").unwrap();
    assert_eq!(pool.total_count(), 4);
    assert_eq!(pool.free_count(), 4);
    assert_eq!(pool.buffer_size(), 8);

    let mut acquired = Vec::new();
    for expected_id in 0..4u32 {
        let buffer = pool.try_acquire_free().expect("pool starts full");
        assert_eq!(buffer.id(), expected_id);
        assert_eq!(buffer.state(), BufferState::LockedByProducer);
        assert_eq!(buffer.ref_count(), 1);
        assert_eq!(buffer.ownership(), Ownership::Owned);
        assert!(buffer.is_valid());
        acquired.push(buffer);
    }
    assert!(pool.try_acquire_free().is_none());
    assert_eq!(pool.free_count(), 0);

    for buffer in &acquired {
        pool.submit_filled(buffer);
        assert_eq!(buffer.state(), BufferState::ReadyForConsume);
    }
    assert_eq!(pool.filled_count(), 4);

    // Consumed in submission order.
    for expected in &acquired {
        let buffer = pool.try_acquire_filled().expect("four frames queued");
        assert_eq!(buffer.id(), expected.id());
        assert_eq!(buffer.state(), BufferState::LockedByConsumer);
        pool.release_filled(buffer);
    }

    assert_eq!(pool.free_count(), 4);
    assert_eq!(pool.filled_count(), 0);
    for id in 0..4 {
        let buffer = pool.buffer_by_id(id).unwrap();
        assert_eq!(buffer.state(), BufferState::Idle);
        assert_eq!(buffer.ref_count(), 0);
    }
    assert!(pool.validate_all());
}

/// submit(acquire_free) then release(acquire_filled) is identity on the
/// buffer: same id, state back to Idle, refcount 0.
#[test]
fn round_trip_is_identity_on_the_buffer() {
    common::init_logging();
    let pool = BufferPool::new_owned(1, 64, false, "IdentityPool", "Test").unwrap();

    let out = pool.try_acquire_free().unwrap();
    let id = out.id();
    out.copy_from(&[0xCD; 64]);
    pool.submit_filled(&out);

    let back = pool.try_acquire_filled().unwrap();
    assert_eq!(back.id(), id);
    assert_eq!(unsafe { back.as_slice() }[0], 0xCD);
    pool.release_filled(back);

    let buffer = pool.buffer_by_id(id).unwrap();
    assert_eq!(buffer.state(), BufferState::Idle);
    assert_eq!(buffer.ref_count(), 0);
}

#[test]
fn blocking_acquire_times_out_when_empty() {
    common::init_logging();
    let pool = BufferPool::new_owned(1, 16, false, "TimeoutPool", "Test").unwrap();
    let held = pool.try_acquire_free().unwrap();

    let started = Instant::now();
    assert!(pool.acquire_free(Some(Duration::from_millis(60))).is_none());
    assert!(started.elapsed() >= Duration::from_millis(50));

    pool.cancel_acquire(held);
    assert_eq!(pool.free_count(), 1);
}

/// A consumer blocked on the filled queue wakes when a producer submits.
#[test]
fn blocked_consumer_wakes_on_submit() {
    common::init_logging();
    let pool = BufferPool::new_owned(1, 16, false, "WakeupPool", "Test").unwrap();

    let consumer_pool = pool.clone();
    let consumer = std::thread::spawn(move || {
        consumer_pool
            .acquire_filled(Some(Duration::from_secs(5)))
            .map(|buffer| {
                let id = buffer.id();
                consumer_pool.release_filled(buffer);
                id
            })
    });

    std::thread::sleep(Duration::from_millis(50));
    let buffer = pool.try_acquire_free().unwrap();
    pool.submit_filled(&buffer);

    assert_eq!(consumer.join().unwrap(), Some(buffer.id()));
}

/// Producer-side cancel puts a never-submitted buffer back on the free
/// queue with refcount 0 and state Idle.
#[test]
fn cancel_acquire_recycles_to_free_queue() {
    common::init_logging();
    let pool = BufferPool::new_owned(2, 16, false, "CancelPool", "Test").unwrap();

    let buffer = pool.try_acquire_free().unwrap();
    let id = buffer.id();
    pool.cancel_acquire(buffer);

    assert_eq!(pool.free_count(), 2);
    let buffer = pool.buffer_by_id(id).unwrap();
    assert_eq!(buffer.state(), BufferState::Idle);
    assert_eq!(buffer.ref_count(), 0);
}

/// Foreign buffers are warned about and ignored; queue shape is
/// untouched.
#[test]
fn foreign_buffers_do_not_corrupt_queues() {
    common::init_logging();
    let pool_a = BufferPool::new_owned(1, 16, false, "ForeignPoolA", "Test").unwrap();
    let pool_b = BufferPool::new_owned(1, 16, false, "ForeignPoolB", "Test").unwrap();

    let stranger = pool_a.try_acquire_free().unwrap();
    pool_b.submit_filled(&stranger);
    assert_eq!(pool_b.filled_count(), 0);

    pool_b.release_filled(stranger.clone());
    assert_eq!(pool_b.free_count(), 1);
    assert_eq!(pool_a.free_count(), 0);

    pool_a.cancel_acquire(stranger);
    assert_eq!(pool_a.free_count(), 1);
}

/// Dynamic injection in order: deleters fire exactly once each, in
/// release order, and the pool shrinks back to empty.
#[test]
fn dynamic_injection_release_order_and_deleters() {
    common::init_logging();
    let pool = BufferPool::new_dynamic("InjectOrderPool", "Test", 0);
    assert_eq!(pool.buffer_size(), 0);

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let labels = ["d1", "d2", "d3"];
    let mut regions: Vec<Vec<u8>> = (0..3).map(|_| vec![0u8; 16]).collect();

    for (region, label) in regions.iter_mut().zip(labels) {
        let order = order.clone();
        let handle = BufferHandle::with_release(region.as_mut_ptr(), 0, 16, move |_| {
            order.lock().unwrap().push(label);
        })
        .unwrap();
        pool.inject_filled(handle).unwrap();
    }

    assert_eq!(pool.total_count(), 3);
    assert_eq!(pool.filled_count(), 3);
    assert_eq!(pool.buffer_size(), 16);

    for _ in 0..3 {
        let buffer = pool.try_acquire_filled().unwrap();
        assert_eq!(buffer.ownership(), Ownership::External);
        pool.release_filled(buffer);
    }

    assert_eq!(*order.lock().unwrap(), labels);
    assert_eq!(pool.total_count(), 0);
    assert_eq!(pool.filled_count(), 0);
    assert_eq!(pool.free_count(), 0);
}

/// Capacity cap: injections beyond `max_capacity` are refused with
/// QueueFull and the refused frame is recycled through its deleter.
#[test]
fn injection_respects_capacity_cap() {
    common::init_logging();
    let pool = BufferPool::new_dynamic("CapacityPool", "Test", 2);
    let refused = Arc::new(AtomicUsize::new(0));

    let mut regions: Vec<Vec<u8>> = (0..3).map(|_| vec![0u8; 8]).collect();
    let mut results = Vec::new();
    for region in regions.iter_mut() {
        let refused = refused.clone();
        let handle = BufferHandle::with_release(region.as_mut_ptr(), 0, 8, move |_| {
            refused.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        results.push(pool.inject_filled(handle));
    }

    assert!(results[0].is_ok());
    assert!(results[1].is_ok());
    assert!(matches!(&results[2], Err(Error::QueueFull)));
    // The refused handle was dropped, recycling its frame.
    assert_eq!(refused.load(Ordering::SeqCst), 1);
    assert_eq!(pool.total_count(), 2);
}

/// Invariant 5: the first injection locks the frame size; mismatches
/// are rejected and `set_buffer_size` refuses a second assignment.
#[test]
fn injected_frame_size_is_locked_in() {
    common::init_logging();
    let pool = BufferPool::new_dynamic("SizeLockPool", "Test", 0);

    let mut first = vec![0u8; 32];
    pool.inject_filled(BufferHandle::new(first.as_mut_ptr(), 0, 32).unwrap())
        .unwrap();

    let mut other = vec![0u8; 16];
    let mismatch = pool.inject_filled(BufferHandle::new(other.as_mut_ptr(), 0, 16).unwrap());
    assert!(matches!(mismatch, Err(Error::InvalidArg(_))));
    assert!(matches!(pool.set_buffer_size(64), Err(Error::InvalidArg(_))));

    // Drain so the injected region is released before `first` drops.
    let buffer = pool.try_acquire_filled().unwrap();
    pool.release_filled(buffer);
}

/// Population accounting: queues plus outstanding acquires always add
/// up to the pool population through an arbitrary operation sequence.
#[test]
fn population_is_conserved() {
    common::init_logging();
    let pool = BufferPool::new_owned(3, 16, false, "ConservationPool", "Test").unwrap();
    let accounted =
        |pool: &BufferPool, outstanding: usize| pool.free_count() + pool.filled_count() + outstanding;

    let a = pool.try_acquire_free().unwrap();
    assert_eq!(accounted(&pool, 1), 3);

    let b = pool.try_acquire_free().unwrap();
    pool.submit_filled(&a);
    assert_eq!(accounted(&pool, 1), 3);

    pool.submit_filled(&b);
    let c = pool.try_acquire_filled().unwrap();
    assert_eq!(accounted(&pool, 1), 3);

    pool.release_filled(c);
    let d = pool.try_acquire_filled().unwrap();
    pool.release_filled(d);
    assert_eq!(accounted(&pool, 0), 3);
}

/// DMA-BUF export is refused for pools on the normal allocator.
#[test]
fn dmabuf_export_requires_dma_allocator() {
    common::init_logging();
    let pool = BufferPool::new_owned(1, 4096, false, "ExportPool", "Test").unwrap();
    assert!(matches!(pool.export_dmabuf(0), Err(Error::NotSupported(_))));
    assert!(matches!(pool.export_dmabuf(99), Err(Error::InvalidArg(_))));
}

/// External-simple pools schedule caller memory and never free it.
#[test]
fn external_simple_pool_schedules_caller_memory() {
    common::init_logging();
    let mut slab = vec![0u8; 64];
    let infos: Vec<vbl::ExternalBufferInfo> = (0..2)
        .map(|i| vbl::ExternalBufferInfo {
            virt: unsafe { slab.as_mut_ptr().add(i * 32) },
            phys: 0,
            size: 32,
        })
        .collect();

    {
        let pool = BufferPool::from_external(&infos, "ExternalSimplePool", "Test").unwrap();
        assert_eq!(pool.total_count(), 2);

        let buffer = pool.try_acquire_free().unwrap();
        assert_eq!(buffer.ownership(), Ownership::External);
        buffer.fill(0x5A);
        pool.submit_filled(&buffer);
        let buffer = pool.try_acquire_filled().unwrap();
        pool.release_filled(buffer);
    }

    // The pool is gone; the slab is still ours and carries the data.
    assert_eq!(slab[0], 0x5A);
}
