// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Producer pipeline tests: multi-worker coverage of a file, loop mode,
//! frame-size reconciliation and configuration validation.

mod common;

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use vbl::{BufferPool, BufferState, Error, ProducerConfig, ReaderType, VideoProducer};

const WIDTH: u32 = 4;
const HEIGHT: u32 = 4;
const BPP: u32 = 8;
const FRAME_SIZE: usize = (WIDTH as usize * HEIGHT as usize * BPP as usize) / 8; // 16

fn file_config(path: &str, threads: usize, loop_playback: bool) -> ProducerConfig {
    ProducerConfig {
        path: path.to_string(),
        width: WIDTH,
        height: HEIGHT,
        bits_per_pixel: BPP,
        loop_playback,
        thread_count: threads,
        reader_type: ReaderType::Mmap,
    }
}

/// Four workers over a ten-frame file, no looping: every frame index is
/// produced exactly once and the pool returns to rest after stop.
#[test]
fn four_workers_cover_the_file_once() {
    common::init_logging();
    let file = common::RawFileGuard::new("producer_cover", 10, FRAME_SIZE);
    let pool = BufferPool::new_owned(4, FRAME_SIZE, false, "CoveragePool", "Test").unwrap();

    let mut producer = VideoProducer::new(pool.clone());
    producer.start(&file_config(file.path(), 4, false)).unwrap();
    assert_eq!(producer.total_frames(), 10);

    // Drain the filled queue; frame content encodes the frame index.
    let mut seen = BTreeSet::new();
    let mut consumed = 0usize;
    let deadline = Instant::now() + Duration::from_secs(10);
    while consumed < 10 && Instant::now() < deadline {
        let Some(frame) = pool.acquire_filled(Some(Duration::from_millis(100))) else {
            continue;
        };
        seen.insert(unsafe { frame.as_slice() }[0]);
        pool.release_filled(frame);
        consumed += 1;
    }

    producer.stop();
    assert!(!producer.is_running());
    assert_eq!(consumed, 10);
    assert_eq!(seen, (0..10u8).collect::<BTreeSet<_>>());
    assert_eq!(producer.produced_frames(), 10);
    assert_eq!(producer.skipped_frames(), 0);
    assert!(producer.last_error().is_empty());

    // All buffers idle, all queues back to their initial shape.
    assert_eq!(pool.free_count(), 4);
    assert_eq!(pool.filled_count(), 0);
    for id in 0..4 {
        let buffer = pool.buffer_by_id(id).unwrap();
        assert_eq!(buffer.state(), BufferState::Idle);
        assert_eq!(buffer.ref_count(), 0);
    }
}

/// Loop mode keeps producing past the file length until stopped.
#[test]
fn loop_mode_wraps_past_the_last_frame() {
    common::init_logging();
    let file = common::RawFileGuard::new("producer_loop", 3, FRAME_SIZE);
    let pool = BufferPool::new_owned(2, FRAME_SIZE, false, "LoopModePool", "Test").unwrap();

    let mut producer = VideoProducer::new(pool.clone());
    producer.start(&file_config(file.path(), 2, true)).unwrap();

    let mut consumed = 0u64;
    let deadline = Instant::now() + Duration::from_secs(10);
    while consumed < 25 && Instant::now() < deadline {
        if let Some(frame) = pool.acquire_filled(Some(Duration::from_millis(100))) {
            assert!(unsafe { frame.as_slice() }[0] < 3);
            pool.release_filled(frame);
            consumed += 1;
        }
    }
    producer.stop();

    assert!(consumed >= 25, "looped playback stalled at {consumed} frames");
    assert!(producer.produced_frames() >= consumed);
    assert!(producer.average_fps() > 0.0);
}

/// A dynamic pool adopts the reader's frame size at start.
#[test]
fn dynamic_pool_adopts_reader_frame_size() {
    common::init_logging();
    let file = common::RawFileGuard::new("producer_adopt", 2, FRAME_SIZE);
    let pool = BufferPool::new_dynamic("AdoptSizePool", "Test", 0);
    assert_eq!(pool.buffer_size(), 0);

    let mut producer = VideoProducer::new(pool.clone());
    producer.start(&file_config(file.path(), 1, false)).unwrap();
    assert_eq!(pool.buffer_size(), FRAME_SIZE);
    producer.stop();
}

/// A fixed pool with the wrong frame size refuses to start.
#[test]
fn mismatched_pool_size_fails_start() {
    common::init_logging();
    let file = common::RawFileGuard::new("producer_mismatch", 2, FRAME_SIZE);
    let pool = BufferPool::new_owned(2, FRAME_SIZE * 2, false, "MismatchPool", "Test").unwrap();

    let mut producer = VideoProducer::new(pool);
    let result = producer.start(&file_config(file.path(), 1, false));
    assert!(matches!(result, Err(Error::Config(_))));
    assert!(!producer.is_running());
}

#[test]
fn configuration_is_validated_before_any_thread_starts() {
    common::init_logging();
    let pool = BufferPool::new_owned(1, FRAME_SIZE, false, "ConfigCheckPool", "Test").unwrap();
    let mut producer = VideoProducer::new(pool);

    let empty_path = ProducerConfig::default();
    assert!(matches!(producer.start(&empty_path), Err(Error::Config(_))));

    let mut zero_threads = file_config("/nonexistent.raw", 1, false);
    zero_threads.thread_count = 0;
    assert!(matches!(producer.start(&zero_threads), Err(Error::Config(_))));

    let mut zero_width = file_config("/nonexistent.raw", 1, false);
    zero_width.width = 0;
    assert!(matches!(producer.start(&zero_width), Err(Error::Config(_))));

    // A missing file surfaces as an I/O error from the reader.
    let missing = file_config("/nonexistent/vbl.raw", 1, false);
    assert!(producer.start(&missing).is_err());
    assert!(!producer.is_running());
}

/// Stop is prompt: workers return within the acquire timeout even when
/// the consumer never drains the queue.
#[test]
fn stop_joins_workers_with_a_full_pipeline() {
    common::init_logging();
    let file = common::RawFileGuard::new("producer_stop", 50, FRAME_SIZE);
    let pool = BufferPool::new_owned(2, FRAME_SIZE, false, "PromptStopPool", "Test").unwrap();

    let mut producer = VideoProducer::new(pool.clone());
    producer.start(&file_config(file.path(), 2, true)).unwrap();

    // Let the workers fill both buffers, then stop without consuming.
    std::thread::sleep(Duration::from_millis(100));
    let stop_started = Instant::now();
    producer.stop();
    assert!(stop_started.elapsed() < Duration::from_secs(2));
    assert_eq!(pool.filled_count() + pool.free_count(), 2);
}
