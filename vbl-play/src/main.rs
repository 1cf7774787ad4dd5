// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Playback test harness for the VBL pipeline.
//!
//! Exercises the library end to end against real hardware: preload-loop
//! and sequential playback straight into framebuffer slices, the
//! producer/consumer pipeline with mmap or io_uring readers, and RTSP
//! playback over the DMA display path.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};

use vbl::{BufferPool, DisplayDevice, ProducerConfig, ReaderType, VideoProducer, factory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
enum Mode {
    /// Preload the framebuffer slices once, then flip through them.
    #[default]
    Loop,
    /// Play every frame once, copying into slices round-robin.
    Sequential,
    /// Producer/consumer pipeline with an owned DMA pool.
    Producer,
    /// Producer pipeline pinned to the io_uring reader.
    Iouring,
    /// RTSP stream decoded into a dynamic pool, displayed by DMA.
    Rtsp,
}

#[derive(Parser, Debug)]
#[command(name = "vbl-play", about = "VBL playback test harness")]
struct Args {
    /// Test mode.
    #[arg(short, long, value_enum, default_value = "loop")]
    mode: Mode,

    /// Raw video file path, or an RTSP URL in rtsp mode.
    source: String,

    /// Frames to play in producer modes (0 = until the source ends).
    #[arg(short = 'n', long, default_value_t = 0)]
    frames: u64,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let args = Args::parse();
    let result = match args.mode {
        Mode::Loop => run_preload_loop(&args),
        Mode::Sequential => run_sequential(&args),
        Mode::Producer => run_producer(&args, ReaderType::Auto),
        Mode::Iouring => run_producer(&args, ReaderType::IoUring),
        Mode::Rtsp => run_rtsp(&args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

/// Loads the first N frames into the framebuffer slices and flips
/// through them forever, pinned to vsync.
fn run_preload_loop(args: &Args) -> vbl::Result<()> {
    let mut display = DisplayDevice::open(0)?;
    let mut reader = factory::create(ReaderType::Auto)?;
    reader.open_raw(
        &args.source,
        display.width(),
        display.height(),
        display.bits_per_pixel(),
    )?;

    let count = display.buffer_count().min(reader.total_frames());
    info!(count, "preloading framebuffer slices");

    let mut preloaded = Vec::new();
    for _ in 0..count {
        let slice = display
            .pool()
            .try_acquire_free()
            .ok_or_else(|| vbl::Error::Unavailable("framebuffer slice unavailable".into()))?;
        reader.read_frame(&slice)?;
        preloaded.push(slice);
    }

    info!("looping {count} preloaded frames (ctrl-c to stop)");
    loop {
        for slice in &preloaded {
            display.wait_vsync()?;
            display.display_filled(slice)?;
        }
    }
}

/// Plays the whole file once, copying each frame into a slice.
fn run_sequential(args: &Args) -> vbl::Result<()> {
    let mut display = DisplayDevice::open(0)?;
    let mut reader = factory::create(ReaderType::Auto)?;
    reader.open_raw(
        &args.source,
        display.width(),
        display.height(),
        display.bits_per_pixel(),
    )?;

    info!(total = reader.total_frames(), "sequential playback");
    let mut played = 0u64;
    while reader.has_more_frames() {
        let Some(slice) = display.pool().acquire_free(Some(Duration::from_millis(100))) else {
            continue;
        };
        reader.read_frame(&slice)?;
        display.pool().submit_filled(&slice);

        let frame = display
            .pool()
            .acquire_filled(Some(Duration::from_millis(100)))
            .expect("frame just submitted");
        display.wait_vsync()?;
        display.display_filled(&frame)?;
        display.pool().release_filled(frame);
        played += 1;
    }
    info!(played, "sequential playback finished");
    Ok(())
}

/// Producer/consumer pipeline: workers fill an owned DMA pool, the
/// consumer copies frames to the display.
fn run_producer(args: &Args, reader_type: ReaderType) -> vbl::Result<()> {
    let mut display = DisplayDevice::open(0)?;
    let frame_size = display.slice_size();

    let pool = BufferPool::new_owned(4, frame_size, true, "ProducerPool", "Video")?;
    let mut producer = VideoProducer::new(pool.clone());
    producer.set_error_callback(|message| error!("producer: {message}"));
    producer.start(&ProducerConfig {
        path: args.source.clone(),
        width: display.width(),
        height: display.height(),
        bits_per_pixel: display.bits_per_pixel(),
        loop_playback: args.frames == 0,
        thread_count: 2,
        reader_type,
    })?;

    let mut shown = 0u64;
    while args.frames == 0 || shown < args.frames {
        let Some(frame) = pool.acquire_filled(Some(Duration::from_millis(100))) else {
            if !producer.is_running() {
                break;
            }
            continue;
        };
        display.wait_vsync()?;
        display.display_by_copy(&frame)?;
        pool.release_filled(frame);
        shown += 1;
    }

    producer.stop();
    info!(
        shown,
        produced = producer.produced_frames(),
        skipped = producer.skipped_frames(),
        fps = format!("{:.2}", producer.average_fps()),
        "producer playback finished"
    );
    Ok(())
}

/// RTSP playback: decoded frames are injected into a dynamic pool and
/// displayed over the DMA path when a physical address is available.
#[cfg(feature = "rtsp")]
fn run_rtsp(args: &Args) -> vbl::Result<()> {
    let mut display = DisplayDevice::open(0)?;

    let pool = BufferPool::new_dynamic("RtspPool", "RTSP", 10);
    let mut producer = VideoProducer::new(pool.clone());
    producer.set_error_callback(|message| error!("rtsp: {message}"));
    producer.start(&ProducerConfig {
        path: args.source.clone(),
        width: display.width(),
        height: display.height(),
        bits_per_pixel: display.bits_per_pixel(),
        loop_playback: false,
        thread_count: 1,
        reader_type: ReaderType::Rtsp,
    })?;

    let mut shown = 0u64;
    while args.frames == 0 || shown < args.frames {
        let Some(frame) = pool.acquire_filled(Some(Duration::from_millis(100))) else {
            if !producer.is_running() {
                break;
            }
            continue;
        };
        display.wait_vsync()?;
        if frame.phys_addr() != 0 {
            display.display_by_dma(&frame)?;
        } else {
            display.display_by_copy(&frame)?;
        }
        pool.release_filled(frame);
        shown += 1;
    }

    producer.stop();
    info!(shown, "rtsp playback finished");
    Ok(())
}

#[cfg(not(feature = "rtsp"))]
fn run_rtsp(_args: &Args) -> vbl::Result<()> {
    Err(vbl::Error::NotSupported(
        "this build has no RTSP support (rebuild with --features rtsp)",
    ))
}
