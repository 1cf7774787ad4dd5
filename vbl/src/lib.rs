// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! # VBL - Video Buffer Layer
//!
//! Frame buffer pools and a producer/consumer pipeline that move pixel
//! frames from a source (raw file on disk or a live RTSP stream) into a
//! hardware framebuffer for display, with zero-copy DMA scan-out where
//! the platform allows it.
//!
//! ## Key Concepts
//!
//! - **Buffer**: one frame-sized region with a stable id, virtual and
//!   (optionally) physical address ([`Buffer`])
//! - **Pool**: the scheduler moving buffers between a free and a filled
//!   FIFO queue with blocking acquires ([`BufferPool`])
//! - **Handle**: RAII ownership of an externally supplied region, with a
//!   liveness flag the pool can observe ([`BufferHandle`])
//! - **Injection**: pushing an externally decoded, already-filled frame
//!   straight into a pool's filled queue ([`BufferPool::inject_filled`])
//! - **Display paths**: DMA scan-out from a physical address, page-flip
//!   to a filled framebuffer slice, or a copy fallback ([`DisplayDevice`])
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   acquire_free / submit_filled   ┌────────────┐
//! │ VideoProducer│ ───────────────────────────────► │            │
//! │  (N workers) │                                  │ BufferPool │
//! └──────┬───────┘                                  │ free/filled│
//!        │ read_frame_at_concurrent                 └─────┬──────┘
//! ┌──────▼───────┐                  acquire_filled /      │
//! │ VideoReader  │                  release_filled        ▼
//! │ mmap/uring/  │ ── inject_filled ──►          ┌───────────────┐
//! │ rtsp         │   (RTSP decode)               │ DisplayDevice │
//! └──────────────┘                               └───────────────┘
//! ```
//!
//! ## Example
//!
//! File playback through an owned pool:
//!
//! ```no_run
//! use vbl::{BufferPool, ProducerConfig, ReaderType, VideoProducer};
//!
//! # fn main() -> Result<(), vbl::Error> {
//! let pool = BufferPool::new_owned(4, 1920 * 1080 * 4, true, "PlaybackPool", "Video")?;
//!
//! let mut producer = VideoProducer::new(pool.clone());
//! producer.start(&ProducerConfig {
//!     path: "/data/test_1080p_argb.raw".into(),
//!     width: 1920,
//!     height: 1080,
//!     bits_per_pixel: 32,
//!     loop_playback: true,
//!     thread_count: 2,
//!     reader_type: ReaderType::Auto,
//! })?;
//!
//! while let Some(frame) = pool.acquire_filled(Some(std::time::Duration::from_millis(100))) {
//!     // hand `frame` to a DisplayDevice here
//!     pool.release_filled(frame);
//! }
//! producer.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Thread Safety
//!
//! [`BufferPool`] is a cheap clone over shared state and is fully
//! thread-safe; producers and the consumer block on its condition
//! variables. Readers mutate no shared state in their concurrent read
//! path and are shared across workers behind an `Arc`. The process-wide
//! [`BufferPoolRegistry`] is purely observational.
//!
//! ## Feature Flags
//!
//! - `rtsp`: the GStreamer-backed RTSP reader ([`reader::RtspReader`]).

mod alloc;
mod buffer;
mod display;
mod error;
mod handle;
mod pool;
mod producer;
pub mod reader;
mod registry;

pub use alloc::{Allocation, BufferAllocator};
pub use buffer::{Buffer, BufferState, Ownership};
pub use display::DisplayDevice;
pub use error::{Error, Result};
pub use handle::BufferHandle;
pub use pool::{BufferPool, ExternalBufferInfo};
pub use producer::{ErrorCallback, ProducerConfig, VideoProducer};
pub use reader::{ReaderType, VideoReader, factory};
pub use registry::{BufferPoolRegistry, GlobalStats, PoolStats, global as registry};
