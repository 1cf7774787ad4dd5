// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Frame sources: memory-mapped files, io_uring files and RTSP streams.
//!
//! All variants sit behind the [`VideoReader`] enum rather than a trait
//! object; the capability set is one method surface and each call
//! dispatches with a match. [`factory::create`] is the only place that
//! knows which concrete variants exist.

pub mod factory;
mod mmap;
#[cfg(feature = "rtsp")]
mod rtsp;
mod uring;

use std::str::FromStr;

pub use mmap::MmapReader;
#[cfg(feature = "rtsp")]
pub use rtsp::RtspReader;
pub use uring::{RingStats, UringReader};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::pool::BufferPool;

/// Selects which reader implementation the factory builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReaderType {
    /// Probe capabilities and pick the best file reader.
    #[default]
    Auto,
    Mmap,
    IoUring,
    /// Plain positional reads; currently served by the mmap reader.
    DirectRead,
    Rtsp,
}

impl FromStr for ReaderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "auto" => Ok(ReaderType::Auto),
            "mmap" => Ok(ReaderType::Mmap),
            "iouring" => Ok(ReaderType::IoUring),
            "direct" => Ok(ReaderType::DirectRead),
            "rtsp" => Ok(ReaderType::Rtsp),
            other => Err(Error::Config(format!("unknown reader type '{other}'"))),
        }
    }
}

/// A frame source behind a uniform capability surface.
///
/// File readers fill caller-supplied buffers; the RTSP reader, once a
/// pool is injected via [`VideoReader::set_buffer_pool`], pushes decoded
/// frames into that pool instead and its read calls become
/// [`Error::NotSupported`].
#[derive(Debug)]
pub enum VideoReader {
    Mmap(MmapReader),
    Ring(UringReader),
    #[cfg(feature = "rtsp")]
    Rtsp(RtspReader),
}

macro_rules! dispatch {
    ($self:expr, $reader:ident => $body:expr) => {
        match $self {
            VideoReader::Mmap($reader) => $body,
            VideoReader::Ring($reader) => $body,
            #[cfg(feature = "rtsp")]
            VideoReader::Rtsp($reader) => $body,
        }
    };
}

impl VideoReader {
    /// Opens a source by sniffing its container format. Encoded
    /// containers are recognized and rejected; only raw frame files can
    /// actually be played, through [`Self::open_raw`].
    pub fn open(&mut self, path: &str) -> Result<()> {
        dispatch!(self, r => r.open(path))
    }

    /// Opens a raw frame source with an explicit format.
    pub fn open_raw(&mut self, path: &str, width: u32, height: u32, bits_per_pixel: u32) -> Result<()> {
        dispatch!(self, r => r.open_raw(path, width, height, bits_per_pixel))
    }

    pub fn close(&mut self) {
        dispatch!(self, r => r.close())
    }

    pub fn is_open(&self) -> bool {
        dispatch!(self, r => r.is_open())
    }

    /// Reads the next frame into `dest` and advances the cursor.
    pub fn read_frame(&mut self, dest: &Buffer) -> Result<()> {
        dispatch!(self, r => r.read_frame(dest))
    }

    /// Reads the frame at `index` into `dest`; the cursor follows.
    pub fn read_frame_at(&mut self, index: u32, dest: &Buffer) -> Result<()> {
        dispatch!(self, r => r.read_frame_at(index, dest))
    }

    /// Reads the frame at `index` without touching any reader state;
    /// safe for concurrent callers with distinct destinations.
    pub fn read_frame_at_concurrent(&self, index: u32, dest: &Buffer) -> Result<()> {
        dispatch!(self, r => r.read_frame_at_concurrent(index, dest))
    }

    pub fn seek(&mut self, index: u32) -> Result<()> {
        dispatch!(self, r => r.seek(index))
    }

    pub fn seek_to_begin(&mut self) -> Result<()> {
        self.seek(0)
    }

    /// Parks the cursor one past the last frame.
    pub fn seek_to_end(&mut self) -> Result<()> {
        dispatch!(self, r => r.seek_to_end())
    }

    /// Moves the cursor by `delta` frames in either direction.
    pub fn skip(&mut self, delta: i64) -> Result<()> {
        dispatch!(self, r => r.skip(delta))
    }

    /// Total frame count; live streams report an effectively infinite
    /// sentinel (`u32::MAX`).
    pub fn total_frames(&self) -> u32 {
        dispatch!(self, r => r.total_frames())
    }

    pub fn current_index(&self) -> u32 {
        dispatch!(self, r => r.current_index())
    }

    /// Size of one frame in bytes.
    pub fn frame_size(&self) -> usize {
        dispatch!(self, r => r.frame_size())
    }

    /// Source size in bytes; `None` for live streams.
    pub fn file_size(&self) -> Option<u64> {
        dispatch!(self, r => r.file_size())
    }

    pub fn width(&self) -> u32 {
        dispatch!(self, r => r.width())
    }

    pub fn height(&self) -> u32 {
        dispatch!(self, r => r.height())
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        dispatch!(self, r => r.bytes_per_pixel())
    }

    pub fn path(&self) -> &str {
        dispatch!(self, r => r.path())
    }

    pub fn has_more_frames(&self) -> bool {
        dispatch!(self, r => r.has_more_frames())
    }

    pub fn is_at_end(&self) -> bool {
        dispatch!(self, r => r.is_at_end())
    }

    /// Implementation name for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        dispatch!(self, r => r.kind_name())
    }

    /// Hands the reader a pool for direct injection of produced frames.
    /// Readers without an injection path ignore the call.
    pub fn set_buffer_pool(&mut self, pool: Option<BufferPool>) {
        match self {
            VideoReader::Ring(r) => r.set_buffer_pool(pool),
            #[cfg(feature = "rtsp")]
            VideoReader::Rtsp(r) => r.set_buffer_pool(pool),
            _ => {}
        }
    }

    /// Whether decoded frames bypass `read_frame` and flow straight into
    /// an injected pool.
    pub fn is_injecting(&self) -> bool {
        match self {
            #[cfg(feature = "rtsp")]
            VideoReader::Rtsp(r) => r.is_injecting(),
            _ => false,
        }
    }
}
