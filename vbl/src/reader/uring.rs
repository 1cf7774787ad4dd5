// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous file reader over an io_uring submission/completion ring.
//!
//! One ring per reader: the ring is not safe for concurrent submitters,
//! so workers that want ring-backed I/O each need their own instance.
//! Concurrent random reads from a shared instance fall back to
//! positional `pread`. The batch primitives pipeline several frames in
//! flight against a buffer pool on a single worker that always harvests
//! before over-submitting.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use io_uring::{IoUring, opcode, types};
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::pool::BufferPool;

/// Submission queue depth for a fresh ring.
const QUEUE_DEPTH: u32 = 16;
/// Most reads allowed in flight at once in batch mode.
const IN_FLIGHT_CAP: usize = 8;
/// Reads submitted per batch call.
pub const DEFAULT_BATCH: usize = 4;

/// Lock-free read counters.
#[derive(Debug, Default)]
struct Counters {
    total_reads: AtomicU64,
    failed_reads: AtomicU64,
    bytes_read: AtomicU64,
}

/// Snapshot of a reader's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingStats {
    pub total_reads: u64,
    pub failed_reads: u64,
    pub bytes_read: u64,
}

/// io_uring-backed raw frame reader.
#[derive(Default)]
pub struct UringReader {
    ring: Option<IoUring>,
    file: Option<File>,
    path: String,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    frame_size: usize,
    file_size: u64,
    total_frames: u32,
    cursor: u32,
    /// Pool used by the batch pipeline; injected via `set_buffer_pool`.
    pool: Option<BufferPool>,
    /// user_data -> destination buffer for reads in flight.
    pending: HashMap<u64, Arc<Buffer>>,
    next_token: u64,
    counters: Counters,
}

impl UringReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether this kernel (and sandbox) lets us create a ring.
    pub fn is_available() -> bool {
        IoUring::new(2).is_ok()
    }

    pub fn open(&mut self, _path: &str) -> Result<()> {
        Err(Error::NotSupported(
            "the ring reader has no container auto-detect; use open_raw",
        ))
    }

    pub fn open_raw(&mut self, path: &str, width: u32, height: u32, bits_per_pixel: u32) -> Result<()> {
        if self.is_open() {
            warn!(path = %self.path, "reader already open, closing previous file");
            self.close();
        }
        if width == 0 || height == 0 || bits_per_pixel == 0 {
            return Err(Error::Config(format!(
                "invalid raw format {width}x{height}x{bits_per_pixel}"
            )));
        }

        let frame_size = (width as usize * height as usize * bits_per_pixel as usize).div_ceil(8);
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let total_frames = (file_size / frame_size as u64) as u32;
        if total_frames == 0 {
            return Err(Error::InvalidArg(format!(
                "file holds no complete frame (size {file_size}, frame {frame_size})"
            )));
        }
        if file_size % frame_size as u64 != 0 {
            warn!(path, file_size, frame_size, "trailing partial frame ignored");
        }

        let ring = IoUring::new(QUEUE_DEPTH)
            .map_err(|e| Error::Unavailable(format!("io_uring setup: {e}")))?;

        self.ring = Some(ring);
        self.file = Some(file);
        self.path = path.to_string();
        self.width = width;
        self.height = height;
        self.bits_per_pixel = bits_per_pixel;
        self.frame_size = frame_size;
        self.file_size = file_size;
        self.total_frames = total_frames;
        self.cursor = 0;

        info!(path, frame_size, total_frames, queue_depth = QUEUE_DEPTH, "raw video file opened on io_uring");
        Ok(())
    }

    pub fn close(&mut self) {
        // Return any in-flight destinations before the ring goes away.
        if !self.pending.is_empty() {
            let _ = self.harvest(true);
            if let Some(pool) = self.pool.clone() {
                for (_, buffer) in self.pending.drain() {
                    pool.cancel_acquire(buffer);
                }
            } else {
                self.pending.clear();
            }
        }
        self.ring = None;
        if self.file.take().is_some() {
            debug!(path = %self.path, "video file closed");
        }
        self.cursor = 0;
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    pub fn read_frame(&mut self, dest: &Buffer) -> Result<()> {
        if self.cursor >= self.total_frames {
            return Err(Error::EndOfStream);
        }
        let index = self.cursor;
        self.read_ring(index, dest)?;
        self.cursor += 1;
        Ok(())
    }

    pub fn read_frame_at(&mut self, index: u32, dest: &Buffer) -> Result<()> {
        self.seek(index)?;
        self.read_frame(dest)
    }

    /// Positional read that mutates no reader state: the ring is not
    /// shareable, so concurrent callers go through `pread`.
    pub fn read_frame_at_concurrent(&self, index: u32, dest: &Buffer) -> Result<()> {
        let file = self.file.as_ref().ok_or(Error::NotSupported("reader is not open"))?;
        self.check_read(index, dest)?;

        self.counters.total_reads.fetch_add(1, Ordering::Relaxed);
        let offset = index as i64 * self.frame_size as i64;
        // Safety: the destination is exclusively held by the caller per
        // the pool protocol and is at least frame_size bytes.
        let read = unsafe {
            libc::pread(
                file.as_raw_fd(),
                dest.virt_addr().cast(),
                self.frame_size,
                offset,
            )
        };
        if read < 0 {
            self.counters.failed_reads.fetch_add(1, Ordering::Relaxed);
            return Err(std::io::Error::last_os_error().into());
        }
        if read as usize != self.frame_size {
            self.counters.failed_reads.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ShortRead {
                expected: self.frame_size,
                actual: read as usize,
            });
        }
        self.counters.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
        Ok(())
    }

    fn read_ring(&mut self, index: u32, dest: &Buffer) -> Result<()> {
        self.check_read(index, dest)?;
        let ring = self.ring.as_mut().ok_or(Error::NotSupported("reader is not open"))?;
        let fd = self.file.as_ref().expect("file open alongside ring").as_raw_fd();

        let token = self.next_token;
        self.next_token += 1;
        let entry = opcode::Read::new(types::Fd(fd), dest.virt_addr(), self.frame_size as u32)
            .offset(index as u64 * self.frame_size as u64)
            .build()
            .user_data(token);

        // Safety: the destination outlives the wait below, which drains
        // this exact completion before returning.
        unsafe {
            ring.submission()
                .push(&entry)
                .map_err(|_| Error::Unavailable("submission queue full".into()))?;
        }
        ring.submit_and_wait(1)
            .map_err(|e| Error::Unavailable(format!("io_uring submit: {e}")))?;

        let completion = ring
            .completion()
            .next()
            .ok_or_else(|| Error::Unavailable("io_uring produced no completion".into()))?;

        self.counters.total_reads.fetch_add(1, Ordering::Relaxed);
        let res = completion.result();
        if res < 0 {
            self.counters.failed_reads.fetch_add(1, Ordering::Relaxed);
            return Err(std::io::Error::from_raw_os_error(-res).into());
        }
        if res as usize != self.frame_size {
            self.counters.failed_reads.fetch_add(1, Ordering::Relaxed);
            return Err(Error::ShortRead {
                expected: self.frame_size,
                actual: res as usize,
            });
        }
        self.counters.bytes_read.fetch_add(res as u64, Ordering::Relaxed);
        Ok(())
    }

    fn check_read(&self, index: u32, dest: &Buffer) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotSupported("reader is not open"));
        }
        if index >= self.total_frames {
            return Err(Error::EndOfStream);
        }
        if dest.size() < self.frame_size {
            return Err(Error::InvalidArg(format!(
                "destination of {} bytes is smaller than one frame ({})",
                dest.size(),
                self.frame_size
            )));
        }
        Ok(())
    }

    // ---- batch pipelining ---------------------------------------------

    /// Acquires free buffers from the injected pool and queues reads for
    /// `count` frames starting at `start_index`, up to the in-flight
    /// cap. Returns how many reads were queued. Call [`Self::harvest`]
    /// before submitting more.
    pub fn submit_batch(&mut self, start_index: u32, count: usize) -> Result<usize> {
        let pool = self
            .pool
            .clone()
            .ok_or(Error::NotSupported("batch mode needs an injected buffer pool"))?;
        if !self.is_open() {
            return Err(Error::NotSupported("reader is not open"));
        }

        let fd = self.file.as_ref().expect("file open").as_raw_fd();
        let frame_size = self.frame_size;
        let mut queued = 0usize;

        for step in 0..count {
            if self.pending.len() >= IN_FLIGHT_CAP {
                break;
            }
            let index = start_index + step as u32;
            if index >= self.total_frames {
                break;
            }
            let Some(buffer) = pool.try_acquire_free() else {
                break;
            };
            if buffer.size() < frame_size {
                pool.cancel_acquire(buffer);
                return Err(Error::InvalidArg("pool buffers smaller than one frame".into()));
            }

            let token = self.next_token;
            self.next_token += 1;
            let entry = opcode::Read::new(types::Fd(fd), buffer.virt_addr(), frame_size as u32)
                .offset(index as u64 * frame_size as u64)
                .build()
                .user_data(token);

            // Safety: the buffer stays in `pending` (keeping it alive and
            // exclusively ours) until its completion is harvested.
            let pushed = unsafe { self.ring.as_mut().expect("ring open").submission().push(&entry) };
            if pushed.is_err() {
                pool.cancel_acquire(buffer);
                break;
            }
            self.pending.insert(token, buffer);
            queued += 1;
        }

        if queued > 0 {
            self.ring
                .as_mut()
                .expect("ring open")
                .submit()
                .map_err(|e| Error::Unavailable(format!("io_uring submit: {e}")))?;
        }
        Ok(queued)
    }

    /// Drains completions: successful reads are submitted to the pool's
    /// filled queue, failures are returned to the free queue. With
    /// `blocking` the call waits for at least one completion when reads
    /// are in flight. Returns how many frames were completed.
    pub fn harvest(&mut self, blocking: bool) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let pool = self
            .pool
            .clone()
            .ok_or(Error::NotSupported("batch mode needs an injected buffer pool"))?;
        let ring = self.ring.as_mut().ok_or(Error::NotSupported("reader is not open"))?;

        if blocking {
            ring.submit_and_wait(1)
                .map_err(|e| Error::Unavailable(format!("io_uring wait: {e}")))?;
        }

        let completions: Vec<(u64, i32)> = ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();

        let mut harvested = 0usize;
        for (token, res) in completions {
            let Some(buffer) = self.pending.remove(&token) else {
                warn!(token, "completion for unknown read token");
                continue;
            };
            self.counters.total_reads.fetch_add(1, Ordering::Relaxed);
            if res as usize == self.frame_size {
                self.counters.bytes_read.fetch_add(res as u64, Ordering::Relaxed);
                pool.submit_filled(&buffer);
                harvested += 1;
            } else {
                self.counters.failed_reads.fetch_add(1, Ordering::Relaxed);
                warn!(token, res, expected = self.frame_size, "batched read failed");
                pool.cancel_acquire(buffer);
            }
        }
        Ok(harvested)
    }

    /// Reads currently in flight through the batch pipeline.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            total_reads: self.counters.total_reads.load(Ordering::Relaxed),
            failed_reads: self.counters.failed_reads.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
        }
    }

    // ---- navigation and metadata --------------------------------------

    pub fn seek(&mut self, index: u32) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotSupported("reader is not open"));
        }
        if index >= self.total_frames {
            return Err(Error::InvalidArg(format!(
                "frame index {index} out of range (0..{})",
                self.total_frames
            )));
        }
        self.cursor = index;
        Ok(())
    }

    pub fn seek_to_end(&mut self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotSupported("reader is not open"));
        }
        self.cursor = self.total_frames;
        Ok(())
    }

    pub fn skip(&mut self, delta: i64) -> Result<()> {
        let target = self.cursor as i64 + delta;
        if target < 0 {
            return Err(Error::InvalidArg(format!("skip of {delta} moves before frame 0")));
        }
        self.seek(target as u32)
    }

    pub fn set_buffer_pool(&mut self, pool: Option<BufferPool>) {
        self.pool = pool;
    }

    pub fn total_frames(&self) -> u32 {
        self.total_frames
    }

    pub fn current_index(&self) -> u32 {
        self.cursor
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn file_size(&self) -> Option<u64> {
        self.is_open().then_some(self.file_size)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        self.bits_per_pixel.div_ceil(8)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn has_more_frames(&self) -> bool {
        self.is_open() && self.cursor < self.total_frames
    }

    pub fn is_at_end(&self) -> bool {
        self.cursor >= self.total_frames
    }

    pub fn kind_name(&self) -> &'static str {
        "iouring"
    }
}

impl std::fmt::Debug for UringReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UringReader")
            .field("path", &self.path)
            .field("open", &self.is_open())
            .field("total_frames", &self.total_frames)
            .field("in_flight", &self.pending.len())
            .finish()
    }
}

impl Drop for UringReader {
    fn drop(&mut self) {
        if self.is_open() {
            self.close();
        }
    }
}
