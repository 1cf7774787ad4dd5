// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! RTSP stream reader over the system GStreamer stack.
//!
//! The pipeline pins the transport to TCP with a bounded connect timeout,
//! decodes, converts to the requested output format and hands frames to
//! an appsink. An internal worker pulls samples and either stores them in
//! a bounded ring (buffered mode) or wraps each one as a [`BufferHandle`]
//! and injects it into a pool (injection mode).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::handle::BufferHandle;
use crate::pool::BufferPool;

/// Frame slots in the buffered-mode ring.
const RING_CAPACITY: usize = 30;
/// Bounded wait for a frame in buffered-mode reads.
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// rtspsrc tcp-timeout, microseconds.
const CONNECT_TIMEOUT_US: u64 = 5_000_000;
/// rtspsrc jitterbuffer latency, milliseconds.
const MAX_DELAY_MS: u32 = 500;

#[derive(Debug, Default)]
struct Stats {
    decoded: AtomicU64,
    injected: AtomicU64,
    dropped: AtomicU64,
}

/// Buffered-mode frame ring; overflow drops the oldest frame.
#[derive(Debug, Default)]
struct FrameRing {
    frames: Mutex<VecDeque<Vec<u8>>>,
    available: Condvar,
}

#[derive(Debug, Default)]
struct WorkerShared {
    running: AtomicBool,
    connected: AtomicBool,
    eos: AtomicBool,
    ring: FrameRing,
    stats: Stats,
}

/// Live RTSP frame source.
#[derive(Debug, Default)]
pub struct RtspReader {
    url: String,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    pipeline: Option<gst::Pipeline>,
    worker: Option<JoinHandle<()>>,
    shared: Arc<WorkerShared>,
    pool: Option<BufferPool>,
}

impl RtspReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, _path: &str) -> Result<()> {
        Err(Error::NotSupported(
            "RTSP streams need an explicit output format; use open_raw",
        ))
    }

    pub fn open_raw(&mut self, url: &str, width: u32, height: u32, bits_per_pixel: u32) -> Result<()> {
        if self.is_open() {
            warn!(url = %self.url, "stream already open, closing previous stream");
            self.close();
        }
        if width == 0 || height == 0 {
            return Err(Error::Config(format!("invalid output size {width}x{height}")));
        }
        let format = match bits_per_pixel {
            24 => "BGR",
            32 => "BGRA",
            other => {
                return Err(Error::Config(format!(
                    "unsupported bits_per_pixel {other} (only 24 and 32)"
                )));
            }
        };

        gst::init().map_err(|e| Error::Unavailable(format!("GStreamer init: {e}")))?;

        let launch = format!(
            "rtspsrc location={url} protocols=tcp tcp-timeout={CONNECT_TIMEOUT_US} latency={MAX_DELAY_MS} \
             ! decodebin ! videoconvert ! videoscale \
             ! video/x-raw,format={format},width={width},height={height} \
             ! appsink name=sink"
        );
        debug!(%launch, "building RTSP pipeline");

        let pipeline = gst::parse::launch(&launch)
            .map_err(|e| Error::Unavailable(format!("RTSP pipeline: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| Error::Unavailable("RTSP launch did not yield a pipeline".into()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| Error::Unavailable("appsink missing from RTSP pipeline".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| Error::Unavailable("sink element is not an appsink".into()))?;
        appsink.set_max_buffers(4);
        appsink.set_drop(true);
        appsink.set_property("sync", false);

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| Error::Unavailable(format!("RTSP connect: {e:?}")))?;

        let shared = Arc::new(WorkerShared::default());
        shared.running.store(true, Ordering::Release);
        shared.connected.store(true, Ordering::Release);

        let worker_shared = shared.clone();
        let worker_pool = self.pool.clone();
        let worker = std::thread::Builder::new()
            .name("vbl-rtsp-decode".into())
            .spawn(move || decode_worker(appsink, worker_shared, worker_pool))
            .map_err(|e| Error::Unavailable(format!("spawn decode worker: {e}")))?;

        self.url = url.to_string();
        self.width = width;
        self.height = height;
        self.bits_per_pixel = bits_per_pixel;
        self.pipeline = Some(pipeline);
        self.worker = Some(worker);
        self.shared = shared;

        info!(
            url,
            width,
            height,
            format,
            injecting = self.pool.is_some(),
            "RTSP stream opened"
        );
        Ok(())
    }

    pub fn close(&mut self) {
        if !self.is_open() {
            return;
        }
        self.shared.running.store(false, Ordering::Release);
        if let Some(pipeline) = self.pipeline.take() {
            // Null state makes the blocked pull_sample return an error,
            // releasing the worker.
            let _ = pipeline.set_state(gst::State::Null);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        self.shared.connected.store(false, Ordering::Release);
        info!(
            url = %self.url,
            decoded = self.shared.stats.decoded.load(Ordering::Relaxed),
            injected = self.shared.stats.injected.load(Ordering::Relaxed),
            dropped = self.shared.stats.dropped.load(Ordering::Relaxed),
            "RTSP stream closed"
        );
    }

    pub fn is_open(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Copies the oldest buffered frame into `dest`, waiting up to the
    /// bounded read timeout. In injection mode frames bypass this path
    /// entirely and the call is refused.
    pub fn read_frame(&mut self, dest: &Buffer) -> Result<()> {
        if self.is_injecting() {
            return Err(Error::NotSupported(
                "reader is in pool-injection mode; consume from the pool instead",
            ));
        }
        if !self.is_open() {
            return Err(Error::NotSupported("stream is not open"));
        }

        let shared = &self.shared;
        let mut frames = shared.ring.frames.lock().unwrap();
        if frames.is_empty() {
            let (guard, timeout) = shared
                .ring
                .available
                .wait_timeout_while(frames, READ_TIMEOUT, |f| {
                    f.is_empty() && shared.running.load(Ordering::Acquire)
                })
                .unwrap();
            frames = guard;
            if timeout.timed_out() && frames.is_empty() {
                return Err(Error::Timeout);
            }
        }
        let Some(frame) = frames.pop_front() else {
            return Err(Error::Timeout);
        };
        drop(frames);

        let copied = dest.copy_from(&frame);
        if copied < frame.len() {
            warn!(copied, frame = frame.len(), "destination truncated RTSP frame");
        }
        Ok(())
    }

    pub fn read_frame_at(&mut self, _index: u32, dest: &Buffer) -> Result<()> {
        // Live streams have no random access; serve the next frame.
        self.read_frame(dest)
    }

    pub fn read_frame_at_concurrent(&self, _index: u32, _dest: &Buffer) -> Result<()> {
        Err(Error::NotSupported("RTSP streams have no random access"))
    }

    pub fn seek(&mut self, _index: u32) -> Result<()> {
        Err(Error::NotSupported("RTSP streams cannot seek"))
    }

    pub fn seek_to_end(&mut self) -> Result<()> {
        Err(Error::NotSupported("RTSP streams cannot seek"))
    }

    pub fn skip(&mut self, _delta: i64) -> Result<()> {
        Err(Error::NotSupported("RTSP streams cannot skip"))
    }

    /// Effectively infinite.
    pub fn total_frames(&self) -> u32 {
        u32::MAX
    }

    pub fn current_index(&self) -> u32 {
        self.shared.stats.decoded.load(Ordering::Relaxed) as u32
    }

    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * self.bytes_per_pixel() as usize
    }

    pub fn file_size(&self) -> Option<u64> {
        None
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
        &self.url
    }

    pub fn has_more_frames(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire) && !self.shared.eos.load(Ordering::Acquire)
    }

    pub fn is_at_end(&self) -> bool {
        self.shared.eos.load(Ordering::Acquire)
    }

    pub fn kind_name(&self) -> &'static str {
        "rtsp"
    }

    /// Switches the reader to injection mode. Must be called before
    /// `open_raw`; the decode worker captures the pool at spawn.
    pub fn set_buffer_pool(&mut self, pool: Option<BufferPool>) {
        if self.is_open() {
            warn!("buffer pool injected after open is ignored until reopen");
        }
        match &pool {
            Some(_) => info!("RTSP reader switched to pool-injection mode"),
            None => debug!("RTSP reader in buffered mode"),
        }
        self.pool = pool;
    }

    pub fn is_injecting(&self) -> bool {
        self.pool.is_some()
    }

    /// Frames decoded since open.
    pub fn decoded_frames(&self) -> u64 {
        self.shared.stats.decoded.load(Ordering::Relaxed)
    }

    /// Frames successfully injected into the pool.
    pub fn injected_frames(&self) -> u64 {
        self.shared.stats.injected.load(Ordering::Relaxed)
    }

    /// Frames dropped: ring overflow in buffered mode, capacity-refused
    /// injections in injection mode.
    pub fn dropped_frames(&self) -> u64 {
        self.shared.stats.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for RtspReader {
    fn drop(&mut self) {
        self.close();
    }
}

fn decode_worker(appsink: gst_app::AppSink, shared: Arc<WorkerShared>, pool: Option<BufferPool>) {
    debug!("RTSP decode worker started");
    while shared.running.load(Ordering::Acquire) {
        let sample = match appsink.pull_sample() {
            Ok(sample) => sample,
            Err(_) => {
                // EOS or pipeline teardown.
                if shared.running.load(Ordering::Acquire) {
                    shared.eos.store(true, Ordering::Release);
                }
                break;
            }
        };
        let Some(gst_buffer) = sample.buffer() else {
            continue;
        };
        let Ok(mapped) = gst_buffer.map_readable() else {
            warn!("unmappable sample from appsink");
            continue;
        };

        shared.stats.decoded.fetch_add(1, Ordering::Relaxed);

        match &pool {
            Some(pool) => {
                if !inject_frame(pool, mapped.as_slice()) {
                    shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                } else {
                    shared.stats.injected.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                let mut frames = shared.ring.frames.lock().unwrap();
                if frames.len() >= RING_CAPACITY {
                    frames.pop_front();
                    shared.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                frames.push_back(mapped.as_slice().to_vec());
                shared.ring.available.notify_one();
            }
        }
    }
    debug!("RTSP decode worker finished");
}

/// Wraps one converted frame as a pool injection. The handle's release
/// action frees the frame copy when the consumer releases the buffer.
fn inject_frame(pool: &BufferPool, frame: &[u8]) -> bool {
    let boxed: Box<[u8]> = frame.into();
    let len = boxed.len();
    let raw = Box::into_raw(boxed) as *mut u8;

    let handle = match BufferHandle::with_release(raw, 0, len, move |ptr| {
        // Safety: `ptr`/`len` came from the Box leaked above, and the
        // release action runs exactly once.
        drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(ptr, len)) });
    }) {
        Ok(handle) => handle,
        Err(err) => {
            warn!("frame handle rejected: {err}");
            // Safety: same provenance as above; the handle never existed.
            drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(raw, len)) });
            return false;
        }
    };

    match pool.inject_filled(handle) {
        Ok(_) => true,
        Err(Error::QueueFull) => {
            debug!("pool at capacity, frame dropped");
            false
        }
        Err(err) => {
            warn!("frame injection failed: {err}");
            false
        }
    }
}
