// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Multi-worker frame producer feeding a buffer pool from a reader.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::BufferPool;
use crate::reader::{ReaderType, VideoReader, factory};

/// How long one acquire attempt waits before re-checking the stop flag.
const ACQUIRE_TIMEOUT: Duration = Duration::from_millis(100);
/// Consecutive read failures a worker tolerates before escalating.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;
/// Poll interval for workers idled by an injection-mode reader.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Callback invoked with the first fatal producer error.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Configuration for one producer run.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Raw file path, or stream URL for the RTSP reader.
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
    /// Restart from frame 0 after the last frame.
    pub loop_playback: bool,
    /// Worker threads; 2-4 is the useful range for file sources.
    pub thread_count: usize,
    pub reader_type: ReaderType,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            width: 0,
            height: 0,
            bits_per_pixel: 0,
            loop_playback: false,
            thread_count: 1,
            reader_type: ReaderType::Auto,
        }
    }
}

#[derive(Default)]
struct ProducerStats {
    running: AtomicBool,
    /// Workers still in their loop; the last one to exit clears
    /// `running` so observers see end-of-file as a stop.
    active_workers: AtomicUsize,
    produced: AtomicU64,
    skipped: AtomicU64,
    /// Global frame cursor shared by all workers.
    next_index: AtomicU64,
    last_error: Mutex<String>,
}

impl ProducerStats {
    fn report(&self, message: String, callback: &Option<ErrorCallback>) {
        warn!("producer error: {message}");
        *self.last_error.lock().unwrap() = message.clone();
        if let Some(callback) = callback {
            let hook = callback.clone();
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || hook(&message)))
                .is_err()
            {
                warn!("error callback panicked");
            }
        }
    }
}

/// Drives one or more worker threads that acquire free buffers, fill
/// them from a shared reader and submit them to the pool.
///
/// Workers split the frame sequence through a single atomic cursor, so
/// the *set* of produced indices covers the file exactly; the order in
/// the filled queue may interleave when `thread_count > 1`, which video
/// playback tolerates. Readers that inject frames themselves (RTSP with
/// a pool) idle the workers and produce from their own decode thread.
pub struct VideoProducer {
    pool: BufferPool,
    stats: Arc<ProducerStats>,
    error_callback: Option<ErrorCallback>,
    reader: Option<Arc<VideoReader>>,
    workers: Vec<JoinHandle<()>>,
    total_frames: u32,
    started_at: Option<Instant>,
    run_time: Option<Duration>,
}

impl VideoProducer {
    /// Creates a producer bound to `pool`. Nothing runs until
    /// [`Self::start`].
    pub fn new(pool: BufferPool) -> Self {
        Self {
            pool,
            stats: Arc::new(ProducerStats::default()),
            error_callback: None,
            reader: None,
            workers: Vec::new(),
            total_frames: 0,
            started_at: None,
            run_time: None,
        }
    }

    /// Installs the callback that receives the first fatal error. Takes
    /// effect at the next [`Self::start`].
    pub fn set_error_callback(&mut self, callback: impl Fn(&str) + Send + Sync + 'static) {
        self.error_callback = Some(Arc::new(callback));
    }

    /// Opens the reader and launches the worker threads.
    ///
    /// The pool is handed to the reader unconditionally (readers without
    /// an injection path ignore it), and the pool's frame size is
    /// reconciled with the reader's: a dynamic pool adopts it, any other
    /// pool must match exactly.
    pub fn start(&mut self, config: &ProducerConfig) -> Result<()> {
        if self.stats.running.load(Ordering::Acquire) {
            return Err(Error::Config("producer already running".into()));
        }
        if config.path.is_empty() {
            return Err(Error::Config("source path is empty".into()));
        }
        if config.thread_count < 1 {
            return Err(Error::Config("thread count must be at least 1".into()));
        }
        if config.width == 0 || config.height == 0 || config.bits_per_pixel == 0 {
            return Err(Error::Config(format!(
                "invalid frame format {}x{}x{}",
                config.width, config.height, config.bits_per_pixel
            )));
        }

        let mut reader = factory::create(config.reader_type)?;
        reader.set_buffer_pool(Some(self.pool.clone()));
        reader.open_raw(&config.path, config.width, config.height, config.bits_per_pixel)?;

        let total_frames = reader.total_frames();
        let frame_size = reader.frame_size();
        info!(
            path = %config.path,
            reader = reader.kind_name(),
            total_frames,
            frame_size,
            threads = config.thread_count,
            loop_playback = config.loop_playback,
            "starting producer"
        );

        match self.pool.buffer_size() {
            0 => self.pool.set_buffer_size(frame_size)?,
            pool_size if pool_size != frame_size => {
                return Err(Error::Config(format!(
                    "frame size mismatch: reader {frame_size}, pool {pool_size}"
                )));
            }
            _ => {}
        }

        let injecting = reader.is_injecting();
        let reader = Arc::new(reader);

        let stats = Arc::new(ProducerStats::default());
        stats.running.store(true, Ordering::Release);
        stats.active_workers.store(config.thread_count, Ordering::Release);
        self.stats = stats.clone();
        self.total_frames = total_frames;
        self.started_at = Some(Instant::now());
        self.run_time = None;

        let mut workers = Vec::with_capacity(config.thread_count);
        for tid in 0..config.thread_count {
            let ctx = WorkerCtx {
                tid,
                stats: stats.clone(),
                pool: self.pool.clone(),
                reader: reader.clone(),
                total_frames,
                loop_playback: config.loop_playback,
                injecting,
                callback: self.error_callback.clone(),
            };
            let worker = std::thread::Builder::new()
                .name(format!("vbl-producer-{tid}"))
                .spawn(move || worker_loop(ctx));
            match worker {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    stats.running.store(false, Ordering::Release);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(Error::Unavailable(format!("spawn worker {tid}: {err}")));
                }
            }
        }

        self.reader = Some(reader);
        self.workers = workers;
        Ok(())
    }

    /// Stops the workers and closes the reader. Workers return within
    /// one acquire timeout plus one in-flight read.
    pub fn stop(&mut self) {
        if !self.stats.running.swap(false, Ordering::AcqRel) && self.workers.is_empty() {
            return;
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.reader = None;
        if let Some(started) = self.started_at {
            self.run_time = Some(started.elapsed());
        }
        info!(
            produced = self.produced_frames(),
            skipped = self.skipped_frames(),
            average_fps = format!("{:.2}", self.average_fps()),
            "producer stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.stats.running.load(Ordering::Acquire)
    }

    pub fn produced_frames(&self) -> u64 {
        self.stats.produced.load(Ordering::Relaxed)
    }

    pub fn skipped_frames(&self) -> u64 {
        self.stats.skipped.load(Ordering::Relaxed)
    }

    pub fn total_frames(&self) -> u32 {
        self.total_frames
    }

    /// Frames produced per second, over the run so far (or the whole run
    /// once stopped).
    pub fn average_fps(&self) -> f64 {
        let elapsed = match (self.run_time, self.started_at) {
            (Some(run_time), _) => run_time,
            (None, Some(started)) => started.elapsed(),
            _ => return 0.0,
        };
        let seconds = elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.produced_frames() as f64 / seconds
        } else {
            0.0
        }
    }

    pub fn last_error(&self) -> String {
        self.stats.last_error.lock().unwrap().clone()
    }
}

impl Drop for VideoProducer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct WorkerCtx {
    tid: usize,
    stats: Arc<ProducerStats>,
    pool: BufferPool,
    reader: Arc<VideoReader>,
    total_frames: u32,
    loop_playback: bool,
    injecting: bool,
    callback: Option<ErrorCallback>,
}

fn worker_loop(ctx: WorkerCtx) {
    debug!(tid = ctx.tid, "producer worker started");
    run_worker(&ctx);
    if ctx.stats.active_workers.fetch_sub(1, Ordering::AcqRel) == 1 {
        // Last worker out: end of source (or escalated failure).
        ctx.stats.running.store(false, Ordering::Release);
    }
    debug!(tid = ctx.tid, "producer worker finished");
}

fn run_worker(ctx: &WorkerCtx) {
    if ctx.injecting {
        // The reader's own decode thread produces; keep the worker alive
        // only to honor the start/stop lifecycle.
        while ctx.stats.running.load(Ordering::Acquire) {
            std::thread::sleep(IDLE_POLL);
        }
        return;
    }

    let mut consecutive_failures = 0u32;
    let total = ctx.total_frames as u64;

    while ctx.stats.running.load(Ordering::Acquire) {
        let claimed = ctx.stats.next_index.fetch_add(1, Ordering::AcqRel);
        let index = if claimed >= total {
            if !ctx.loop_playback {
                break;
            }
            let wrapped = claimed % total;
            // Pull the shared cursor back down before it grows without
            // bound; any worker may win, losers retry next iteration.
            let current = ctx.stats.next_index.load(Ordering::Acquire);
            if current > total * 2 {
                let _ = ctx.stats.next_index.compare_exchange(
                    current,
                    wrapped + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            wrapped as u32
        } else {
            claimed as u32
        };

        let mut buffer = None;
        while ctx.stats.running.load(Ordering::Acquire) && buffer.is_none() {
            buffer = ctx.pool.acquire_free(Some(ACQUIRE_TIMEOUT));
        }
        let Some(buffer) = buffer else { break };

        match ctx.reader.read_frame_at_concurrent(index, &buffer) {
            Ok(()) => {
                consecutive_failures = 0;
                ctx.pool.submit_filled(&buffer);
                ctx.stats.produced.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                ctx.stats.skipped.fetch_add(1, Ordering::Relaxed);
                ctx.pool.cancel_acquire(buffer);
                consecutive_failures += 1;
                warn!(tid = ctx.tid, index, "frame read failed: {err}");
                if consecutive_failures > MAX_CONSECUTIVE_FAILURES {
                    ctx.stats.report(
                        format!(
                            "worker {}: {consecutive_failures} consecutive read failures, last: {err}",
                            ctx.tid
                        ),
                        &ctx.callback,
                    );
                    break;
                }
            }
        }
    }
}
