// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! The buffer scheduler: free/filled queues between producers and
//! consumers, with blocking acquires, ownership validation, external
//! liveness tracking and dynamic injection of decoded frames.

use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::alloc::{self, BufferAllocator};
use crate::buffer::{Buffer, BufferState, Ownership};
use crate::error::{Error, Result};
use crate::handle::BufferHandle;
use crate::registry;

/// Description of one externally owned region for the simple external
/// pool mode (no liveness tracking).
#[derive(Debug, Clone, Copy)]
pub struct ExternalBufferInfo {
    pub virt: *mut u8,
    /// Physical address; 0 asks the pool to resolve it best-effort.
    pub phys: u64,
    pub size: usize,
}

/// A frame buffer pool coordinating producers and consumers.
///
/// The pool owns a set of [`Buffer`]s and moves them through two FIFO
/// queues: *free* (awaiting a producer) and *filled* (awaiting the
/// consumer). Four construction modes converge on the same operational
/// contract:
///
/// - [`BufferPool::new_owned`]: the pool allocates (and later frees)
///   the backing memory, optionally from a DMA heap.
/// - [`BufferPool::from_external`]: schedules caller-owned regions.
/// - [`BufferPool::from_handles`]: schedules caller-owned regions *and*
///   tracks their liveness through [`BufferHandle`] weak flags.
/// - [`BufferPool::new_dynamic`]: starts empty; decoded frames are
///   injected at runtime via [`BufferPool::inject_filled`].
///
/// `BufferPool` is a cheap clone over shared state (`Send + Sync`); every
/// clone addresses the same queues. The pool registers itself in the
/// process-wide [`crate::BufferPoolRegistry`] for introspection and
/// unregisters when the last clone drops.
///
/// # Examples
///
/// ```
/// use vbl::BufferPool;
///
/// # fn main() -> Result<(), vbl::Error> {
/// let pool = BufferPool::new_owned(4, 4096, false, "DemoPool", "Demo")?;
///
/// let buf = pool.try_acquire_free().expect("pool starts full");
/// buf.copy_from(&[0u8; 4096]);
/// pool.submit_filled(&buf);
///
/// let same = pool.try_acquire_filled().expect("one frame queued");
/// assert_eq!(same.id(), buf.id());
/// pool.release_filled(same);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

pub(crate) struct PoolShared {
    name: String,
    category: String,
    registry_id: AtomicU64,
    /// Population cap for dynamic injection; 0 = unlimited.
    max_capacity: usize,
    allocator: Mutex<BufferAllocator>,
    /// Liveness flags for tracked external buffers, indexed by buffer id.
    /// Empty in every other mode.
    trackers: Vec<Weak<AtomicBool>>,
    /// Owned handles for tracked external buffers; their release actions
    /// run when the pool drops.
    external_handles: Mutex<Vec<BufferHandle>>,
    state: Mutex<PoolState>,
    free_cv: Condvar,
    filled_cv: Condvar,
    /// Handles behind dynamically injected buffers, keyed by buffer id.
    /// Lock ordering: transient before `state`; handle release actions
    /// never run under either lock.
    transient: Mutex<HashMap<u32, BufferHandle>>,
    next_id: AtomicU32,
}

struct PoolState {
    /// id -> buffer, the ownership authority for every mode.
    buffers: HashMap<u32, Arc<Buffer>>,
    free: VecDeque<Arc<Buffer>>,
    filled: VecDeque<Arc<Buffer>>,
    /// Frame size; 0 in dynamic mode until set or first injection.
    buffer_size: usize,
}

enum WaitMode {
    NoWait,
    Forever,
    Until(Instant),
}

impl BufferPool {
    /// Creates a pool that allocates `count` buffers of `size` bytes.
    ///
    /// With `use_dma` the buffers come from a DMA heap and carry physical
    /// addresses for zero-copy display; if the heap fails mid-way the
    /// pool downgrades to normal memory for the remaining buffers with a
    /// warning. Any other allocation failure rolls back everything
    /// already allocated.
    pub fn new_owned(
        count: usize,
        size: usize,
        use_dma: bool,
        name: &str,
        category: &str,
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::InvalidArg("buffer count must be at least 1".into()));
        }
        if size == 0 {
            return Err(Error::InvalidArg("buffer size must be non-zero".into()));
        }

        let mut allocator = if use_dma {
            BufferAllocator::dma()
        } else {
            BufferAllocator::normal()
        };
        info!(
            name,
            count,
            size,
            allocator = allocator.name(),
            "creating owned buffer pool"
        );

        let mut state = PoolState {
            buffers: HashMap::with_capacity(count),
            free: VecDeque::with_capacity(count),
            filled: VecDeque::new(),
            buffer_size: size,
        };

        for id in 0..count as u32 {
            let allocation = match allocator.allocate(size) {
                Ok(allocation) => allocation,
                Err(err) if allocator.is_dma() => {
                    warn!(
                        buffer = id,
                        "DMA allocation failed ({err}), downgrading to normal memory"
                    );
                    allocator.degrade();
                    match allocator.allocate(size) {
                        Ok(allocation) => allocation,
                        Err(err) => {
                            Self::rollback(&mut allocator, &state);
                            return Err(err);
                        }
                    }
                }
                Err(err) => {
                    Self::rollback(&mut allocator, &state);
                    return Err(err);
                }
            };

            let buffer = Arc::new(Buffer::new(
                id,
                allocation.virt,
                allocation.phys,
                size,
                Ownership::Owned,
            ));
            debug!(id, virt = ?allocation.virt, phys = allocation.phys, "buffer allocated");
            state.buffers.insert(id, buffer.clone());
            state.free.push_back(buffer);
        }

        Ok(Self::finish(
            name,
            category,
            0,
            allocator,
            Vec::new(),
            Vec::new(),
            state,
            count as u32,
        ))
    }

    /// Creates a pool over caller-owned regions without liveness
    /// tracking (e.g. memory-mapped framebuffer slices).
    pub fn from_external(
        infos: &[ExternalBufferInfo],
        name: &str,
        category: &str,
    ) -> Result<Self> {
        if infos.is_empty() {
            return Err(Error::InvalidArg("external buffer list is empty".into()));
        }

        let buffer_size = infos[0].size;
        let mut state = PoolState {
            buffers: HashMap::with_capacity(infos.len()),
            free: VecDeque::with_capacity(infos.len()),
            filled: VecDeque::new(),
            buffer_size,
        };

        for (id, info) in (0u32..).zip(infos) {
            if info.virt.is_null() || info.size == 0 {
                return Err(Error::InvalidArg(format!("external buffer #{id} is invalid")));
            }
            if info.size != buffer_size {
                warn!(
                    id,
                    size = info.size,
                    expected = buffer_size,
                    "external buffer size mismatch"
                );
            }
            let phys = if info.phys != 0 {
                info.phys
            } else {
                alloc::physical_address(info.virt)
            };
            let buffer = Arc::new(Buffer::new(id, info.virt, phys, info.size, Ownership::External));
            state.buffers.insert(id, buffer.clone());
            state.free.push_back(buffer);
        }

        info!(name, count = infos.len(), buffer_size, "created external buffer pool");
        let count = infos.len() as u32;
        Ok(Self::finish(
            name,
            category,
            0,
            BufferAllocator::external(),
            Vec::new(),
            Vec::new(),
            state,
            count,
        ))
    }

    /// Creates a pool over caller-owned regions with liveness tracking.
    ///
    /// The pool keeps the handles (their release actions run at pool
    /// drop) and a weak view of each handle's alive flag; a buffer whose
    /// flag has gone false is never handed out again.
    pub fn from_handles(
        handles: Vec<BufferHandle>,
        name: &str,
        category: &str,
    ) -> Result<Self> {
        if handles.is_empty() {
            return Err(Error::InvalidArg("buffer handle list is empty".into()));
        }

        let buffer_size = handles[0].size();
        let mut state = PoolState {
            buffers: HashMap::with_capacity(handles.len()),
            free: VecDeque::with_capacity(handles.len()),
            filled: VecDeque::new(),
            buffer_size,
        };
        let mut trackers = Vec::with_capacity(handles.len());

        for (id, handle) in (0u32..).zip(&handles) {
            let phys = if handle.phys_addr() != 0 {
                handle.phys_addr()
            } else {
                alloc::physical_address(handle.virt_addr())
            };
            let buffer = Arc::new(Buffer::new(
                id,
                handle.virt_addr(),
                phys,
                handle.size(),
                Ownership::External,
            ));
            trackers.push(handle.lifetime_tracker());
            state.buffers.insert(id, buffer.clone());
            state.free.push_back(buffer);
        }

        info!(name, count = handles.len(), buffer_size, "created tracked external buffer pool");
        let count = handles.len() as u32;
        Ok(Self::finish(
            name,
            category,
            0,
            BufferAllocator::external(),
            trackers,
            handles,
            state,
            count,
        ))
    }

    /// Creates an empty pool for dynamic injection of decoded frames.
    ///
    /// The frame size is locked in by [`Self::set_buffer_size`] or by the
    /// first injection. `max_capacity` caps the live population
    /// (0 = unlimited); injections beyond the cap fail with
    /// [`Error::QueueFull`].
    pub fn new_dynamic(name: &str, category: &str, max_capacity: usize) -> Self {
        info!(name, max_capacity, "created dynamic-injection buffer pool");
        Self::finish(
            name,
            category,
            max_capacity,
            BufferAllocator::external(),
            Vec::new(),
            Vec::new(),
            PoolState {
                buffers: HashMap::new(),
                free: VecDeque::new(),
                filled: VecDeque::new(),
                buffer_size: 0,
            },
            0,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        name: &str,
        category: &str,
        max_capacity: usize,
        allocator: BufferAllocator,
        trackers: Vec<Weak<AtomicBool>>,
        external_handles: Vec<BufferHandle>,
        state: PoolState,
        next_id: u32,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            name: name.to_string(),
            category: category.to_string(),
            registry_id: AtomicU64::new(0),
            max_capacity,
            allocator: Mutex::new(allocator),
            trackers,
            external_handles: Mutex::new(external_handles),
            state: Mutex::new(state),
            free_cv: Condvar::new(),
            filled_cv: Condvar::new(),
            transient: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(next_id),
        });
        let id = registry::global().register(Arc::downgrade(&shared), name, category);
        shared.registry_id.store(id, Ordering::Release);
        Self { shared }
    }

    fn rollback(allocator: &mut BufferAllocator, state: &PoolState) {
        warn!("pool construction failed, releasing partial allocation");
        for buffer in state.buffers.values() {
            allocator.deallocate(buffer.virt_addr(), buffer.size());
        }
    }

    // ---- producer side ------------------------------------------------

    /// Takes a free buffer, blocking until one is available.
    ///
    /// `timeout` of `None` waits forever. On success the buffer is
    /// `LockedByProducer` with its reference count raised. Returns `None`
    /// on timeout, or when the head of the queue failed validation (it is
    /// put back at the tail; the caller retries or gives up).
    pub fn acquire_free(&self, timeout: Option<Duration>) -> Option<Arc<Buffer>> {
        let wait = match timeout {
            Some(t) => WaitMode::Until(Instant::now() + t),
            None => WaitMode::Forever,
        };
        self.wait_pop(false, wait)
    }

    /// Non-blocking variant of [`Self::acquire_free`].
    pub fn try_acquire_free(&self) -> Option<Arc<Buffer>> {
        self.wait_pop(false, WaitMode::NoWait)
    }

    /// Hands a filled buffer to the consumer side.
    ///
    /// A buffer that does not belong to this pool is warned about and
    /// ignored; the queues stay untouched.
    pub fn submit_filled(&self, buffer: &Arc<Buffer>) {
        let mut state = self.lock_state();
        if !Self::is_member(&state, buffer) {
            warn!(id = buffer.id(), pool = %self.shared.name, "submit of foreign buffer ignored");
            return;
        }
        buffer.set_state(BufferState::ReadyForConsume);
        state.filled.push_back(buffer.clone());
        self.shared.filled_cv.notify_one();
    }

    /// Returns a never-submitted buffer straight to the free queue.
    ///
    /// This is the producer-side cancel path for read failures: the
    /// buffer ends Idle in the free queue with its reference count back
    /// at zero.
    pub fn cancel_acquire(&self, buffer: Arc<Buffer>) {
        self.recycle(buffer);
    }

    // ---- consumer side ------------------------------------------------

    /// Takes a filled buffer, blocking until one is available.
    ///
    /// Symmetric to [`Self::acquire_free`]; the producer's reference
    /// count survives until [`Self::release_filled`].
    pub fn acquire_filled(&self, timeout: Option<Duration>) -> Option<Arc<Buffer>> {
        let wait = match timeout {
            Some(t) => WaitMode::Until(Instant::now() + t),
            None => WaitMode::Forever,
        };
        self.wait_pop(true, wait)
    }

    /// Non-blocking variant of [`Self::acquire_filled`].
    pub fn try_acquire_filled(&self) -> Option<Arc<Buffer>> {
        self.wait_pop(true, WaitMode::NoWait)
    }

    /// Releases a consumed buffer.
    ///
    /// An injected (transient) buffer is ejected: removed from the pool
    /// and its handle dropped, which runs the release action (frame
    /// recycling back to the decoder) outside all pool locks. Any other
    /// buffer goes back to the free queue.
    pub fn release_filled(&self, buffer: Arc<Buffer>) {
        // Lock ordering: transient before state.
        let ejected = {
            let mut transient = self.lock_transient();
            if transient.contains_key(&buffer.id()) {
                let mut state = self.lock_state();
                if !Self::is_member(&state, &buffer) {
                    warn!(id = buffer.id(), pool = %self.shared.name, "release of foreign buffer ignored");
                    return;
                }
                state.buffers.remove(&buffer.id());
                transient.remove(&buffer.id())
            } else {
                None
            }
        };

        if let Some(handle) = ejected {
            debug!(id = buffer.id(), pool = %self.shared.name, "transient buffer ejected");
            drop(handle); // release action runs here, lock-free
            return;
        }

        self.recycle(buffer);
    }

    fn recycle(&self, buffer: Arc<Buffer>) {
        let mut state = self.lock_state();
        if !Self::is_member(&state, &buffer) {
            warn!(id = buffer.id(), pool = %self.shared.name, "release of foreign buffer ignored");
            return;
        }
        buffer.release_ref();
        buffer.set_state(BufferState::Idle);
        state.free.push_back(buffer);
        // All waiting producers may compete for the recycled buffer.
        self.shared.free_cv.notify_all();
    }

    // ---- dynamic injection --------------------------------------------

    /// Inserts an externally filled buffer directly into the filled
    /// queue.
    ///
    /// The new buffer gets a fresh id, external ownership and state
    /// `ReadyForConsume`; its handle is retained until
    /// [`Self::release_filled`] ejects it. Fails with
    /// [`Error::QueueFull`] at the capacity cap, [`Error::Expired`] for
    /// dead handles and [`Error::InvalidArg`] for frame-size mismatches.
    pub fn inject_filled(&self, handle: BufferHandle) -> Result<Arc<Buffer>> {
        if !handle.is_alive() {
            return Err(Error::Expired);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::AcqRel);
        let buffer = Arc::new(Buffer::new(
            id,
            handle.virt_addr(),
            handle.phys_addr(),
            handle.size(),
            Ownership::External,
        ));
        buffer.set_state(BufferState::ReadyForConsume);

        {
            let mut transient = self.lock_transient();
            let mut state = self.lock_state();

            if self.shared.max_capacity > 0 && state.buffers.len() >= self.shared.max_capacity {
                return Err(Error::QueueFull);
            }
            if state.buffer_size == 0 {
                state.buffer_size = handle.size();
                debug!(pool = %self.shared.name, size = handle.size(), "buffer size inferred from first injection");
            } else if handle.size() != state.buffer_size {
                return Err(Error::InvalidArg(format!(
                    "injected buffer size {} does not match pool size {}",
                    handle.size(),
                    state.buffer_size
                )));
            }

            transient.insert(id, handle);
            state.buffers.insert(id, buffer.clone());
            state.filled.push_back(buffer.clone());
            self.shared.filled_cv.notify_one();
        }

        Ok(buffer)
    }

    /// Locks in the frame size of a dynamic pool before first use.
    pub fn set_buffer_size(&self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArg("buffer size must be non-zero".into()));
        }
        let mut state = self.lock_state();
        if state.buffer_size != 0 {
            return Err(Error::InvalidArg(format!(
                "buffer size already set to {}",
                state.buffer_size
            )));
        }
        state.buffer_size = size;
        info!(pool = %self.shared.name, size, "buffer size set");
        Ok(())
    }

    // ---- validation and export ----------------------------------------

    /// Full validity check: basic validity, pool membership, and, for
    /// tracked external buffers, an alive liveness flag.
    pub fn validate_buffer(&self, buffer: &Arc<Buffer>) -> bool {
        let state = self.lock_state();
        self.validate_locked(&state, buffer)
    }

    /// Validates every buffer currently known to the pool.
    pub fn validate_all(&self) -> bool {
        let state = self.lock_state();
        state.buffers.values().all(|b| self.validate_locked(&state, b))
    }

    /// Exports a buffer as a DMA-BUF descriptor for cross-process
    /// sharing. Only buffers from a DMA-heap allocator qualify; the
    /// descriptor is cached on the buffer.
    pub fn export_dmabuf(&self, id: u32) -> Result<RawFd> {
        let buffer = self
            .buffer_by_id(id)
            .ok_or_else(|| Error::InvalidArg(format!("no buffer with id {id}")))?;
        if let Some(fd) = buffer.dmabuf_fd() {
            return Ok(fd);
        }

        let allocator = self.shared.allocator.lock().unwrap();
        if !allocator.is_dma() {
            return Err(Error::NotSupported(
                "only DMA-heap buffers can be exported as DMA-BUF",
            ));
        }
        let fd = allocator.dmabuf_fd(buffer.virt_addr()).ok_or_else(|| {
            Error::Unavailable(format!("no DMA descriptor recorded for buffer {id}"))
        })?;
        buffer.set_dmabuf_fd(fd);
        debug!(id, fd, "buffer exported as DMA-BUF");
        Ok(fd)
    }

    // ---- queries ------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn category(&self) -> &str {
        &self.shared.category
    }

    /// Id under which this pool is registered in the global registry.
    pub fn registry_id(&self) -> u64 {
        self.shared.registry_id.load(Ordering::Acquire)
    }

    pub fn free_count(&self) -> usize {
        self.lock_state().free.len()
    }

    pub fn filled_count(&self) -> usize {
        self.lock_state().filled.len()
    }

    /// Current buffer population (fixed for non-injection pools).
    pub fn total_count(&self) -> usize {
        self.lock_state().buffers.len()
    }

    /// Configured frame size; 0 for a dynamic pool before first use.
    pub fn buffer_size(&self) -> usize {
        self.lock_state().buffer_size
    }

    /// Total bytes scheduled by this pool.
    pub fn memory_bytes(&self) -> usize {
        let state = self.lock_state();
        state.buffers.values().map(|b| b.size()).sum()
    }

    pub fn buffer_by_id(&self, id: u32) -> Option<Arc<Buffer>> {
        self.lock_state().buffers.get(&id).cloned()
    }

    /// Logs a statistics snapshot at info level.
    pub fn log_stats(&self) {
        let state = self.lock_state();
        info!(
            pool = %self.shared.name,
            category = %self.shared.category,
            total = state.buffers.len(),
            free = state.free.len(),
            filled = state.filled.len(),
            buffer_size = state.buffer_size,
            "pool statistics"
        );
    }

    // ---- internals ----------------------------------------------------

    fn wait_pop(&self, filled: bool, wait: WaitMode) -> Option<Arc<Buffer>> {
        let shared = &self.shared;
        let mut state = self.lock_state();

        loop {
            let popped = if filled {
                state.filled.pop_front()
            } else {
                state.free.pop_front()
            };

            if let Some(buffer) = popped {
                if !self.validate_locked(&state, &buffer) {
                    warn!(
                        id = buffer.id(),
                        pool = %shared.name,
                        "invalid buffer at queue head, returning it to the tail"
                    );
                    if filled {
                        state.filled.push_back(buffer);
                    } else {
                        state.free.push_back(buffer);
                    }
                    return None;
                }
                if filled {
                    buffer.set_state(BufferState::LockedByConsumer);
                } else {
                    buffer.set_state(BufferState::LockedByProducer);
                    buffer.add_ref();
                }
                return Some(buffer);
            }

            let cv = if filled { &shared.filled_cv } else { &shared.free_cv };
            state = match wait {
                WaitMode::NoWait => return None,
                WaitMode::Forever => cv.wait(state).unwrap(),
                WaitMode::Until(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    cv.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
    }

    fn is_member(state: &PoolState, buffer: &Arc<Buffer>) -> bool {
        state
            .buffers
            .get(&buffer.id())
            .is_some_and(|known| Arc::ptr_eq(known, buffer))
    }

    fn validate_locked(&self, state: &PoolState, buffer: &Arc<Buffer>) -> bool {
        if !buffer.is_valid() {
            return false;
        }
        if !Self::is_member(state, buffer) {
            return false;
        }
        if buffer.ownership() == Ownership::External {
            if let Some(tracker) = self.shared.trackers.get(buffer.id() as usize) {
                match tracker.upgrade() {
                    Some(alive) if alive.load(Ordering::Acquire) => {}
                    Some(_) => {
                        warn!(id = buffer.id(), "external buffer has been destroyed");
                        return false;
                    }
                    None => {
                        warn!(id = buffer.id(), "external buffer lifetime tracker expired");
                        return false;
                    }
                }
            }
        }
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.shared.state.lock().unwrap()
    }

    fn lock_transient(&self) -> std::sync::MutexGuard<'_, HashMap<u32, BufferHandle>> {
        self.shared.transient.lock().unwrap()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("BufferPool")
            .field("name", &self.shared.name)
            .field("total", &state.buffers.len())
            .field("free", &state.free.len())
            .field("filled", &state.filled.len())
            .finish()
    }
}

impl PoolShared {
    /// Snapshot for the registry: (total, free, filled, buffer_size).
    pub(crate) fn counts(&self) -> (usize, usize, usize, usize) {
        let state = self.state.lock().unwrap();
        (
            state.buffers.len(),
            state.free.len(),
            state.filled.len(),
            state.buffer_size,
        )
    }

    pub(crate) fn memory_bytes(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.buffers.values().map(|b| b.size()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tracked-external pool with one handle destroyed out from under
    /// it: the live buffer is handed out, the dead one is returned to
    /// the queue tail and every acquire of it yields `None`.
    #[test]
    fn dead_tracked_external_buffer_is_never_handed_out() {
        let mut region_a = vec![0u8; 32];
        let mut region_b = vec![0u8; 32];
        let handle_a = BufferHandle::new(region_a.as_mut_ptr(), 0, 32).unwrap();
        let handle_b = BufferHandle::new(region_b.as_mut_ptr(), 0, 32).unwrap();

        let pool = BufferPool::from_handles(vec![handle_a, handle_b], "TrackedLiveness", "Test").unwrap();

        // The external owner tears down the second region.
        let dead = pool.shared.external_handles.lock().unwrap().pop();
        drop(dead);

        let live = pool.try_acquire_free().expect("buffer 0 is still alive");
        assert_eq!(live.id(), 0);

        // Head of the queue is now the dead buffer: refused, requeued.
        assert!(pool.try_acquire_free().is_none());
        assert!(pool.try_acquire_free().is_none());
        assert_eq!(pool.free_count(), 1);

        let dead_buffer = pool.buffer_by_id(1).unwrap();
        assert!(!pool.validate_buffer(&dead_buffer));
        assert!(pool.validate_buffer(&live));

        // Once every source handle is gone, no acquire succeeds.
        pool.cancel_acquire(live);
        pool.shared.external_handles.lock().unwrap().clear();
        assert!(pool.try_acquire_free().is_none());
        assert!(pool.acquire_free(Some(Duration::from_millis(10))).is_none());
    }

    /// The transient table never captures fixed-set buffers: releasing a
    /// pool-owned buffer goes through the recycle path even when
    /// injected buffers exist alongside it.
    #[test]
    fn mixed_owned_and_injected_release_paths() {
        let pool = BufferPool::new_owned(1, 16, false, "MixedRelease", "Test").unwrap();
        // A second dynamic pool shares the process but not the buffers.
        let dynamic = BufferPool::new_dynamic("MixedReleaseDyn", "Test", 0);

        let mut region = vec![0u8; 16];
        dynamic
            .inject_filled(BufferHandle::new(region.as_mut_ptr(), 0, 16).unwrap())
            .unwrap();

        let owned = pool.try_acquire_free().unwrap();
        pool.submit_filled(&owned);
        let owned = pool.try_acquire_filled().unwrap();
        pool.release_filled(owned);
        assert_eq!(pool.free_count(), 1);
        assert_eq!(pool.total_count(), 1);

        let injected = dynamic.try_acquire_filled().unwrap();
        dynamic.release_filled(injected);
        assert_eq!(dynamic.total_count(), 0);
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        registry::global().unregister(self.registry_id.load(Ordering::Acquire));

        let allocator = self
            .allocator
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for buffer in state.buffers.values() {
            if buffer.ownership() == Ownership::Owned {
                allocator.deallocate(buffer.virt_addr(), buffer.size());
            }
        }
        // External and transient handles drop with their fields, running
        // the release actions.
        debug!(name = %self.name, "buffer pool destroyed");
    }
}
