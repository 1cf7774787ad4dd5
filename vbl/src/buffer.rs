// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! The frame-sized unit of exchange between producers and consumers.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU32, Ordering};

use tracing::warn;

/// Who is responsible for freeing a buffer's backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// The pool allocated the region and deallocates it at pool drop.
    Owned,
    /// The pool only schedules the region; an external party owns it.
    External,
}

/// Where a buffer currently sits in the producer/consumer protocol.
///
/// Transitions are driven solely by pool operations; an illegal
/// transition is a bug in the pool, not a recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferState {
    /// Parked in the free queue.
    Idle = 0,
    /// Handed to a producer, not yet submitted.
    LockedByProducer = 1,
    /// Parked in the filled queue.
    ReadyForConsume = 2,
    /// Handed to a consumer, not yet released.
    LockedByConsumer = 3,
}

impl BufferState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => BufferState::Idle,
            1 => BufferState::LockedByProducer,
            2 => BufferState::ReadyForConsume,
            _ => BufferState::LockedByConsumer,
        }
    }
}

/// A pool-managed record describing one frame-sized region of memory.
///
/// A `Buffer` never owns the memory it points at; the pool's allocator or
/// an external [`crate::BufferHandle`] does. Buffers are handed out as
/// `Arc<Buffer>` and keep a stable identity (their `id`) for the pool's
/// lifetime.
///
/// # Thread Safety
///
/// State and reference count are atomics mutated only by pool operations
/// under the pool's lock. Payload access is exclusive by protocol: while a
/// buffer is `LockedByProducer` exactly one producer writes it, and while
/// `LockedByConsumer` exactly one consumer reads it. The raw slice views
/// are `unsafe` because the compiler cannot see that protocol.
#[derive(Debug)]
pub struct Buffer {
    id: u32,
    virt: *mut u8,
    phys: u64,
    size: usize,
    ownership: Ownership,
    state: AtomicU8,
    ref_count: AtomicU32,
    /// Lazily cached DMA-BUF descriptor from `export_dmabuf`; -1 = unset.
    dmabuf_fd: AtomicI32,
}

// Safety: the raw pointer is only dereferenced through the accessors
// below, whose exclusivity is guaranteed by the pool's state machine.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub(crate) fn new(id: u32, virt: *mut u8, phys: u64, size: usize, ownership: Ownership) -> Self {
        Self {
            id,
            virt,
            phys,
            size,
            ownership,
            state: AtomicU8::new(BufferState::Idle as u8),
            ref_count: AtomicU32::new(0),
            dmabuf_fd: AtomicI32::new(-1),
        }
    }

    /// Stable identity within the owning pool.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// CPU-visible address of the region.
    pub fn virt_addr(&self) -> *mut u8 {
        self.virt
    }

    /// Physical address for DMA scan-out, or 0 when unknown.
    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    /// Region size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn state(&self) -> BufferState {
        BufferState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// The exported DMA-BUF descriptor, if `export_dmabuf` ran for this id.
    pub fn dmabuf_fd(&self) -> Option<RawFd> {
        match self.dmabuf_fd.load(Ordering::Acquire) {
            fd if fd >= 0 => Some(fd),
            _ => None,
        }
    }

    /// Basic validity: a non-null region of non-zero size.
    pub fn is_valid(&self) -> bool {
        !self.virt.is_null() && self.size > 0
    }

    /// Copies `min(src.len(), self.size())` bytes into the buffer and
    /// returns the number copied.
    pub fn copy_from(&self, src: &[u8]) -> usize {
        if self.virt.is_null() {
            return 0;
        }
        let len = src.len().min(self.size);
        // Safety: region is valid for `size` bytes and the caller holds
        // the buffer in a producer- or consumer-locked state.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.virt, len) };
        len
    }

    /// Fills the whole region with `value`.
    pub fn fill(&self, value: u8) {
        if !self.virt.is_null() {
            // Safety: see `copy_from`.
            unsafe { std::ptr::write_bytes(self.virt, value, self.size) };
        }
    }

    /// Read view of the payload.
    ///
    /// # Safety
    ///
    /// The caller must hold this buffer from the pool (locked state) so
    /// no other party writes it concurrently, and the owning pool (or the
    /// external region behind it) must still be alive.
    pub unsafe fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.virt, self.size) }
    }

    /// Write view of the payload.
    ///
    /// # Safety
    ///
    /// Same contract as [`Self::as_slice`], and the caller must be the
    /// party the state machine grants exclusive access to.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.virt, self.size) }
    }

    pub(crate) fn set_state(&self, state: BufferState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn add_ref(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_ref(&self) {
        let prev = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev.is_err() {
            warn!(id = self.id, "reference count underflow on release");
        }
    }

    pub(crate) fn set_dmabuf_fd(&self, fd: RawFd) {
        self.dmabuf_fd.store(fd, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_record_is_invalid() {
        let buffer = Buffer::new(0, std::ptr::null_mut(), 0, 0, Ownership::External);
        assert!(!buffer.is_valid());
        assert_eq!(buffer.copy_from(&[1, 2, 3]), 0);
    }

    #[test]
    fn copy_is_bounded_by_buffer_size() {
        let mut backing = [0u8; 4];
        let buffer = Buffer::new(7, backing.as_mut_ptr(), 0, backing.len(), Ownership::External);
        assert!(buffer.is_valid());
        assert_eq!(buffer.copy_from(&[9, 9, 9, 9, 9, 9]), 4);
        assert_eq!(backing, [9, 9, 9, 9]);
    }

    #[test]
    fn refcount_never_goes_negative() {
        let mut backing = [0u8; 1];
        let buffer = Buffer::new(0, backing.as_mut_ptr(), 0, 1, Ownership::Owned);
        buffer.add_ref();
        buffer.release_ref();
        buffer.release_ref();
        assert_eq!(buffer.ref_count(), 0);
    }
}
