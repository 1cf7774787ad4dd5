// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! RAII ownership of one externally supplied memory region.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::error;

use crate::error::{Error, Result};

/// Release action invoked exactly once when the handle is dropped.
pub type ReleaseFn = Box<dyn FnOnce(*mut u8) + Send>;

/// Carries ownership of one externally supplied region into a pool.
///
/// The handle guarantees that its release action runs exactly once, and
/// that any pool still holding a [`Self::lifetime_tracker`] observes the
/// region as dead *before* the action runs. Typical sources are decoder
/// output frames and memory-mapped framebuffer slices.
///
/// Handles are move-only; there is no way to duplicate the release
/// obligation.
pub struct BufferHandle {
    virt: *mut u8,
    phys: u64,
    size: usize,
    release: Option<ReleaseFn>,
    alive: Arc<AtomicBool>,
}

// Safety: the pointer is an opaque token here; the handle never
// dereferences it, only passes it to the release action (which is Send).
unsafe impl Send for BufferHandle {}

impl BufferHandle {
    /// Wraps a region with no release action (the caller keeps ownership
    /// of the memory; the handle only tracks liveness).
    pub fn new(virt: *mut u8, phys: u64, size: usize) -> Result<Self> {
        Self::build(virt, phys, size, None)
    }

    /// Wraps a region together with the action that frees or recycles it.
    pub fn with_release(
        virt: *mut u8,
        phys: u64,
        size: usize,
        release: impl FnOnce(*mut u8) + Send + 'static,
    ) -> Result<Self> {
        Self::build(virt, phys, size, Some(Box::new(release)))
    }

    fn build(virt: *mut u8, phys: u64, size: usize, release: Option<ReleaseFn>) -> Result<Self> {
        if virt.is_null() {
            return Err(Error::InvalidArg("null region for buffer handle".into()));
        }
        if size == 0 {
            return Err(Error::InvalidArg("zero-sized region for buffer handle".into()));
        }
        Ok(Self {
            virt,
            phys,
            size,
            release,
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn virt_addr(&self) -> *mut u8 {
        self.virt
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the region is still live (always true before drop).
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// A weak view of the liveness flag.
    ///
    /// A pool retains this instead of the handle itself. After the handle
    /// drops, the observer sees the reference as expired or the flag as
    /// false depending on race timing; either outcome means "do not use".
    pub fn lifetime_tracker(&self) -> Weak<AtomicBool> {
        Arc::downgrade(&self.alive)
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        // Flag first, so trackers never observe a live flag for a region
        // whose release action is already running.
        self.alive.store(false, Ordering::Release);
        if let Some(release) = self.release.take() {
            let virt = self.virt;
            if catch_unwind(AssertUnwindSafe(move || release(virt))).is_err() {
                error!(addr = ?virt, "buffer handle release action panicked");
            }
        }
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("virt", &self.virt)
            .field("phys", &self.phys)
            .field("size", &self.size)
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn rejects_null_and_empty_regions() {
        assert!(BufferHandle::new(std::ptr::null_mut(), 0, 16).is_err());
        let mut byte = 0u8;
        assert!(BufferHandle::new(&mut byte, 0, 0).is_err());
    }

    #[test]
    fn release_runs_exactly_once_after_flag_flips() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let mut backing = [0u8; 8];
        let handle = BufferHandle::with_release(backing.as_mut_ptr(), 0, 8, |_| {
            CALLS.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let tracker = handle.lifetime_tracker();
        assert!(tracker.upgrade().is_some_and(|flag| flag.load(Ordering::Acquire)));

        drop(handle);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        // The flag either expired with the handle or reads false.
        assert!(tracker.upgrade().is_none_or(|flag| !flag.load(Ordering::Acquire)));
    }

    #[test]
    fn panicking_release_is_contained() {
        let mut backing = [0u8; 4];
        let handle = BufferHandle::with_release(backing.as_mut_ptr(), 0, 4, |_| {
            panic!("deliberate");
        })
        .unwrap();
        drop(handle); // must not propagate
    }
}
