// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Memory allocation policies backing a buffer pool.
//!
//! Three policies cover every pool mode: page-aligned anonymous memory,
//! physically contiguous DMA-heap memory (the only one that reliably
//! yields physical addresses for zero-copy scan-out), and a no-op policy
//! for regions owned by someone else.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// DMA heap device nodes, in preference order.
const DMA_HEAP_PATHS: &[&str] = &[
    "/dev/dma_heap/linux,cma",
    "/dev/dma_heap/system",
    "/dev/ion",
];

/// One region handed out by an allocator.
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    pub virt: *mut u8,
    /// Physical address, 0 when the platform cannot expose it.
    pub phys: u64,
}

// struct dma_heap_allocation_data from the kernel UAPI.
#[repr(C)]
#[allow(dead_code)]
struct DmaHeapAllocationData {
    len: u64,
    fd: u32,
    fd_flags: u32,
    heap_flags: u64,
}

// Linux _IOC encoding: dir(2) | size(14) | type(8) | nr(8).
const fn ioc(dir: libc::c_ulong, ty: libc::c_ulong, nr: libc::c_ulong, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | (ty << 8) | nr
}

// _IOWR('H', 0x0, struct dma_heap_allocation_data)
const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong =
    ioc(3, b'H' as libc::c_ulong, 0, std::mem::size_of::<DmaHeapAllocationData>());

/// Allocation policy for a pool's backing memory.
#[derive(Debug)]
pub enum BufferAllocator {
    /// Page-aligned, zero-filled anonymous memory.
    Normal,
    /// Physically contiguous memory from a DMA heap device.
    Dma(DmaHeapAllocator),
    /// Memory owned by the caller; allocation is a programming error.
    External,
}

impl BufferAllocator {
    pub fn normal() -> Self {
        BufferAllocator::Normal
    }

    pub fn dma() -> Self {
        BufferAllocator::Dma(DmaHeapAllocator::default())
    }

    pub fn external() -> Self {
        BufferAllocator::External
    }

    /// Policy name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            BufferAllocator::Normal => "normal",
            BufferAllocator::Dma(_) => "dma-heap",
            BufferAllocator::External => "external",
        }
    }

    pub fn is_dma(&self) -> bool {
        matches!(self, BufferAllocator::Dma(_))
    }

    /// Switches a DMA allocator to normal memory for all *future*
    /// allocations. Regions already handed out stay valid and still
    /// deallocate and export through their heap descriptors.
    pub fn degrade(&mut self) {
        if let BufferAllocator::Dma(heap) = self {
            heap.degraded = true;
        }
    }

    /// Acquires one region of `size` bytes.
    ///
    /// The physical address is best effort: non-zero only when the DMA
    /// heap provided it or the process may read its own pagemap.
    pub fn allocate(&mut self, size: usize) -> Result<Allocation> {
        if size == 0 {
            return Err(Error::InvalidArg("zero-sized allocation".into()));
        }
        match self {
            BufferAllocator::Normal => allocate_anonymous(size),
            BufferAllocator::Dma(heap) => heap.allocate(size),
            BufferAllocator::External => Err(Error::InvalidArg(
                "external allocator cannot allocate; regions are caller-supplied".into(),
            )),
        }
    }

    /// Releases a region previously returned by [`Self::allocate`].
    /// Idempotent on null; a no-op for the external policy.
    pub fn deallocate(&mut self, virt: *mut u8, size: usize) {
        if virt.is_null() {
            return;
        }
        match self {
            BufferAllocator::Normal => {
                // Safety: `virt`/`size` came from our own anonymous mmap.
                if unsafe { libc::munmap(virt.cast(), size) } != 0 {
                    warn!(addr = ?virt, "munmap failed: {}", std::io::Error::last_os_error());
                }
            }
            BufferAllocator::Dma(heap) => heap.deallocate(virt, size),
            BufferAllocator::External => {}
        }
    }

    /// DMA-BUF descriptor for a region, when this policy can export one.
    pub fn dmabuf_fd(&self, virt: *mut u8) -> Option<RawFd> {
        match self {
            BufferAllocator::Dma(heap) => heap.dmabuf_fd(virt),
            _ => None,
        }
    }
}

fn allocate_anonymous(size: usize) -> Result<Allocation> {
    // MAP_POPULATE keeps the pages resident so the pagemap walk below can
    // see a physical frame.
    let virt = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
            -1,
            0,
        )
    };
    if virt == libc::MAP_FAILED {
        return Err(Error::AllocationFailed(format!(
            "anonymous mmap of {size} bytes: {}",
            std::io::Error::last_os_error()
        )));
    }
    let virt = virt.cast::<u8>();
    let phys = physical_address(virt);
    if phys == 0 {
        debug!(addr = ?virt, "physical address unavailable for normal memory");
    }
    Ok(Allocation { virt, phys })
}

/// Contiguous allocator over a kernel DMA heap.
///
/// Every allocation keeps its descriptor and mapping so deallocation can
/// unmap and close, and so a region can later be exported as a DMA-BUF.
#[derive(Debug, Default)]
pub struct DmaHeapAllocator {
    regions: Vec<DmaRegion>,
    /// Once set, further allocations come from anonymous memory.
    degraded: bool,
}

#[derive(Debug)]
struct DmaRegion {
    // Field order drops the mapping before the descriptor.
    map: MmapRaw,
    file: File,
    size: usize,
}

impl DmaHeapAllocator {
    fn allocate(&mut self, size: usize) -> Result<Allocation> {
        if self.degraded {
            return allocate_anonymous(size);
        }
        let heap = open_heap_device()?;

        let mut request = DmaHeapAllocationData {
            len: size as u64,
            fd: 0,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            heap_flags: 0,
        };
        // Safety: fd is a live heap device and `request` matches the UAPI layout.
        let rc = unsafe { libc::ioctl(heap.as_raw_fd(), DMA_HEAP_IOCTL_ALLOC, &mut request) };
        if rc < 0 {
            return Err(Error::AllocationFailed(format!(
                "DMA heap allocation of {size} bytes: {}",
                std::io::Error::last_os_error()
            )));
        }
        // The heap device can close now; the buffer descriptor stays open.
        // Safety: the ioctl returned a freshly created descriptor we own.
        let file = File::from(unsafe { OwnedFd::from_raw_fd(request.fd as RawFd) });

        let map = MmapOptions::new()
            .len(size)
            .populate()
            .map_raw(&file)
            .map_err(|e| Error::AllocationFailed(format!("mmap of DMA buffer: {e}")))?;

        let virt = map.as_mut_ptr();
        let phys = physical_address(virt);
        if phys == 0 {
            warn!(addr = ?virt, "physical address unavailable for DMA buffer");
        }
        debug!(addr = ?virt, phys, size, fd = file.as_raw_fd(), "DMA buffer allocated");

        self.regions.push(DmaRegion { map, file, size });
        Ok(Allocation { virt, phys })
    }

    fn deallocate(&mut self, virt: *mut u8, size: usize) {
        match self.regions.iter().position(|r| r.map.as_mut_ptr() == virt) {
            Some(index) => {
                // Dropping the region unmaps and closes the descriptor.
                let region = self.regions.swap_remove(index);
                debug!(addr = ?virt, size = region.size, "DMA buffer deallocated");
            }
            None => {
                // Handed out after a degrade: plain anonymous memory.
                // Safety: `virt`/`size` came from allocate_anonymous.
                if unsafe { libc::munmap(virt.cast(), size) } != 0 {
                    warn!(addr = ?virt, "munmap failed: {}", std::io::Error::last_os_error());
                }
            }
        }
    }

    fn dmabuf_fd(&self, virt: *mut u8) -> Option<RawFd> {
        self.regions
            .iter()
            .find(|r| r.map.as_mut_ptr() == virt)
            .map(|r| r.file.as_raw_fd())
    }
}

fn open_heap_device() -> Result<File> {
    for path in DMA_HEAP_PATHS {
        match File::options().read(true).write(true).open(path) {
            Ok(file) => {
                debug!(path, "opened DMA heap");
                return Ok(file);
            }
            Err(_) => continue,
        }
    }
    Err(Error::Unavailable(format!(
        "no DMA heap device present (tried {} paths)",
        DMA_HEAP_PATHS.len()
    )))
}

/// Best-effort translation of a virtual address to a physical one via
/// `/proc/self/pagemap`. Returns 0 when the pagemap is unreadable (not
/// root), the page is not resident, or the kernel hides frame numbers.
pub(crate) fn physical_address(virt: *const u8) -> u64 {
    let Ok(mut pagemap) = File::open("/proc/self/pagemap") else {
        return 0;
    };

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) } as u64;
    let addr = virt as u64;
    let entry_offset = (addr / page_size) * 8;

    if pagemap.seek(SeekFrom::Start(entry_offset)).is_err() {
        return 0;
    }
    let mut entry = [0u8; 8];
    if pagemap.read_exact(&mut entry).is_err() {
        return 0;
    }
    let entry = u64::from_le_bytes(entry);

    // Bit 63: page present. Bits 0-54: page frame number.
    if entry & (1 << 63) == 0 {
        return 0;
    }
    let pfn = entry & ((1 << 55) - 1);
    if pfn == 0 {
        return 0;
    }
    pfn * page_size + addr % page_size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_allocation_roundtrip() {
        let mut allocator = BufferAllocator::normal();
        let allocation = allocator.allocate(4096).unwrap();
        assert!(!allocation.virt.is_null());
        // Anonymous mappings are zero-filled and page-aligned.
        assert_eq!(allocation.virt as usize % 4096, 0);
        unsafe {
            assert_eq!(*allocation.virt, 0);
            *allocation.virt = 0xAB;
            assert_eq!(*allocation.virt, 0xAB);
        }
        allocator.deallocate(allocation.virt, 4096);
    }

    #[test]
    fn deallocate_null_is_idempotent() {
        let mut allocator = BufferAllocator::normal();
        allocator.deallocate(std::ptr::null_mut(), 4096);
    }

    #[test]
    fn external_allocate_fails_loudly() {
        let mut allocator = BufferAllocator::external();
        assert!(matches!(allocator.allocate(64), Err(Error::InvalidArg(_))));
        assert_eq!(allocator.name(), "external");
    }

    #[test]
    fn zero_size_is_rejected() {
        let mut allocator = BufferAllocator::normal();
        assert!(allocator.allocate(0).is_err());
    }
}
