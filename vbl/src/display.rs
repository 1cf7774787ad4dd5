// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Linux framebuffer display output.
//!
//! The device memory-maps the whole multi-buffered framebuffer, exposes
//! its slices through an external [`BufferPool`], and offers three
//! hardware display paths: zero-copy DMA scan-out from a physical
//! address, page-flip to an already-filled slice, and a copy fallback
//! for arbitrary source buffers.

use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};
use crate::pool::{BufferPool, ExternalBufferInfo};

const PROC_FB: &str = "/proc/fb";
/// Kernel driver names exported in /proc/fb, by logical display index.
const FB_DRIVER_NAMES: &[&str] = &["tpsfb0", "tpsfb1"];
const FB_DEVICE_NODES: &[&str] = &["/dev/fb0", "/dev/fb1", "/dev/fb2"];

// linux/fb.h ioctls.
const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOPAN_DISPLAY: libc::c_ulong = 0x4606;
// _IOW('F', 0x20, __u32)
const FBIO_WAITFORVSYNC: libc::c_ulong = 0x4004_4620;
// Driver-specific: _IOW('F', 7, struct fb_dma_info). Submits a physical
// address for zero-copy scan-out on an overlay.
const FBIO_SET_DMA_INFO: libc::c_ulong = 0x4010_4607;

#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

// struct fb_var_screeninfo from the kernel UAPI. Carried whole so the
// ioctls see the exact layout; most fields are never touched from here.
#[repr(C)]
#[derive(Clone, Copy)]
#[allow(dead_code)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[allow(dead_code)]
struct FbDmaInfo {
    ovl_idx: u32,
    phys_addr: u64,
}

/// A display output over one logical framebuffer.
///
/// The framebuffer's virtual region holds `buffer_count` full-screen
/// slices end to end; each slice is one [`Buffer`] in the device's pool.
/// The pool (and therefore every buffer) lives exactly as long as the
/// device: using a buffer after the device drops is a programmer error.
pub struct DisplayDevice {
    file: File,
    index: u32,
    map: MmapRaw,
    pool: BufferPool,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    buffer_count: u32,
    slice_size: usize,
    current_index: u32,
    frames_displayed: u64,
}

impl DisplayDevice {
    /// Opens the display with the given logical index, queries its
    /// geometry, maps the full framebuffer and builds the slice pool.
    pub fn open(index: u32) -> Result<Self> {
        let node = Self::device_node(index)?;
        info!(index, node, "opening framebuffer device");

        let file = File::options()
            .read(true)
            .write(true)
            .open(node)
            .map_err(|e| Error::Unavailable(format!("open {node}: {e}")))?;

        let var = query_vscreeninfo(&file)?;
        let width = var.xres;
        let height = var.yres;
        let bits_per_pixel = var.bits_per_pixel;
        // Round up to whole bytes for sub-byte pixel formats.
        let slice_size = (width as usize * height as usize * bits_per_pixel as usize).div_ceil(8);
        let buffer_count = if height > 0 { var.yres_virtual / height } else { 0 };
        if slice_size == 0 || buffer_count == 0 {
            return Err(Error::Unavailable(format!(
                "framebuffer reports unusable geometry ({width}x{height}x{bits_per_pixel}, {} virtual rows)",
                var.yres_virtual
            )));
        }

        let total = slice_size * buffer_count as usize;
        let map = MmapOptions::new()
            .len(total)
            .map_raw(&file)
            .map_err(|e| Error::Unavailable(format!("mmap framebuffer ({total} bytes): {e}")))?;

        info!(
            width,
            height,
            bits_per_pixel,
            buffer_count,
            slice_size,
            "framebuffer mapped"
        );

        let base = map.as_mut_ptr();
        let infos: Vec<ExternalBufferInfo> = (0..buffer_count as usize)
            .map(|i| ExternalBufferInfo {
                // Safety: i * slice_size < total, the mapped length.
                virt: unsafe { base.add(i * slice_size) },
                phys: 0,
                size: slice_size,
            })
            .collect();

        let pool = BufferPool::from_external(
            &infos,
            &format!("FramebufferPool_FB{index}"),
            "Display",
        )?;

        Ok(Self {
            file,
            index,
            map,
            pool,
            width,
            height,
            bits_per_pixel,
            buffer_count,
            slice_size,
            current_index: 0,
            frames_displayed: 0,
        })
    }

    fn device_node(index: u32) -> Result<&'static str> {
        let mut table = String::new();
        File::open(PROC_FB)
            .and_then(|mut f| f.read_to_string(&mut table))
            .map_err(|e| Error::Unavailable(format!("read {PROC_FB}: {e}")))?;
        node_from_fb_table(&table, index).ok_or_else(|| {
            Error::Unavailable(format!(
                "framebuffer '{}' not present in {PROC_FB}",
                FB_DRIVER_NAMES.get(index as usize).copied().unwrap_or("?")
            ))
        })
    }

    // ---- geometry -----------------------------------------------------

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn bits_per_pixel(&self) -> u32 {
        self.bits_per_pixel
    }

    /// Bytes per pixel, rounded up for sub-byte formats.
    pub fn bytes_per_pixel(&self) -> u32 {
        self.bits_per_pixel.div_ceil(8)
    }

    pub fn buffer_count(&self) -> u32 {
        self.buffer_count
    }

    /// Size of one full-screen slice in bytes.
    pub fn slice_size(&self) -> usize {
        self.slice_size
    }

    /// Index of the slice the controller currently scans out.
    pub fn current_index(&self) -> u32 {
        self.current_index
    }

    pub fn display_index(&self) -> u32 {
        self.index
    }

    /// The pool over this device's framebuffer slices.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    // ---- display paths ------------------------------------------------

    /// Blocks until the next vertical blanking interval.
    pub fn wait_vsync(&self) -> Result<()> {
        let zero: u32 = 0;
        // Safety: fd is a live framebuffer, argument matches the ioctl.
        if unsafe { libc::ioctl(self.file.as_raw_fd(), FBIO_WAITFORVSYNC, &zero) } < 0 {
            let err = Error::last_os_error("FBIO_WAITFORVSYNC");
            warn!("vsync wait failed: {err}");
            return Err(err);
        }
        Ok(())
    }

    /// Zero-copy scan-out: submits the buffer's physical address to the
    /// driver and pans to base. Requires a non-zero physical address.
    pub fn display_by_dma(&mut self, buffer: &Buffer) -> Result<()> {
        let phys_addr = buffer.phys_addr();
        if phys_addr == 0 {
            return Err(Error::InvalidArg(
                "DMA display requires a buffer with a physical address".into(),
            ));
        }

        let dma = FbDmaInfo { ovl_idx: 0, phys_addr };
        // Safety: fd is live and `dma` matches the driver's ioctl layout.
        if unsafe { libc::ioctl(self.file.as_raw_fd(), FBIO_SET_DMA_INFO, &dma) } < 0 {
            return Err(Error::last_os_error("FBIO_SET_DMA_INFO"));
        }

        // DMA reads straight from the physical address; pan to base.
        self.pan_to_row(0)?;
        self.current_index = 0;
        self.note_frame(buffer.id(), "dma");
        Ok(())
    }

    /// Page-flip to a slice of this device that a producer already
    /// filled. The buffer must come from this device's own pool.
    pub fn display_filled(&mut self, buffer: &Arc<Buffer>) -> Result<()> {
        let owned = self
            .pool
            .buffer_by_id(buffer.id())
            .is_some_and(|known| Arc::ptr_eq(&known, buffer));
        if !owned {
            return Err(Error::InvalidArg(format!(
                "buffer {} does not belong to this display's pool",
                buffer.id()
            )));
        }

        self.pan_to_row(self.height * buffer.id())?;
        self.current_index = buffer.id();
        self.note_frame(buffer.id(), "flip");
        Ok(())
    }

    /// Copy fallback for arbitrary source buffers: grabs a free slice,
    /// copies the frame in, pans to it and immediately recycles the
    /// slice (the controller keeps scanning it out until the next pan).
    pub fn display_by_copy(&mut self, buffer: &Buffer) -> Result<()> {
        let slice = self.pool.try_acquire_free().ok_or_else(|| {
            Error::Unavailable("no free framebuffer slice for copy display".into())
        })?;

        if buffer.size() != slice.size() {
            warn!(
                source = buffer.size(),
                slice = slice.size(),
                "size mismatch on copy display, copying the smaller"
            );
        }
        // Safety: the source is held by the caller and the slice was just
        // acquired from the free queue, so both sides are exclusive.
        let copied = slice.copy_from(unsafe { buffer.as_slice() });

        let slice_id = slice.id();
        let result = self.pan_to_row(self.height * slice_id);
        self.pool.cancel_acquire(slice);
        result?;

        self.current_index = slice_id;
        self.frames_displayed += 1;
        debug!(slice = slice_id, copied, "copy display");
        Ok(())
    }

    fn pan_to_row(&self, yoffset: u32) -> Result<()> {
        let mut var = query_vscreeninfo(&self.file)?;
        var.yoffset = yoffset;
        // Safety: fd is live and `var` matches fb_var_screeninfo.
        if unsafe { libc::ioctl(self.file.as_raw_fd(), FBIOPAN_DISPLAY, &var) } < 0 {
            return Err(Error::last_os_error("FBIOPAN_DISPLAY"));
        }
        Ok(())
    }

    fn note_frame(&mut self, id: u32, path: &'static str) {
        self.frames_displayed += 1;
        if self.frames_displayed == 1 || self.frames_displayed % 100 == 0 {
            debug!(frame = self.frames_displayed, buffer = id, path, "displayed");
        }
    }
}

impl Drop for DisplayDevice {
    fn drop(&mut self) {
        // Teardown runs in reverse of open through field drops: the pool
        // releases the slice records, the map unmaps, the fd closes.
        debug!(index = self.index, "framebuffer device closed");
    }
}

fn query_vscreeninfo(file: &File) -> Result<FbVarScreeninfo> {
    // Safety: zeroed fb_var_screeninfo is a valid ioctl output argument.
    let mut var: FbVarScreeninfo = unsafe { std::mem::zeroed() };
    // Safety: fd is a live framebuffer and `var` matches the UAPI layout.
    if unsafe { libc::ioctl(file.as_raw_fd(), FBIOGET_VSCREENINFO, &mut var) } < 0 {
        return Err(Error::last_os_error("FBIOGET_VSCREENINFO"));
    }
    Ok(var)
}

/// Resolves a logical display index to a /dev/fb node using the contents
/// of the kernel's framebuffer table.
fn node_from_fb_table(table: &str, index: u32) -> Option<&'static str> {
    let wanted = FB_DRIVER_NAMES.get(index as usize)?;
    for line in table.lines() {
        let mut parts = line.split_whitespace();
        let fb_num: usize = parts.next()?.parse().ok()?;
        let name = parts.next()?;
        if name == *wanted {
            return FB_DEVICE_NODES.get(fb_num).copied();
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fb_table_lookup_maps_driver_names_to_nodes() {
        let table = "0 tpsfb0\n1 tpsfb1\n";
        assert_eq!(node_from_fb_table(table, 0), Some("/dev/fb0"));
        assert_eq!(node_from_fb_table(table, 1), Some("/dev/fb1"));
    }

    #[test]
    fn fb_table_lookup_handles_reordered_and_missing_entries() {
        let table = "0 otherfb\n2 tpsfb0\n";
        assert_eq!(node_from_fb_table(table, 0), Some("/dev/fb2"));
        assert_eq!(node_from_fb_table(table, 1), None);
        assert_eq!(node_from_fb_table("", 0), None);
    }

    #[test]
    fn var_screeninfo_matches_kernel_layout() {
        // 25 scalar fields + 4 bitfields of 3 words + 4 reserved words.
        assert_eq!(std::mem::size_of::<FbVarScreeninfo>(), 160);
        assert_eq!(std::mem::size_of::<FbDmaInfo>(), 16);
    }
}
