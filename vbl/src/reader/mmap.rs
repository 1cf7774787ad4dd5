// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Memory-mapped file reader.
//!
//! The whole file is mapped read-only once; every frame read is a
//! bounds-checked copy out of the mapping, which makes random access
//! intrinsically thread-safe as long as destinations differ.

use std::fs::File;
use std::io::Read;

use memmap2::Mmap;
use tracing::{debug, info, warn};

use crate::buffer::Buffer;
use crate::error::{Error, Result};

/// Container formats the sniffer can recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileFormat {
    Mp4,
    Avi,
    H264,
    H265,
    Unknown,
}

/// Reader over a memory-mapped raw frame file.
#[derive(Debug, Default)]
pub struct MmapReader {
    map: Option<Mmap>,
    path: String,
    width: u32,
    height: u32,
    bits_per_pixel: u32,
    frame_size: usize,
    file_size: u64,
    total_frames: u32,
    cursor: u32,
}

impl MmapReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, path: &str) -> Result<()> {
        let mut file = File::open(path)?;
        let mut header = [0u8; 32];
        let read = file.read(&mut header)?;

        match sniff_format(&header[..read]) {
            FileFormat::Mp4 => Err(Error::UnsupportedContainer("MP4")),
            FileFormat::Avi => Err(Error::UnsupportedContainer("AVI")),
            FileFormat::H264 => Err(Error::UnsupportedContainer("H.264 elementary stream")),
            FileFormat::H265 => Err(Error::UnsupportedContainer("H.265 elementary stream")),
            FileFormat::Unknown => Err(Error::UnsupportedContainer(
                "no recognizable container magic; use open_raw for raw frame files",
            )),
        }
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
            warn!(
                path,
                file_size,
                frame_size,
                "trailing partial frame ignored"
            );
        }

        // Safety: the mapping is read-only and outlives every read
        // through it; concurrent file truncation is out of contract.
        let map = unsafe { Mmap::map(&file) }
            .map_err(|e| Error::Unavailable(format!("mmap {path}: {e}")))?;

        self.map = Some(map);
        self.path = path.to_string();
        self.width = width;
        self.height = height;
        self.bits_per_pixel = bits_per_pixel;
        self.frame_size = frame_size;
        self.file_size = file_size;
        self.total_frames = total_frames;
        self.cursor = 0;

        info!(path, width, height, bits_per_pixel, frame_size, total_frames, "raw video file mapped");
        Ok(())
    }

    pub fn close(&mut self) {
        if self.map.take().is_some() {
            debug!(path = %self.path, "video file closed");
        }
        self.cursor = 0;
    }

    pub fn is_open(&self) -> bool {
        self.map.is_some()
    }

    pub fn read_frame(&mut self, dest: &Buffer) -> Result<()> {
        if self.cursor >= self.total_frames {
            return Err(Error::EndOfStream);
        }
        self.read_frame_at_concurrent(self.cursor, dest)?;
        self.cursor += 1;
        Ok(())
    }

    pub fn read_frame_at(&mut self, index: u32, dest: &Buffer) -> Result<()> {
        self.seek(index)?;
        self.read_frame(dest)
    }

    pub fn read_frame_at_concurrent(&self, index: u32, dest: &Buffer) -> Result<()> {
        let map = self.map.as_ref().ok_or(Error::NotSupported("reader is not open"))?;
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

        let offset = index as usize * self.frame_size;
        // Safety: offset + frame_size <= mapped length (index bound
        // checked above) and the destination is held exclusively by the
        // caller per the pool protocol.
        unsafe {
            std::ptr::copy_nonoverlapping(map.as_ptr().add(offset), dest.virt_addr(), self.frame_size);
        }
        Ok(())
    }

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
        "mmap"
    }
}

/// Recognizes container magic in the first bytes of a file.
fn sniff_format(header: &[u8]) -> FileFormat {
    if header.len() < 16 {
        return FileFormat::Unknown;
    }

    // MP4: "ftyp" box at offset 4.
    if &header[4..8] == b"ftyp" {
        return FileFormat::Mp4;
    }

    // AVI: RIFF container tagged "AVI ".
    if &header[0..4] == b"RIFF" && &header[8..12] == b"AVI " {
        return FileFormat::Avi;
    }

    // H.264/H.265: Annex-B NAL start code (00 00 00 01 or 00 00 01).
    let nal_index = if header[0] == 0 && header[1] == 0 && header[2] == 0 && header[3] == 1 {
        Some(4)
    } else if header[0] == 0 && header[1] == 0 && header[2] == 1 {
        Some(3)
    } else {
        None
    };
    if let Some(i) = nal_index {
        let nal_type = header[i] & 0x1F;
        if (1..=21).contains(&nal_type) {
            return FileFormat::H264;
        }
        if nal_type <= 40 {
            return FileFormat::H265;
        }
    }

    FileFormat::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffer_recognizes_container_magic() {
        let mut mp4 = [0u8; 16];
        mp4[4..8].copy_from_slice(b"ftyp");
        assert_eq!(sniff_format(&mp4), FileFormat::Mp4);

        let mut avi = [0u8; 16];
        avi[0..4].copy_from_slice(b"RIFF");
        avi[8..12].copy_from_slice(b"AVI ");
        assert_eq!(sniff_format(&avi), FileFormat::Avi);

        let h264 = [0, 0, 0, 1, 0x65, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(sniff_format(&h264), FileFormat::H264);

        assert_eq!(sniff_format(&[0u8; 16]), FileFormat::Unknown);
        assert_eq!(sniff_format(&[0u8; 4]), FileFormat::Unknown);
    }
}
