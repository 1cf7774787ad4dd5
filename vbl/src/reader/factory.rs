// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Reader construction and selection.
//!
//! Selection priority: explicit type, the `VIDEO_READER_TYPE` environment
//! variable, the optional config file, capability auto-detection.

use std::str::FromStr;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::reader::{MmapReader, ReaderType, UringReader, VideoReader};

/// Environment override for auto-selection.
pub const READER_TYPE_ENV: &str = "VIDEO_READER_TYPE";
/// Optional config file; first non-comment token names the reader type.
const READER_CONF_PATH: &str = "/etc/vbl/reader.conf";

/// Builds a reader of the requested kind. The returned reader is closed;
/// call `open_raw` (or `open`) next.
pub fn create(kind: ReaderType) -> Result<VideoReader> {
    match kind {
        ReaderType::Auto => {
            if let Some(kind) = from_env() {
                info!(?kind, "reader type from environment");
                return by_type(kind);
            }
            if let Some(kind) = from_config_file() {
                info!(?kind, "reader type from config file");
                return by_type(kind);
            }
            Ok(auto_detect())
        }
        other => by_type(other),
    }
}

fn by_type(kind: ReaderType) -> Result<VideoReader> {
    match kind {
        ReaderType::Mmap => Ok(VideoReader::Mmap(MmapReader::new())),
        ReaderType::IoUring => {
            if UringReader::is_available() {
                Ok(VideoReader::Ring(UringReader::new()))
            } else {
                warn!("io_uring unavailable, falling back to mmap");
                Ok(VideoReader::Mmap(MmapReader::new()))
            }
        }
        ReaderType::DirectRead => {
            warn!("direct-read reader is served by the mmap implementation");
            Ok(VideoReader::Mmap(MmapReader::new()))
        }
        #[cfg(feature = "rtsp")]
        ReaderType::Rtsp => Ok(VideoReader::Rtsp(crate::reader::RtspReader::new())),
        #[cfg(not(feature = "rtsp"))]
        ReaderType::Rtsp => Err(crate::error::Error::NotSupported(
            "RTSP support is not compiled in (enable the `rtsp` feature)",
        )),
        ReaderType::Auto => Ok(auto_detect()),
    }
}

fn auto_detect() -> VideoReader {
    let uring = UringReader::is_available();
    debug!(io_uring = uring, "probing reader capabilities");
    if uring {
        info!("selected io_uring reader");
        VideoReader::Ring(UringReader::new())
    } else {
        info!("selected mmap reader");
        VideoReader::Mmap(MmapReader::new())
    }
}

fn from_env() -> Option<ReaderType> {
    let value = std::env::var(READER_TYPE_ENV).ok()?;
    match ReaderType::from_str(&value) {
        Ok(kind) => Some(kind),
        Err(_) => {
            warn!(value, "unrecognized {READER_TYPE_ENV}, ignoring");
            None
        }
    }
}

fn from_config_file() -> Option<ReaderType> {
    let contents = std::fs::read_to_string(READER_CONF_PATH).ok()?;
    parse_config(&contents)
}

fn parse_config(contents: &str) -> Option<ReaderType> {
    let token = contents
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))?;
    ReaderType::from_str(token).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_parser_skips_comments_and_blanks() {
        assert_eq!(parse_config("# comment\n\nmmap\n"), Some(ReaderType::Mmap));
        assert_eq!(parse_config("iouring"), Some(ReaderType::IoUring));
        assert_eq!(parse_config("# only comments\n"), None);
        assert_eq!(parse_config("nonsense\n"), None);
    }

    #[test]
    fn explicit_types_always_resolve() {
        assert!(matches!(create(ReaderType::Mmap).unwrap(), VideoReader::Mmap(_)));
        // DirectRead is served by mmap for now.
        assert!(matches!(create(ReaderType::DirectRead).unwrap(), VideoReader::Mmap(_)));
    }
}
