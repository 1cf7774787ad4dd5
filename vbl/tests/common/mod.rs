// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

/// Ensures logging is initialized only once across all tests.
static LOG_ONCE: std::sync::Once = std::sync::Once::new();

/// Initializes tracing for a test binary (respects `RUST_LOG`).
pub fn init_logging() {
    LOG_ONCE.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::builder()
                    .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_test_writer()
            .init();
    });
}

/// RAII guard for a scratch raw-video file under the system temp
/// directory; removed on drop for test isolation.
pub struct RawFileGuard {
    path: PathBuf,
}

impl RawFileGuard {
    /// Writes `frames` frames of `frame_size` bytes; byte value of frame
    /// `i` is `i`, so tests can recognize which frame a buffer holds.
    pub fn new(test: &str, frames: usize, frame_size: usize) -> Self {
        let mut data = Vec::with_capacity(frames * frame_size);
        for i in 0..frames {
            data.extend(std::iter::repeat_n(i as u8, frame_size));
        }
        Self::with_bytes(test, &data)
    }

    /// Writes an arbitrary byte blob.
    pub fn with_bytes(test: &str, bytes: &[u8]) -> Self {
        let path = std::env::temp_dir().join(format!(
            "vbl_test_{}_{}.raw",
            test,
            uuid::Uuid::new_v4()
        ));
        std::fs::write(&path, bytes)
            .unwrap_or_else(|_| panic!("failed to write scratch file \"{}\"", path.display()));
        Self { path }
    }

    pub fn path(&self) -> &str {
        self.path.to_str().expect("temp paths are valid UTF-8")
    }
}

impl Drop for RawFileGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
