// SPDX-FileCopyrightText: 2025 Contributors to the VBL project.
// SPDX-License-Identifier: Apache-2.0

//! Error types for VBL operations.
//!
//! This module defines the error type returned throughout the crate. Two
//! conditions deliberately do *not* surface here: a timed-out blocking
//! acquire yields `None` from the pool, and queue-protocol violations
//! (submitting a foreign buffer, double release) are logged warnings that
//! leave the queues untouched.

/// Convenience result type using [`Error`] as the error variant.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors that can occur when using the VBL pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A configuration value was rejected before any work started
    /// (empty path, zero dimensions, unsupported bits-per-pixel,
    /// thread count below one).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An argument passed to a VBL call was invalid (null region,
    /// dead handle, size mismatch on injection).
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// A required platform resource could not be obtained (device node
    /// missing, memory map failed, stream connect failed).
    #[error("resource unavailable: {0}")]
    Unavailable(String),

    /// The backing allocator could not satisfy a request.
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// A blocking operation ran out of time.
    #[error("timed out")]
    Timeout,

    /// A dynamic-injection pool reached its configured capacity cap.
    #[error("buffer queue is full")]
    QueueFull,

    /// A tracked external buffer was observed after its handle died.
    #[error("external buffer is no longer alive")]
    Expired,

    /// The reader ran past the last frame of its source.
    #[error("end of stream")]
    EndOfStream,

    /// An encoded container was recognized but cannot be played; only
    /// raw frame files are supported.
    #[error("unsupported container format: {0}")]
    UnsupportedContainer(&'static str),

    /// The operation does not exist for this reader or display mode.
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    /// A read returned fewer bytes than one frame.
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },

    /// An underlying I/O operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps the current `errno` with a call-site label, for raw libc
    /// calls that report failure out-of-band.
    pub(crate) fn last_os_error(what: &str) -> Self {
        Error::Unavailable(format!("{what}: {}", std::io::Error::last_os_error()))
    }
}
