//! Error type shared by the reader, writer, cache and filters.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using [`PtexError`].
pub type Result<T> = std::result::Result<T, PtexError>;

/// Failures surfaced at the texture API boundary.
///
/// I/O and decode errors are never retried internally: a reader that hits
/// one goes into a sticky failed state and later data requests return
/// `None`.
#[derive(Debug, Error)]
pub enum PtexError {
    /// Underlying file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The path was not found directly or on any search-path entry.
    #[error("can't open ptex file: {path}")]
    FileNotFound {
        /// Path as given by the caller.
        path: PathBuf,
    },

    /// The file does not start with the ptex magic bytes.
    #[error("not a ptex file: {path}")]
    BadMagic {
        /// Offending file.
        path: PathBuf,
    },

    /// The file carries a format version this library does not read.
    #[error("unsupported ptex file version ({version}): {path}")]
    UnsupportedVersion {
        /// Version found in the header.
        version: u32,
        /// Offending file.
        path: PathBuf,
    },

    /// The host is big-endian; the format is little-endian only.
    #[error("ptex files are not supported on big-endian hosts")]
    BigEndianHost,

    /// Short read, inflate failure or an invalid block size.
    #[error("corrupt ptex file: {0}")]
    Corrupt(String),

    /// Face id, channel or resolution outside the valid range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// A lazy reopen found different header bytes on disk.
    #[error("header mismatch on reopen of {path}")]
    HeaderMismatch {
        /// Offending file.
        path: PathBuf,
    },

    /// The writer could not acquire its lock file.
    #[error("can't acquire lock file: {0}")]
    LockFailed(String),

    /// Write-side failure, reported at `close`.
    #[error("ptex write failed: {0}")]
    WriteFailed(String),

    /// Invalid mesh type, data type or channel layout at writer open.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A memoised open failure replayed from the cache.
    #[error("{0}")]
    OpenFailed(String),
}

impl PtexError {
    /// Shorthand for a [`PtexError::Corrupt`].
    pub fn corrupt(msg: impl Into<String>) -> Self {
        PtexError::Corrupt(msg.into())
    }

    /// Shorthand for a [`PtexError::OutOfRange`].
    pub fn out_of_range(msg: impl Into<String>) -> Self {
        PtexError::OutOfRange(msg.into())
    }
}
