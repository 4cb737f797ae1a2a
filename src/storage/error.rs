//! Storage layer error types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::storage::meta::StoreId;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A swapper-level read or write failed. Never retried inside the swapper.
    #[error("I/O failure on {path:?}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A flush or eviction of dirty data failed; the file no longer accepts writes.
    #[error("storage failure on {path:?}: {reason}")]
    StorageFailure { path: PathBuf, reason: String },

    #[error("paged file {0:?} is unusable after an earlier storage failure")]
    FileUnusable(PathBuf),

    #[error("page cache exhausted: all {frames} frames are pinned")]
    CacheExhausted { frames: usize },

    #[error("file {path:?} is mapped with page size {mapped}, requested {requested}")]
    PageSizeMismatch {
        path: PathBuf,
        mapped: usize,
        requested: usize,
    },

    #[error("invalid page size: {0}")]
    InvalidPageSize(usize),

    #[error("file {0:?} is not mapped")]
    NotMapped(PathBuf),

    #[error("file {0:?} still has pinned pages")]
    FileInUse(PathBuf),

    #[error("log corruption at byte offset {offset}: {reason}")]
    LogCorruption { offset: u64, reason: String },

    #[error("log record of {len} bytes exceeds the {max} byte limit")]
    RecordTooLarge { len: usize, max: usize },

    #[error("byte range at {offset} of length {len} is out of range")]
    OutOfRange { offset: u64, len: u64 },

    #[error("log does not accept appends: {0}")]
    LogUnavailable(String),

    #[error("store id mismatch: expected {expected}, found {found}")]
    StoreIdMismatch { expected: StoreId, found: StoreId },

    #[error("corrupt store metadata: {0}")]
    MetaCorruption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    pub(crate) fn io_failure(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::IoFailure {
            path: path.into(),
            source,
        }
    }

    /// Returns true for failures that leave a file or log refusing further writes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::StorageFailure { .. }
                | StorageError::FileUnusable(_)
                | StorageError::LogUnavailable(_)
                | StorageError::StoreIdMismatch { .. }
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
