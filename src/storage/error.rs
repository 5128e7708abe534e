//! Storage layer error types.

use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Bad log file: aggregate checksum mismatch")]
    BadLogFile,

    #[error("Bad xid file: length does not match the xid counter")]
    BadXidFile,

    #[error("Cache is full: all {capacity} slots are pinned")]
    CacheFull { capacity: usize },

    #[error("Cache is closed")]
    CacheClosed,

    #[error("Data item of {size} bytes exceeds page payload capacity ({max})")]
    DataTooLarge { size: usize, max: usize },

    #[error("No page has {size} bytes of free space")]
    NoSpaceOnAnyPage { size: usize },

    #[error("Page {0} does not exist")]
    PageNotFound(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
