use std::time::Duration;

use thiserror::Error;

use crate::types::SeriesRef;

/// Error type for WAL and head operations.
#[derive(Error, Debug)]
pub enum HeadError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL fsync did not complete within {0:?}")]
    SyncTimeout(Duration),

    #[error(
        "WAL record CRC mismatch in segment {segment} at offset {offset}: expected {expected:#010x}, got {actual:#010x}"
    )]
    ChecksumMismatch {
        segment: u64,
        offset: u64,
        expected: u32,
        actual: u32,
    },

    #[error("Corruption detected: {details}")]
    Corruption {
        details: String,
        segment: Option<u64>,
        offset: Option<u64>,
    },

    #[error("Series not found: {0}")]
    SeriesNotFound(SeriesRef),

    #[error("WAL is closed")]
    Closed,

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Lock acquisition failed: {0}")]
    LockError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification handed back to the ingestion path so it can decide whether the
/// client should retry a rejected write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IoFailure,
    Timeout,
    ChecksumMismatch,
    Corruption,
    NotFound,
    InvalidConfig,
    Closed,
    Internal,
}

impl HeadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HeadError::Io(_) => ErrorKind::IoFailure,
            HeadError::SyncTimeout(_) => ErrorKind::Timeout,
            HeadError::ChecksumMismatch { .. } => ErrorKind::ChecksumMismatch,
            HeadError::Corruption { .. } => ErrorKind::Corruption,
            HeadError::SeriesNotFound(_) => ErrorKind::NotFound,
            HeadError::Config(_) => ErrorKind::InvalidConfig,
            HeadError::Closed => ErrorKind::Closed,
            HeadError::LockError(_) | HeadError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Durability failures may succeed on a later attempt; corruption and broken
    /// invariants will not.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::IoFailure | ErrorKind::Timeout)
    }
}

// Implement conversion from lock poison errors for convenience
impl<T> From<std::sync::PoisonError<T>> for HeadError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        HeadError::LockError(format!("Mutex/RwLock poisoned: {}", err))
    }
}
