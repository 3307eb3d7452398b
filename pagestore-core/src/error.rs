//! Error types for Pagestore

use crate::{Lsn, TenantId, TimelineId};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for Pagestore operations
pub type Result<T> = std::result::Result<T, PageStoreError>;

/// Pagestore error types
#[derive(Error, Debug)]
pub enum PageStoreError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A layer file failed its integrity check
    #[error("Corrupt layer {path:?}: {reason}")]
    CorruptLayer { path: PathBuf, reason: String },

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Ingest precondition violated
    #[error("Out of order LSN: got {lsn}, last record LSN is {last_record_lsn}")]
    OutOfOrderLsn { lsn: Lsn, last_record_lsn: Lsn },

    /// Logical size limit reached; surfaced to writers as disk full
    #[error("Quota exceeded: logical size {current} + {requested} would exceed limit {limit}")]
    QuotaExceeded {
        current: u64,
        requested: u64,
        limit: u64,
    },

    /// Remote storage failure, retried internally
    #[error("Remote storage error: {0}")]
    UploadTransient(String),

    /// A bounded wait expired
    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    /// Tenant not found
    #[error("Tenant not found: {0}")]
    TenantNotFound(TenantId),

    /// Timeline not found
    #[error("Timeline not found: {0}")]
    TimelineNotFound(TimelineId),

    /// Object already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Branch creation rejected
    #[error("Invalid branch: {0}")]
    InvalidBranch(String),

    /// Read below the garbage collected horizon
    #[error("Requested LSN {requested} is below the GC cutoff {cutoff}")]
    LsnBelowGcCutoff { requested: Lsn, cutoff: Lsn },

    /// Incremental and recomputed size counters disagree
    #[error("{kind} size drift: incremental {incremental}, non-incremental {non_incremental}")]
    SizeDrift {
        kind: &'static str,
        incremental: u64,
        non_incremental: u64,
    },

    /// Operation cancelled by shutdown or deletion
    #[error("Cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PageStoreError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PageStoreError::Io(_) | PageStoreError::UploadTransient(_) | PageStoreError::Timeout { .. }
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            PageStoreError::CorruptLayer { .. } | PageStoreError::ChecksumMismatch { .. }
        )
    }

    /// Errors that reach end users as a failed write or wait
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            PageStoreError::QuotaExceeded { .. } | PageStoreError::Timeout { .. }
        ) || self.is_corruption()
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PageStoreError::CorruptLayer {
            path: path.into(),
            reason: reason.into(),
        }
    }
}
