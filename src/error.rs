//! Error taxonomy shared across the sync pipeline
//!
//! Every failure in the pipeline falls into one of three categories that
//! drive retry behavior: transient failures are absorbed into backoff and
//! retry, permanent failures remove the item from the queue and surface a
//! terminal status, and session-fatal failures terminate the running
//! session without touching queue state.

use thiserror::Error;

use crate::host::CoordinatorError;
use crate::queue_operations::QueueError;
use crate::transfer::TransferError;

/// Classification of a failure, driving retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retry with backoff or visibility extension; never terminal on the
    /// first occurrence.
    Transient,
    /// No retry; queue entry removed, attachment marked terminal.
    Permanent,
    /// The session terminates; queue state is untouched and safe to restart.
    SessionFatal,
}

/// Top-level error type exposed through the `AttachmentSync` facade.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),

    #[error("Remote coordination failed: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),

    #[error("No authenticated user")]
    NotAuthenticated,

    #[error("Upload is disabled for the current plan")]
    UploadDisabled,
}

/// Result type for facade-level operations.
pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SyncError::Queue(_) => ErrorCategory::Transient,
            SyncError::Coordinator(e) => e.category(),
            SyncError::Transfer(e) => e.category(),
            SyncError::NotAuthenticated | SyncError::UploadDisabled => ErrorCategory::Permanent,
        }
    }
}
