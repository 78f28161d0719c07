//! Host Application Seams
//!
//! Narrow interfaces onto the collaborators the sync agent consumes but
//! does not own: the host's item/file object model, the remote
//! upload-coordination API, and the authentication/plan gate. Concrete
//! bindings live in the host application; everything in this crate stays
//! host-agnostic behind these traits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::error::ErrorCategory;
use crate::queue_types::AttachmentRef;

/// Errors surfaced by the remote upload-coordination API.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The API could not be reached or answered with a server-side error.
    /// Retryable: affected items are picked up again on a later cycle.
    #[error("Coordination API unavailable: {0}")]
    Unavailable(String),

    /// The API understood the request and refused it.
    #[error("Coordination API rejected request: {0}")]
    Rejected(String),
}

impl CoordinatorError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CoordinatorError::Unavailable(_) => ErrorCategory::Transient,
            CoordinatorError::Rejected(_) => ErrorCategory::Permanent,
        }
    }
}

/// Result type for coordinator calls.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Resolves attachment references to local file content and metadata.
///
/// `resolve_path` returning `None` (or `read_bytes` failing) is a permanent
/// condition for the referenced item: the file is gone and no retry will
/// bring it back.
#[async_trait]
pub trait FileAccessor: Send + Sync {
    async fn resolve_path(&self, item_ref: &AttachmentRef) -> Option<PathBuf>;

    async fn read_bytes(&self, path: &Path) -> std::io::Result<Vec<u8>>;

    async fn page_count(&self, item_ref: &AttachmentRef) -> Option<i64>;

    async fn mime_type(&self, item_ref: &AttachmentRef) -> String;
}

/// Remote upload-coordination API.
///
/// `mark_completed` and `mark_failed` are keyed by content hash and must be
/// idempotent on the remote side: at-least-once delivery means either call
/// may be repeated for an item whose outcome the backend already recorded.
#[async_trait]
pub trait UploadCoordinator: Send + Sync {
    /// Request time-limited write credentials for a batch of content hashes.
    /// Hashes missing from the returned map could not be granted a URL.
    async fn get_upload_urls(
        &self,
        hashes: &[String],
    ) -> CoordinatorResult<HashMap<String, String>>;

    /// Durably record a completed upload, with extracted metadata.
    async fn mark_completed(
        &self,
        content_hash: &str,
        mime_type: &str,
        size: u64,
        page_count: Option<i64>,
    ) -> CoordinatorResult<()>;

    /// Durably record a permanent upload failure.
    async fn mark_failed(&self, content_hash: &str) -> CoordinatorResult<()>;

    /// Clear failed-upload markers on the backend; returns the references
    /// whose uploads should be retried locally.
    async fn reset_failed_uploads(&self) -> CoordinatorResult<Vec<AttachmentRef>>;
}

/// Authentication and plan gate consulted before a session starts.
pub trait SessionGate: Send + Sync {
    fn is_authenticated(&self) -> bool;

    fn current_user_id(&self) -> Option<String>;

    fn plan_allows_upload(&self) -> bool;
}
