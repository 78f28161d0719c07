//! Shared types for the upload queue and session pipeline
//!
//! Types used across the queue store, executor, and session controller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque reference to the host-side attachment used to resolve file bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub library_id: i64,
    pub item_key: String,
}

impl AttachmentRef {
    pub fn new(library_id: i64, item_key: impl Into<String>) -> Self {
        Self {
            library_id,
            item_key: item_key.into(),
        }
    }
}

impl std::fmt::Display for AttachmentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.library_id, self.item_key)
    }
}

/// Terminal and in-flight upload states of an attachment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Completed,
    Failed,
    PlanLimit,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::PlanLimit => "plan_limit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UploadStatus::Pending),
            "completed" => Some(UploadStatus::Completed),
            "failed" => Some(UploadStatus::Failed),
            "plan_limit" => Some(UploadStatus::PlanLimit),
            _ => None,
        }
    }

    /// True for states the queue never revisits without an explicit reset.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadStatus::Pending)
    }
}

/// One row of pending work in the upload queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadQueueItem {
    pub user_id: String,
    pub content_hash: String,
    /// Claimable when `None` or in the past.
    pub visibility: Option<DateTime<Utc>>,
    /// Incremented on every claim.
    pub attempt_count: i32,
    pub item_ref: AttachmentRef,
    pub queued_at: DateTime<Utc>,
}

impl UploadQueueItem {
    /// Whether the item would be selected by a claim issued at `now`.
    pub fn is_claimable_at(&self, now: DateTime<Utc>, max_attempts: i32) -> bool {
        self.attempt_count < max_attempts
            && self.visibility.map_or(true, |v| v <= now)
    }
}

/// What kind of session the host asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// First sync after sign-in.
    Initial,
    /// Periodic background sweep.
    Background,
    /// Explicit user action.
    Manual,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Initial => "initial",
            SessionKind::Background => "background",
            SessionKind::Manual => "manual",
        }
    }
}

/// Outcome of executing one claimed item, reported back to the controller.
#[derive(Debug, Clone)]
pub enum ItemOutcome {
    /// Remote accepted the upload; local row deleted.
    Completed { content_hash: String },
    /// Permanent failure durably recorded remotely; local row deleted.
    Failed {
        content_hash: String,
        status: UploadStatus,
    },
    /// Transient failure with attempts remaining; visibility extended.
    Retried { content_hash: String },
    /// Could not start this cycle (no credential); item left claimed.
    Skipped { content_hash: String },
}

impl ItemOutcome {
    pub fn content_hash(&self) -> &str {
        match self {
            ItemOutcome::Completed { content_hash }
            | ItemOutcome::Failed { content_hash, .. }
            | ItemOutcome::Retried { content_hash }
            | ItemOutcome::Skipped { content_hash } => content_hash,
        }
    }
}
