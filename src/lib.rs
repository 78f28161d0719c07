//! attachment-sync: durable upload queue and concurrent sync pipeline
//!
//! Keeps a user's local file attachments synchronized with a remote
//! object-storage backend. The heart of the crate is a crash-safe,
//! at-least-once work queue over SQLite: pending uploads are claimed with a
//! visibility timeout, executed with bounded concurrency, retried with
//! backoff, and transitioned remote-authority-first so the local store only
//! ever reflects outcomes the backend has durably recorded.
//!
//! The host application plugs in through three narrow seams ([`host`]):
//! a file accessor, the remote upload-coordination API, and an
//! authentication/plan gate. The queue, URL cache, executor, and session
//! controller all live here and stay host-agnostic.
//!
//! Construct one [`AttachmentSync`] per process and thread it to consumers;
//! there is no ambient global state.

pub mod error;
pub mod host;
pub mod logging;
pub mod queue_config;
pub mod queue_operations;
pub mod queue_types;
pub mod transfer;
pub mod upload_executor;
pub mod upload_schema;
pub mod upload_session;
pub mod url_cache;

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::debug;

pub use crate::error::{ErrorCategory, SyncError, SyncResult};
pub use crate::host::{CoordinatorError, FileAccessor, SessionGate, UploadCoordinator};
pub use crate::logging::{initialize_logging, LoggingConfig};
pub use crate::queue_config::QueueConnectionConfig;
pub use crate::queue_operations::{QueueError, QueueStats, ResetEntry, UploadQueueManager};
pub use crate::queue_types::{AttachmentRef, ItemOutcome, SessionKind, UploadQueueItem, UploadStatus};
pub use crate::transfer::{TransferClient, TransferConfig, TransferError};
pub use crate::upload_executor::{ExecutorConfig, UploadExecutor};
pub use crate::upload_schema::init_schema;
pub use crate::upload_session::{
    BackoffConfig, SessionConfig, SessionController, SessionError, SessionPhase, SessionStatus,
};
pub use crate::url_cache::{UploadUrlCache, UrlCacheConfig};

impl From<SessionError> for SyncError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotAuthenticated => SyncError::NotAuthenticated,
            SessionError::UploadDisabled => SyncError::UploadDisabled,
            SessionError::Queue(e) => SyncError::Queue(e),
        }
    }
}

/// Top-level configuration for [`AttachmentSync`].
#[derive(Debug, Clone, Default)]
pub struct AttachmentSyncConfig {
    pub executor: ExecutorConfig,
    pub session: SessionConfig,
    pub url_cache: UrlCacheConfig,
    pub transfer: TransferConfig,
}

/// The sync agent: queue store, URL cache, executor, and session
/// controller wired together over one SQLite pool.
pub struct AttachmentSync {
    queue: UploadQueueManager,
    controller: SessionController,
    coordinator: Arc<dyn UploadCoordinator>,
    gate: Arc<dyn SessionGate>,
}

impl AttachmentSync {
    /// Wire up the agent over an existing pool, applying the schema
    /// idempotently.
    pub async fn new(
        pool: SqlitePool,
        files: Arc<dyn FileAccessor>,
        coordinator: Arc<dyn UploadCoordinator>,
        gate: Arc<dyn SessionGate>,
        config: AttachmentSyncConfig,
    ) -> SyncResult<Self> {
        upload_schema::init_schema(&pool)
            .await
            .map_err(QueueError::from)?;

        let queue = UploadQueueManager::new(pool);
        let cache = Arc::new(UploadUrlCache::new(coordinator.clone(), config.url_cache));
        let transfer = Arc::new(TransferClient::new(config.transfer).map_err(TransferError::from)?);

        let executor = Arc::new(UploadExecutor::new(
            queue.clone(),
            cache.clone(),
            files,
            coordinator.clone(),
            transfer,
            config.executor,
        ));

        let controller = SessionController::new(
            queue.clone(),
            cache,
            executor,
            gate.clone(),
            config.session,
        );

        debug!("Attachment sync agent constructed");
        Ok(Self {
            queue,
            controller,
            coordinator,
            gate,
        })
    }

    /// Access to the underlying queue store.
    pub fn queue(&self) -> &UploadQueueManager {
        &self.queue
    }

    /// Track an attachment and idempotently enqueue its upload.
    pub async fn enqueue(&self, item_ref: &AttachmentRef, content_hash: &str) -> SyncResult<()> {
        let user_id = self.current_user()?;
        self.queue.track(&user_id, item_ref, content_hash).await?;
        self.queue.upsert(&user_id, content_hash, item_ref).await?;
        Ok(())
    }

    /// Start an upload session. Idempotent while one is running.
    pub async fn start(&self, kind: SessionKind) -> SyncResult<()> {
        self.controller.start(kind).await.map_err(SyncError::from)
    }

    /// Stop the running session; in-flight transfers drain.
    pub async fn stop(&self) {
        self.controller.stop().await;
    }

    /// Block until the running session (if any) finishes.
    pub async fn wait_idle(&self) {
        self.controller.wait_idle().await;
    }

    /// Snapshot of the session status read model.
    pub fn status(&self) -> SessionStatus {
        self.controller.status()
    }

    /// Subscribe to session status updates.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<SessionStatus> {
        self.controller.subscribe()
    }

    /// User-initiated "retry all failed": clears failed markers on the
    /// backend, then re-enqueues the returned attachments locally with a
    /// fresh attempt budget. Returns the number of items re-enqueued.
    pub async fn retry_failed(&self) -> SyncResult<u64> {
        let user_id = self.current_user()?;
        let refs = self.coordinator.reset_failed_uploads().await?;

        let mut entries = Vec::with_capacity(refs.len());
        for item_ref in refs {
            match self.queue.attachment_hash(&user_id, &item_ref).await? {
                Some(content_hash) => entries.push(ResetEntry {
                    content_hash,
                    item_ref,
                }),
                None => debug!("No local hash recorded for {}, skipping reset", item_ref),
            }
        }

        Ok(self.queue.reset(&user_id, &entries).await?)
    }

    fn current_user(&self) -> SyncResult<String> {
        if !self.gate.is_authenticated() {
            return Err(SyncError::NotAuthenticated);
        }
        self.gate
            .current_user_id()
            .ok_or(SyncError::NotAuthenticated)
    }
}
