//! Concurrent Upload Executor
//!
//! Executes claimed queue items inside a bounded-concurrency pool and owns
//! the state-transition protocol: the remote backend's record of an item's
//! outcome is authoritative, so the local queue row is only ever deleted
//! after the coordination API has durably accepted `mark_completed` or
//! `mark_failed`. A crash between the remote call and the local delete just
//! causes a redundant (idempotent) remote call on the next attempt; the
//! reverse ordering could silently lose an item.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn};

use crate::host::{FileAccessor, UploadCoordinator};
use crate::queue_operations::UploadQueueManager;
use crate::queue_types::{ItemOutcome, UploadQueueItem, UploadStatus};
use crate::transfer::TransferClient;
use crate::url_cache::UploadUrlCache;

/// Executor tuning knobs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Maximum concurrent transfers; additional work waits on the pool
    /// without blocking the dispatcher.
    pub concurrency: usize,

    /// Queue-level attempt budget; an item failing transiently at or past
    /// this count is classified permanent.
    pub max_attempts: i32,

    /// How far to push a transiently-failed item out of claimability.
    pub retry_visibility_minutes: i64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_attempts: 3,
            retry_visibility_minutes: 10,
        }
    }
}

/// Pool-bounded executor for claimed upload queue items.
pub struct UploadExecutor {
    queue: UploadQueueManager,
    cache: Arc<UploadUrlCache>,
    files: Arc<dyn FileAccessor>,
    coordinator: Arc<dyn UploadCoordinator>,
    transfer: Arc<TransferClient>,
    semaphore: Arc<Semaphore>,
    config: ExecutorConfig,
}

impl UploadExecutor {
    pub fn new(
        queue: UploadQueueManager,
        cache: Arc<UploadUrlCache>,
        files: Arc<dyn FileAccessor>,
        coordinator: Arc<dyn UploadCoordinator>,
        transfer: Arc<TransferClient>,
        config: ExecutorConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            queue,
            cache,
            files,
            coordinator,
            transfer,
            semaphore,
            config,
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Dispatch one claimed item into the pool.
    ///
    /// Returns immediately; the worker acquires a concurrency permit, runs
    /// the item, and reports its outcome through `outcomes`.
    pub fn dispatch(
        self: &Arc<Self>,
        item: UploadQueueItem,
        outcomes: mpsc::UnboundedSender<ItemOutcome>,
    ) {
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let permit = executor.semaphore.clone().acquire_owned().await;
            if permit.is_err() {
                // Semaphore closed: process is shutting down.
                return;
            }

            let hash = item.content_hash.clone();
            let outcome = executor.execute_item(item).await;
            if outcomes.send(outcome).is_err() {
                debug!("Outcome receiver dropped for {}", hash);
            }
        });
    }

    /// Run a single claimed item to an outcome.
    pub async fn execute_item(&self, item: UploadQueueItem) -> ItemOutcome {
        let hash = item.content_hash.clone();
        debug!(
            "Executing upload {} (ref={}, attempt={})",
            hash, item.item_ref, item.attempt_count
        );

        // Credential was batch-fetched when the cycle started; a miss means
        // the coordination API was down. Leave the item claimed so the
        // visibility timeout re-exposes it later.
        let url = match self.cache.get(&hash).await {
            Some(url) => url,
            None => {
                warn!("No upload credential for {}, skipping this cycle", hash);
                return ItemOutcome::Skipped { content_hash: hash };
            }
        };

        // A file that cannot be resolved or read is gone for good.
        let path = match self.files.resolve_path(&item.item_ref).await {
            Some(path) => path,
            None => {
                warn!("No file path for {} (ref={})", hash, item.item_ref);
                return self.commit_failed(&item, UploadStatus::Failed).await;
            }
        };

        let bytes = match self.files.read_bytes(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot read {} for {}: {}", path.display(), hash, e);
                return self.commit_failed(&item, UploadStatus::Failed).await;
            }
        };

        let mime_type = self.files.mime_type(&item.item_ref).await;

        match self.transfer.put(&url, &bytes, &mime_type).await {
            Ok(()) => {
                let page_count = self.files.page_count(&item.item_ref).await;
                self.commit_completed(&item, &mime_type, bytes.len() as u64, page_count)
                    .await
            }
            Err(e) if e.is_transient() => self.handle_transient_failure(&item, &e.to_string()).await,
            Err(e) => {
                let status = if e.is_plan_limited() {
                    UploadStatus::PlanLimit
                } else {
                    UploadStatus::Failed
                };
                warn!(
                    "Transfer of {} permanently failed (attempt {}): {}",
                    hash, item.attempt_count, e
                );
                self.commit_failed(&item, status).await
            }
        }
    }

    /// Transient failure: extend visibility if attempts remain, otherwise
    /// the attempt budget is exhausted and the failure becomes permanent.
    async fn handle_transient_failure(&self, item: &UploadQueueItem, reason: &str) -> ItemOutcome {
        if item.attempt_count >= self.config.max_attempts {
            warn!(
                "Upload {} exhausted {} attempts, failing permanently: {}",
                item.content_hash, item.attempt_count, reason
            );
            return self.commit_failed(item, UploadStatus::Failed).await;
        }

        warn!(
            "Transient failure for {} (attempt {}/{}), deferring retry: {}",
            item.content_hash, item.attempt_count, self.config.max_attempts, reason
        );

        match self
            .queue
            .extend_visibility(
                &item.user_id,
                &item.content_hash,
                self.config.retry_visibility_minutes,
            )
            .await
        {
            Ok(_) => ItemOutcome::Retried {
                content_hash: item.content_hash.clone(),
            },
            Err(e) => {
                // The claim's own visibility window still covers the retry.
                error!("Failed to extend visibility of {}: {}", item.content_hash, e);
                ItemOutcome::Retried {
                    content_hash: item.content_hash.clone(),
                }
            }
        }
    }

    /// Remote-first completion: the local row is deleted only after the
    /// backend durably accepted the outcome.
    async fn commit_completed(
        &self,
        item: &UploadQueueItem,
        mime_type: &str,
        size: u64,
        page_count: Option<i64>,
    ) -> ItemOutcome {
        let hash = &item.content_hash;

        if let Err(e) = self
            .coordinator
            .mark_completed(hash, mime_type, size, page_count)
            .await
        {
            warn!(
                "mark_completed({}) failed, leaving item claimed for retry: {}",
                hash, e
            );
            return ItemOutcome::Skipped {
                content_hash: hash.clone(),
            };
        }

        match self.queue.complete(&item.user_id, hash).await {
            Ok(_) => {
                self.cache.remove(hash).await;
                info!("Upload completed: {} ({} bytes)", hash, size);
                ItemOutcome::Completed {
                    content_hash: hash.clone(),
                }
            }
            Err(e) => {
                // Remote already recorded completion; the retry after
                // visibility expiry will repeat the idempotent remote call
                // and converge.
                error!("Local completion of {} failed: {}", hash, e);
                ItemOutcome::Skipped {
                    content_hash: hash.clone(),
                }
            }
        }
    }

    /// Remote-first permanent failure, same ordering as completion.
    async fn commit_failed(&self, item: &UploadQueueItem, status: UploadStatus) -> ItemOutcome {
        let hash = &item.content_hash;

        if let Err(e) = self.coordinator.mark_failed(hash).await {
            warn!(
                "mark_failed({}) failed, leaving item claimed for retry: {}",
                hash, e
            );
            return ItemOutcome::Skipped {
                content_hash: hash.clone(),
            };
        }

        match self.queue.fail(&item.user_id, hash, status).await {
            Ok(_) => {
                self.cache.remove(hash).await;
                info!("Upload permanently failed: {} (status={})", hash, status.as_str());
                ItemOutcome::Failed {
                    content_hash: hash.clone(),
                    status,
                }
            }
            Err(e) => {
                error!("Local failure transition of {} failed: {}", hash, e);
                ItemOutcome::Skipped {
                    content_hash: hash.clone(),
                }
            }
        }
    }
}
