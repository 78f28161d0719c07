//! Upload Session Controller
//!
//! Orchestrates the claim → execute → wait loop: claims a batch of visible
//! queue items, warms the URL cache, dispatches the batch into the executor
//! pool, waits for the pool to drain, and repeats until the queue is empty
//! or the session is stopped. Consecutive cycle-level errors back off
//! exponentially; past a threshold the session terminates as failed rather
//! than looping forever.
//!
//! The controller is the single writer of the session status read model;
//! workers report outcomes through an mpsc channel and never touch shared
//! counters themselves.

use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::host::SessionGate;
use crate::queue_operations::{QueueError, UploadQueueManager};
use crate::queue_types::{ItemOutcome, SessionKind};
use crate::upload_executor::UploadExecutor;
use crate::url_cache::UploadUrlCache;

/// Session errors surfaced to the caller of `start`.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("No authenticated user")]
    NotAuthenticated,

    #[error("Upload is disabled for the current plan")]
    UploadDisabled,

    #[error("Queue operation failed: {0}")]
    Queue(#[from] QueueError),
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Lifecycle phase of the session read model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Idle,
    InProgress,
    Completed,
    Failed,
}

/// Observable session status; published through a watch channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub kind: Option<SessionKind>,
    /// Queue depth, resynchronized from the store at cycle boundaries
    /// rather than tracked delta-exact.
    pub pending: i64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Most recently dispatched content hash (approximate under
    /// concurrency).
    pub current_item: Option<String>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Idle,
            kind: None,
            pending: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            current_item: None,
        }
    }
}

/// Exponential backoff settings for consecutive cycle errors.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay.
    pub base_delay: Duration,
    /// Ceiling for the doubled delay.
    pub max_delay: Duration,
    /// Jitter factor (0-1) added on top of the computed delay.
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Delay before retrying after the nth consecutive error (1-based).
    pub fn delay_for(&self, consecutive_errors: u32) -> Duration {
        let exp = consecutive_errors.saturating_sub(1).min(31);
        let raw = self.base_delay.saturating_mul(1u32 << exp);
        let capped = raw.min(self.max_delay);

        if self.jitter_factor > 0.0 {
            let jitter = capped.mul_f64(self.jitter_factor * rand::thread_rng().gen::<f64>());
            capped + jitter
        } else {
            capped
        }
    }
}

/// Configuration for upload sessions.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Items claimed per cycle.
    pub batch_size: i64,

    /// Visibility timeout applied to each claim; an interrupted attempt
    /// becomes reclaimable once this elapses.
    pub claim_visibility: ChronoDuration,

    /// Consecutive cycle errors tolerated before the session fails.
    pub max_consecutive_errors: u32,

    /// Backoff between error cycles.
    pub backoff: BackoffConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            claim_visibility: ChronoDuration::minutes(60),
            max_consecutive_errors: 5,
            backoff: BackoffConfig::default(),
        }
    }
}

enum CycleResult {
    /// The claim came back empty; the queue is drained.
    Drained,
    /// A batch was processed to pool drain.
    Processed,
}

/// Controller for upload sessions: `idle → running → (draining | failed) → idle`.
pub struct SessionController {
    queue: UploadQueueManager,
    cache: Arc<UploadUrlCache>,
    executor: Arc<UploadExecutor>,
    gate: Arc<dyn SessionGate>,
    config: SessionConfig,
    status_tx: watch::Sender<SessionStatus>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl SessionController {
    pub fn new(
        queue: UploadQueueManager,
        cache: Arc<UploadUrlCache>,
        executor: Arc<UploadExecutor>,
        gate: Arc<dyn SessionGate>,
        config: SessionConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::default());
        Self {
            queue,
            cache,
            executor,
            gate,
            config,
            status_tx,
            task: Mutex::new(None),
        }
    }

    /// Current status snapshot.
    pub fn status(&self) -> SessionStatus {
        self.status_tx.borrow().clone()
    }

    /// Subscribe to status updates.
    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    /// Start a session of the given kind.
    ///
    /// Refuses when no principal is authenticated or the plan disables
    /// upload. Starting while a session is already running is an idempotent
    /// no-op.
    pub async fn start(&self, kind: SessionKind) -> SessionResult<()> {
        let mut task = self.task.lock().await;

        if let Some((_, handle)) = task.as_ref() {
            if !handle.is_finished() {
                warn!("Upload session already running, ignoring start({})", kind.as_str());
                return Ok(());
            }
        }

        if !self.gate.is_authenticated() {
            return Err(SessionError::NotAuthenticated);
        }
        let user_id = self
            .gate
            .current_user_id()
            .ok_or(SessionError::NotAuthenticated)?;
        if !self.gate.plan_allows_upload() {
            return Err(SessionError::UploadDisabled);
        }

        let session_id = Uuid::new_v4();
        info!(
            "Starting {} upload session {} for user {}",
            kind.as_str(),
            session_id,
            user_id
        );

        // Queue/state divergence is corrected before the first claim; a
        // failure here is not fatal, the session can still drain what the
        // queue does hold.
        if let Err(e) = self.queue.repair_divergence(&user_id).await {
            warn!("Repair pass failed: {}", e);
        }

        let pending = self.queue.pending_count(&user_id).await.unwrap_or(0);
        self.status_tx.send_replace(SessionStatus {
            phase: SessionPhase::InProgress,
            kind: Some(kind),
            pending,
            ..SessionStatus::default()
        });

        let token = CancellationToken::new();
        let handle = tokio::spawn(Self::run_loop(
            self.queue.clone(),
            self.cache.clone(),
            self.executor.clone(),
            self.config.clone(),
            self.status_tx.clone(),
            token.clone(),
            user_id,
            session_id,
        ));

        *task = Some((token, handle));
        Ok(())
    }

    /// Stop the running session: no new batches are claimed; in-flight
    /// transfers drain. No-op when idle.
    pub async fn stop(&self) {
        let taken = {
            let mut task = self.task.lock().await;
            task.take()
        };

        if let Some((token, handle)) = taken {
            info!("Stopping upload session...");
            token.cancel();

            match tokio::time::timeout(Duration::from_secs(30), handle).await {
                Ok(Ok(())) => info!("Upload session stopped"),
                Ok(Err(e)) => error!("Upload session task panicked: {}", e),
                Err(_) => warn!("Upload session did not stop within timeout"),
            }
        }
    }

    /// Wait until the current session's loop task finishes.
    pub async fn wait_idle(&self) {
        let taken = {
            let mut task = self.task.lock().await;
            task.take()
        };
        if let Some((_, handle)) = taken {
            let _ = handle.await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_loop(
        queue: UploadQueueManager,
        cache: Arc<UploadUrlCache>,
        executor: Arc<UploadExecutor>,
        config: SessionConfig,
        status_tx: watch::Sender<SessionStatus>,
        token: CancellationToken,
        user_id: String,
        session_id: Uuid,
    ) {
        let mut consecutive_errors = 0u32;

        loop {
            if token.is_cancelled() {
                info!("Session {} stopped before next claim", session_id);
                status_tx.send_modify(|s| {
                    s.phase = SessionPhase::Completed;
                    s.current_item = None;
                });
                break;
            }

            match Self::run_cycle(&queue, &cache, &executor, &config, &status_tx, &user_id).await {
                Ok(CycleResult::Drained) => {
                    info!("Session {} drained the queue", session_id);
                    // Items skipped while the coordination API was down stay
                    // queued; report what the store actually holds.
                    let pending = queue.pending_count(&user_id).await.unwrap_or(0);
                    status_tx.send_modify(|s| {
                        s.phase = SessionPhase::Completed;
                        s.pending = pending;
                        s.current_item = None;
                    });
                    break;
                }
                Ok(CycleResult::Processed) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        "Session {} cycle error {}/{}: {}",
                        session_id, consecutive_errors, config.max_consecutive_errors, e
                    );

                    if consecutive_errors >= config.max_consecutive_errors {
                        error!(
                            "Session {} giving up after {} consecutive errors",
                            session_id, consecutive_errors
                        );
                        status_tx.send_modify(|s| {
                            s.phase = SessionPhase::Failed;
                            s.current_item = None;
                        });
                        break;
                    }

                    let delay = config.backoff.delay_for(consecutive_errors);
                    debug!("Session {} backing off {:?}", session_id, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {}
                    }
                }
            }
        }
    }

    /// One claim → dispatch → drain cycle.
    async fn run_cycle(
        queue: &UploadQueueManager,
        cache: &Arc<UploadUrlCache>,
        executor: &Arc<UploadExecutor>,
        config: &SessionConfig,
        status_tx: &watch::Sender<SessionStatus>,
        user_id: &str,
    ) -> SessionResult<CycleResult> {
        let max_attempts = executor.config().max_attempts;
        let items = queue
            .claim(user_id, config.batch_size, max_attempts, config.claim_visibility)
            .await?;

        if items.is_empty() {
            return Ok(CycleResult::Drained);
        }

        debug!("Cycle claimed {} items", items.len());

        // One coordination call warms the cache for the whole batch; hashes
        // it could not cover are skipped by their workers.
        let hashes: Vec<String> = items.iter().map(|i| i.content_hash.clone()).collect();
        let _ = cache.get_batch(&hashes).await;

        let batch_len = items.len();
        let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();

        for item in items {
            status_tx.send_modify(|s| s.current_item = Some(item.content_hash.clone()));
            executor.dispatch(item, outcome_tx.clone());
        }
        drop(outcome_tx);

        // Pool drain: every dispatched worker reports exactly one outcome.
        let mut received = 0usize;
        while let Some(outcome) = outcome_rx.recv().await {
            received += 1;
            Self::apply_outcome(status_tx, &outcome);
        }
        if received != batch_len {
            warn!(
                "Pool drain saw {} outcomes for {} dispatched items",
                received, batch_len
            );
        }

        // Cheap resynchronization beats delta bookkeeping drift.
        let pending = queue.pending_count(user_id).await?;
        status_tx.send_modify(|s| {
            s.pending = pending;
            s.current_item = None;
        });

        Ok(CycleResult::Processed)
    }

    fn apply_outcome(status_tx: &watch::Sender<SessionStatus>, outcome: &ItemOutcome) {
        status_tx.send_modify(|s| match outcome {
            ItemOutcome::Completed { .. } => s.completed += 1,
            ItemOutcome::Failed { .. } => s.failed += 1,
            ItemOutcome::Skipped { .. } => s.skipped += 1,
            ItemOutcome::Retried { .. } => {}
        });
    }
}
