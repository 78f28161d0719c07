//! End-to-end session tests
//!
//! Drives the full agent (queue store, URL cache, executor, session
//! controller) against mock host collaborators and a wiremock storage
//! endpoint.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tempfile::TempDir;
use tokio::time::sleep;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use attachment_sync::{
    AttachmentRef, AttachmentSync, AttachmentSyncConfig, BackoffConfig, CoordinatorError,
    ExecutorConfig, FileAccessor, QueueConnectionConfig, SessionConfig, SessionController,
    SessionGate, SessionKind, SessionPhase, SyncError, TransferConfig, UploadCoordinator,
    UploadExecutor, UploadQueueManager, UploadUrlCache, UrlCacheConfig,
};

const USER: &str = "user-1";

/// File accessor that serves fixed bytes with a configurable delay and
/// records the peak number of concurrent reads.
struct MockFiles {
    delay: Duration,
    current: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

impl MockFiles {
    fn new(delay: Duration) -> (Self, Arc<AtomicUsize>) {
        let peak = Arc::new(AtomicUsize::new(0));
        (
            Self {
                delay,
                current: AtomicUsize::new(0),
                peak: peak.clone(),
            },
            peak,
        )
    }
}

#[async_trait]
impl FileAccessor for MockFiles {
    async fn resolve_path(&self, item_ref: &AttachmentRef) -> Option<PathBuf> {
        Some(PathBuf::from(format!("/attachments/{}", item_ref.item_key)))
    }

    async fn read_bytes(&self, _path: &Path) -> std::io::Result<Vec<u8>> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(vec![0u8; 256])
    }

    async fn page_count(&self, _item_ref: &AttachmentRef) -> Option<i64> {
        Some(2)
    }

    async fn mime_type(&self, _item_ref: &AttachmentRef) -> String {
        "application/pdf".to_string()
    }
}

/// Coordinator that issues wiremock-backed URLs and records outcome calls.
struct MockCoordinator {
    storage_base: String,
    completed: Mutex<Vec<String>>,
    failed: Mutex<Vec<String>>,
    resettable: Mutex<Vec<AttachmentRef>>,
}

impl MockCoordinator {
    fn new(storage_base: &str) -> Self {
        Self {
            storage_base: storage_base.to_string(),
            completed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            resettable: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl UploadCoordinator for MockCoordinator {
    async fn get_upload_urls(
        &self,
        hashes: &[String],
    ) -> Result<HashMap<String, String>, CoordinatorError> {
        Ok(hashes
            .iter()
            .map(|h| (h.clone(), format!("{}/objects/{}", self.storage_base, h)))
            .collect())
    }

    async fn mark_completed(
        &self,
        content_hash: &str,
        _mime_type: &str,
        _size: u64,
        _page_count: Option<i64>,
    ) -> Result<(), CoordinatorError> {
        self.completed.lock().unwrap().push(content_hash.to_string());
        Ok(())
    }

    async fn mark_failed(&self, content_hash: &str) -> Result<(), CoordinatorError> {
        self.failed.lock().unwrap().push(content_hash.to_string());
        Ok(())
    }

    async fn reset_failed_uploads(&self) -> Result<Vec<AttachmentRef>, CoordinatorError> {
        Ok(self.resettable.lock().unwrap().clone())
    }
}

struct MockGate {
    authenticated: AtomicBool,
    plan_allows: AtomicBool,
}

impl MockGate {
    fn allowing() -> Self {
        Self {
            authenticated: AtomicBool::new(true),
            plan_allows: AtomicBool::new(true),
        }
    }
}

impl SessionGate for MockGate {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn current_user_id(&self) -> Option<String> {
        if self.is_authenticated() {
            Some(USER.to_string())
        } else {
            None
        }
    }

    fn plan_allows_upload(&self) -> bool {
        self.plan_allows.load(Ordering::SeqCst)
    }
}

struct TestAgent {
    agent: AttachmentSync,
    coordinator: Arc<MockCoordinator>,
    gate: Arc<MockGate>,
    peak_reads: Arc<AtomicUsize>,
    _server: MockServer,
    _dir: TempDir,
}

async fn build_agent(read_delay: Duration, concurrency: usize) -> TestAgent {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let pool = QueueConnectionConfig::with_database_path(dir.path().join("agent.db"))
        .create_pool()
        .await
        .unwrap();

    let (files, peak_reads) = MockFiles::new(read_delay);
    let coordinator = Arc::new(MockCoordinator::new(&server.uri()));
    let gate = Arc::new(MockGate::allowing());

    let config = AttachmentSyncConfig {
        executor: ExecutorConfig {
            concurrency,
            ..ExecutorConfig::default()
        },
        session: SessionConfig {
            batch_size: 10,
            ..SessionConfig::default()
        },
        transfer: TransferConfig {
            backoff_step: Duration::from_millis(10),
            ..TransferConfig::default()
        },
        ..AttachmentSyncConfig::default()
    };

    let agent = AttachmentSync::new(
        pool,
        Arc::new(files),
        coordinator.clone(),
        gate.clone(),
        config,
    )
    .await
    .unwrap();

    TestAgent {
        agent,
        coordinator,
        gate,
        peak_reads,
        _server: server,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_session_drains_fifty_items_with_bounded_concurrency() {
    let t = build_agent(Duration::from_millis(10), 3).await;

    for i in 0..50 {
        t.agent
            .enqueue(&AttachmentRef::new(1, format!("KEY{:02}", i)), &format!("h{:02}", i))
            .await
            .unwrap();
    }

    t.agent.start(SessionKind::Manual).await.unwrap();
    t.agent.wait_idle().await;

    let status = t.agent.status();
    assert_eq!(status.phase, SessionPhase::Completed);
    assert_eq!(status.pending, 0);
    assert_eq!(status.completed, 50);
    assert_eq!(status.failed, 0);
    assert!(status.current_item.is_none());

    assert_eq!(t.coordinator.completed.lock().unwrap().len(), 50);
    assert!(
        t.peak_reads.load(Ordering::SeqCst) <= 3,
        "more than 3 transfers were in flight"
    );
}

#[tokio::test]
async fn test_empty_queue_session_completes_immediately() {
    let t = build_agent(Duration::ZERO, 3).await;

    t.agent.start(SessionKind::Background).await.unwrap();
    t.agent.wait_idle().await;

    let status = t.agent.status();
    assert_eq!(status.phase, SessionPhase::Completed);
    assert_eq!(status.completed, 0);
}

#[tokio::test]
async fn test_start_refused_without_authentication() {
    let t = build_agent(Duration::ZERO, 3).await;
    t.gate.authenticated.store(false, Ordering::SeqCst);

    let err = t.agent.start(SessionKind::Initial).await.unwrap_err();
    assert!(matches!(err, SyncError::NotAuthenticated));
    assert_eq!(t.agent.status().phase, SessionPhase::Idle);
}

#[tokio::test]
async fn test_start_refused_when_plan_disables_upload() {
    let t = build_agent(Duration::ZERO, 3).await;
    t.gate.plan_allows.store(false, Ordering::SeqCst);

    let err = t.agent.start(SessionKind::Initial).await.unwrap_err();
    assert!(matches!(err, SyncError::UploadDisabled));
}

#[tokio::test]
async fn test_enqueue_requires_authentication() {
    let t = build_agent(Duration::ZERO, 3).await;
    t.gate.authenticated.store(false, Ordering::SeqCst);

    let err = t
        .agent
        .enqueue(&AttachmentRef::new(1, "AAAA"), "h1")
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::NotAuthenticated));
}

#[tokio::test]
async fn test_double_start_is_idempotent() {
    let t = build_agent(Duration::from_millis(30), 3).await;

    for i in 0..12 {
        t.agent
            .enqueue(&AttachmentRef::new(1, format!("KEY{}", i)), &format!("h{}", i))
            .await
            .unwrap();
    }

    t.agent.start(SessionKind::Manual).await.unwrap();
    // Second start while running must not spawn a second loop.
    t.agent.start(SessionKind::Manual).await.unwrap();
    t.agent.wait_idle().await;

    let status = t.agent.status();
    assert_eq!(status.phase, SessionPhase::Completed);
    assert_eq!(status.completed, 12);
    assert_eq!(t.coordinator.completed.lock().unwrap().len(), 12);
}

#[tokio::test]
async fn test_stop_ceases_claiming_and_drains_in_flight() {
    let t = build_agent(Duration::from_millis(200), 3).await;

    for i in 0..30 {
        t.agent
            .enqueue(&AttachmentRef::new(1, format!("KEY{}", i)), &format!("h{}", i))
            .await
            .unwrap();
    }

    t.agent.start(SessionKind::Manual).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    t.agent.stop().await;

    let status = t.agent.status();
    assert_eq!(status.phase, SessionPhase::Completed);
    // The first batch may have drained, but later batches were never
    // claimed.
    assert!(
        t.agent.queue().pending_count(USER).await.unwrap() >= 20,
        "stop() kept claiming new batches"
    );
}

#[tokio::test]
async fn test_session_fails_after_consecutive_cycle_errors() {
    // A pool with no schema makes every claim fail at the cycle level.
    let dir = tempfile::tempdir().unwrap();
    let pool = QueueConnectionConfig::with_database_path(dir.path().join("broken.db"))
        .create_pool()
        .await
        .unwrap();
    let queue = UploadQueueManager::new(pool);

    let server = MockServer::start().await;
    let coordinator = Arc::new(MockCoordinator::new(&server.uri()));
    let cache = Arc::new(UploadUrlCache::new(
        coordinator.clone(),
        UrlCacheConfig::default(),
    ));
    let (files, _) = MockFiles::new(Duration::ZERO);
    let transfer = Arc::new(attachment_sync::TransferClient::with_defaults().unwrap());
    let executor = Arc::new(UploadExecutor::new(
        queue.clone(),
        cache.clone(),
        Arc::new(files),
        coordinator,
        transfer,
        ExecutorConfig::default(),
    ));

    let controller = SessionController::new(
        queue,
        cache,
        executor,
        Arc::new(MockGate::allowing()),
        SessionConfig {
            batch_size: 10,
            claim_visibility: ChronoDuration::minutes(10),
            max_consecutive_errors: 5,
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(2),
                max_delay: Duration::from_millis(10),
                jitter_factor: 0.0,
            },
        },
    );

    let status_rx = controller.subscribe();
    controller.start(SessionKind::Background).await.unwrap();
    controller.wait_idle().await;

    assert_eq!(controller.status().phase, SessionPhase::Failed);
    assert_eq!(status_rx.borrow().phase, SessionPhase::Failed);
}

#[tokio::test]
async fn test_status_subscription_observes_progress() {
    let t = build_agent(Duration::from_millis(5), 3).await;

    for i in 0..5 {
        t.agent
            .enqueue(&AttachmentRef::new(1, format!("KEY{}", i)), &format!("h{}", i))
            .await
            .unwrap();
    }

    let mut rx = t.agent.subscribe();
    t.agent.start(SessionKind::Manual).await.unwrap();

    // start() publishes the running phase before the loop task gets a turn.
    assert_eq!(t.agent.status().phase, SessionPhase::InProgress);

    // The watch channel coalesces updates; wait until the terminal value
    // lands and check the tallies it carries.
    loop {
        let status = rx.borrow_and_update().clone();
        if status.phase == SessionPhase::Completed {
            assert_eq!(status.completed, 5);
            assert_eq!(status.pending, 0);
            break;
        }
        rx.changed().await.unwrap();
    }

    t.agent.wait_idle().await;
}

#[tokio::test]
async fn test_retry_failed_reenqueues_reported_refs() {
    let t = build_agent(Duration::ZERO, 3).await;
    let item_ref = AttachmentRef::new(1, "AAAA");

    t.agent.enqueue(&item_ref, "h1").await.unwrap();

    // Simulate a permanent failure recorded earlier.
    let queue = t.agent.queue();
    queue
        .claim(USER, 1, 3, ChronoDuration::minutes(10))
        .await
        .unwrap();
    queue
        .fail(USER, "h1", attachment_sync::UploadStatus::Failed)
        .await
        .unwrap();
    assert_eq!(queue.pending_count(USER).await.unwrap(), 0);

    t.coordinator
        .resettable
        .lock()
        .unwrap()
        .push(item_ref.clone());

    let restored = t.agent.retry_failed().await.unwrap();
    assert_eq!(restored, 1);
    assert_eq!(queue.pending_count(USER).await.unwrap(), 1);

    // The reset item uploads cleanly on the next session.
    t.agent.start(SessionKind::Manual).await.unwrap();
    t.agent.wait_idle().await;
    assert_eq!(t.agent.status().completed, 1);
}
