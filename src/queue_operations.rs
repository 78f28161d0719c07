//! Upload Queue Operations
//!
//! Durable work-queue store over SQLite. One row per (user, content hash);
//! claiming follows message-queue visibility-timeout semantics: a claimed
//! row is invisible to other claimers until its timeout elapses, so a crash
//! mid-upload self-heals when the row becomes reclaimable. Delivery is
//! therefore at-least-once and completion must be idempotent on the remote
//! side.
//!
//! Rows are destroyed only by `complete` or `fail`, both of which also
//! transition the paired attachment record. Callers must have obtained a
//! durable remote acknowledgement before invoking either (remote authority
//! first, local store second).

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::queue_types::{AttachmentRef, UploadQueueItem, UploadStatus};

/// Queue operation errors.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Queue item not found: {0}")]
    NotFound(String),
}

/// Result type for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Aggregate queue statistics for the status read model.
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    /// All rows for the user.
    pub total_items: i64,
    /// Rows a claim issued now would consider (ignoring max_attempts).
    pub claimable_items: i64,
    /// Rows that have been claimed at least once.
    pub retry_items: i64,
    /// Insertion time of the oldest row.
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

/// An entry handed to [`UploadQueueManager::reset`].
#[derive(Debug, Clone)]
pub struct ResetEntry {
    pub content_hash: String,
    pub item_ref: AttachmentRef,
}

/// Store for the durable upload queue and the paired attachment records.
#[derive(Clone)]
pub struct UploadQueueManager {
    pool: SqlitePool,
}

impl UploadQueueManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record (or refresh) an attachment the host wants synchronized.
    ///
    /// Sets the content hash and flips the record back to `pending`; the
    /// caller is expected to follow with [`upsert`](Self::upsert).
    pub async fn track(
        &self,
        user_id: &str,
        item_ref: &AttachmentRef,
        content_hash: &str,
    ) -> QueueResult<()> {
        if content_hash.is_empty() {
            return Err(QueueError::InvalidInput("empty content hash".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO attachments (user_id, library_id, item_key, content_hash, upload_status)
            VALUES (?1, ?2, ?3, ?4, 'pending')
            ON CONFLICT(user_id, library_id, item_key) DO UPDATE SET
                content_hash = excluded.content_hash,
                upload_status = 'pending'
            "#,
        )
        .bind(user_id)
        .bind(item_ref.library_id)
        .bind(&item_ref.item_key)
        .bind(content_hash)
        .execute(&self.pool)
        .await?;

        debug!("Tracking attachment {} (hash={})", item_ref, content_hash);
        Ok(())
    }

    /// Look up the recorded content hash for an attachment reference.
    pub async fn attachment_hash(
        &self,
        user_id: &str,
        item_ref: &AttachmentRef,
    ) -> QueueResult<Option<String>> {
        let row = sqlx::query(
            "SELECT content_hash FROM attachments \
             WHERE user_id = ?1 AND library_id = ?2 AND item_key = ?3",
        )
        .bind(user_id)
        .bind(item_ref.library_id)
        .bind(&item_ref.item_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.try_get("content_hash")?),
            None => Ok(None),
        }
    }

    /// Read the upload status of an attachment record.
    pub async fn attachment_status(
        &self,
        user_id: &str,
        item_ref: &AttachmentRef,
    ) -> QueueResult<Option<UploadStatus>> {
        let row = sqlx::query(
            "SELECT upload_status FROM attachments \
             WHERE user_id = ?1 AND library_id = ?2 AND item_key = ?3",
        )
        .bind(user_id)
        .bind(item_ref.library_id)
        .bind(&item_ref.item_key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let status: String = row.try_get("upload_status")?;
                Ok(UploadStatus::parse(&status))
            }
            None => Ok(None),
        }
    }

    /// Idempotent new-work upsert.
    ///
    /// Inserts a claimable row (`visibility = now`, `attempt_count = 0`).
    /// If a row for this (user, hash) already exists, only the
    /// representative reference is updated; visibility and attempt count
    /// are left alone so in-flight or backed-off work is not disturbed.
    pub async fn upsert(
        &self,
        user_id: &str,
        content_hash: &str,
        item_ref: &AttachmentRef,
    ) -> QueueResult<()> {
        if content_hash.is_empty() {
            return Err(QueueError::InvalidInput("empty content hash".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO upload_queue (user_id, content_hash, visibility, attempt_count, library_id, item_key)
            VALUES (?1, ?2, ?3, 0, ?4, ?5)
            ON CONFLICT(user_id, content_hash) DO UPDATE SET
                library_id = excluded.library_id,
                item_key = excluded.item_key
            "#,
        )
        .bind(user_id)
        .bind(content_hash)
        .bind(Utc::now())
        .bind(item_ref.library_id)
        .bind(&item_ref.item_key)
        .execute(&self.pool)
        .await?;

        debug!("Enqueued upload {} (ref={})", content_hash, item_ref);
        Ok(())
    }

    /// Administrative upsert that also overwrites visibility and attempt
    /// count on conflict. Used by [`reset`](Self::reset).
    pub async fn upsert_with_state(
        &self,
        user_id: &str,
        content_hash: &str,
        item_ref: &AttachmentRef,
        visibility: Option<DateTime<Utc>>,
        attempt_count: i32,
    ) -> QueueResult<()> {
        if content_hash.is_empty() {
            return Err(QueueError::InvalidInput("empty content hash".to_string()));
        }

        sqlx::query(
            r#"
            INSERT INTO upload_queue (user_id, content_hash, visibility, attempt_count, library_id, item_key)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id, content_hash) DO UPDATE SET
                visibility = excluded.visibility,
                attempt_count = excluded.attempt_count,
                library_id = excluded.library_id,
                item_key = excluded.item_key
            "#,
        )
        .bind(user_id)
        .bind(content_hash)
        .bind(visibility)
        .bind(attempt_count)
        .bind(item_ref.library_id)
        .bind(&item_ref.item_key)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Atomically claim up to `limit` visible items.
    ///
    /// Selects rows whose visibility is null or elapsed and whose attempt
    /// count is below `max_attempts`, fewest-retried first with the content
    /// hash as a deterministic tie-break. Each selected row gets
    /// `visibility = now + visibility_timeout` and an incremented attempt
    /// count inside the same transaction, so two concurrent claimers can
    /// never select the same row.
    pub async fn claim(
        &self,
        user_id: &str,
        limit: i64,
        max_attempts: i32,
        visibility_timeout: ChronoDuration,
    ) -> QueueResult<Vec<UploadQueueItem>> {
        let now = Utc::now();
        let claimed_until = now + visibility_timeout;

        // Single statement: concurrent claimers serialize on the write lock
        // instead of racing a read-then-update pair.
        let rows = sqlx::query(
            r#"
            UPDATE upload_queue
            SET visibility = ?1, attempt_count = attempt_count + 1
            WHERE user_id = ?2
              AND content_hash IN (
                  SELECT content_hash FROM upload_queue
                  WHERE user_id = ?2
                    AND (visibility IS NULL OR visibility <= ?3)
                    AND attempt_count < ?4
                  ORDER BY attempt_count ASC, content_hash ASC
                  LIMIT ?5
              )
            RETURNING user_id, content_hash, visibility, attempt_count, library_id, item_key, queued_at
            "#,
        )
        .bind(claimed_until)
        .bind(user_id)
        .bind(now)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut items = rows
            .iter()
            .map(Self::item_from_row)
            .collect::<QueueResult<Vec<_>>>()?;

        // RETURNING order is unspecified; restore fewest-retried-first with
        // the deterministic hash tie-break.
        items.sort_by(|a, b| {
            a.attempt_count
                .cmp(&b.attempt_count)
                .then_with(|| a.content_hash.cmp(&b.content_hash))
        });

        if !items.is_empty() {
            debug!("Claimed {} upload queue items", items.len());
        }
        Ok(items)
    }

    /// Delete the queue row and mark the attachment completed.
    ///
    /// Must only be called after the remote authority has durably accepted
    /// completion.
    pub async fn complete(&self, user_id: &str, content_hash: &str) -> QueueResult<bool> {
        self.finish(user_id, content_hash, UploadStatus::Completed).await
    }

    /// Delete the queue row and mark the attachment with a terminal status.
    ///
    /// Same remote-first precondition as [`complete`](Self::complete).
    pub async fn fail(
        &self,
        user_id: &str,
        content_hash: &str,
        status: UploadStatus,
    ) -> QueueResult<bool> {
        if !status.is_terminal() {
            return Err(QueueError::InvalidInput(format!(
                "fail requires a terminal status, got {}",
                status.as_str()
            )));
        }
        self.finish(user_id, content_hash, status).await
    }

    async fn finish(
        &self,
        user_id: &str,
        content_hash: &str,
        status: UploadStatus,
    ) -> QueueResult<bool> {
        let mut tx = self.pool.begin().await?;

        let deleted = sqlx::query(
            "DELETE FROM upload_queue WHERE user_id = ?1 AND content_hash = ?2",
        )
        .bind(user_id)
        .bind(content_hash)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            > 0;

        sqlx::query(
            "UPDATE attachments SET upload_status = ?1 \
             WHERE user_id = ?2 AND content_hash = ?3",
        )
        .bind(status.as_str())
        .bind(user_id)
        .bind(content_hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if deleted {
            debug!("Finished {} with status {}", content_hash, status.as_str());
        } else {
            warn!("Queue row already gone for {}", content_hash);
        }
        Ok(deleted)
    }

    /// Push a transiently-failed item out of claimability so its retry is
    /// spread out instead of hot-looping.
    pub async fn extend_visibility(
        &self,
        user_id: &str,
        content_hash: &str,
        minutes: i64,
    ) -> QueueResult<bool> {
        let until = Utc::now() + ChronoDuration::minutes(minutes);

        let updated = sqlx::query(
            "UPDATE upload_queue SET visibility = ?1 \
             WHERE user_id = ?2 AND content_hash = ?3",
        )
        .bind(until)
        .bind(user_id)
        .bind(content_hash)
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        if updated {
            debug!("Extended visibility of {} until {}", content_hash, until);
        } else {
            warn!("Cannot extend visibility, item not queued: {}", content_hash);
        }
        Ok(updated)
    }

    /// Re-insert items as fresh work (`visibility = NULL, attempt_count = 0`)
    /// and flip their attachment records back to pending. Used for
    /// user-initiated "retry all failed".
    pub async fn reset(&self, user_id: &str, items: &[ResetEntry]) -> QueueResult<u64> {
        let mut count = 0u64;
        for entry in items {
            self.upsert_with_state(user_id, &entry.content_hash, &entry.item_ref, None, 0)
                .await?;

            sqlx::query(
                "UPDATE attachments SET upload_status = 'pending' \
                 WHERE user_id = ?1 AND content_hash = ?2",
            )
            .bind(user_id)
            .bind(&entry.content_hash)
            .execute(&self.pool)
            .await?;

            count += 1;
        }

        if count > 0 {
            info!("Reset {} upload queue items", count);
        }
        Ok(count)
    }

    /// Number of rows currently in the queue for this user.
    pub async fn pending_count(&self, user_id: &str) -> QueueResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM upload_queue WHERE user_id = ?1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Aggregate statistics for the status read model.
    pub async fn stats(&self, user_id: &str) -> QueueResult<QueueStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_items,
                SUM(CASE WHEN visibility IS NULL OR visibility <= ?2 THEN 1 ELSE 0 END) AS claimable_items,
                SUM(CASE WHEN attempt_count > 0 THEN 1 ELSE 0 END) AS retry_items,
                MIN(queued_at) AS oldest_queued_at
            FROM upload_queue
            WHERE user_id = ?1
            "#,
        )
        .bind(user_id)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            total_items: row.try_get("total_items")?,
            claimable_items: row.try_get::<Option<i64>, _>("claimable_items")?.unwrap_or(0),
            retry_items: row.try_get::<Option<i64>, _>("retry_items")?.unwrap_or(0),
            oldest_queued_at: row.try_get("oldest_queued_at")?,
        })
    }

    /// Repair queue/state divergence: re-enqueue attachments that are
    /// `pending` with a known hash but have lost their queue row (a crash
    /// between remote acknowledgement and the local transition, or a
    /// historical bug). Returns the number of rows re-created.
    pub async fn repair_divergence(&self, user_id: &str) -> QueueResult<u64> {
        let restored = sqlx::query(
            r#"
            INSERT INTO upload_queue (user_id, content_hash, visibility, attempt_count, library_id, item_key)
            SELECT a.user_id, a.content_hash, NULL, 0, a.library_id, a.item_key
            FROM attachments a
            WHERE a.user_id = ?1
              AND a.upload_status = 'pending'
              AND a.content_hash IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM upload_queue q
                  WHERE q.user_id = a.user_id AND q.content_hash = a.content_hash
              )
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if restored > 0 {
            info!("Repair pass re-enqueued {} orphaned attachments", restored);
        } else {
            debug!("Repair pass found no queue/state divergence");
        }
        Ok(restored)
    }

    /// Fetch a single queue row, if present.
    pub async fn get(
        &self,
        user_id: &str,
        content_hash: &str,
    ) -> QueueResult<Option<UploadQueueItem>> {
        let row = sqlx::query(
            "SELECT user_id, content_hash, visibility, attempt_count, library_id, item_key, queued_at \
             FROM upload_queue WHERE user_id = ?1 AND content_hash = ?2",
        )
        .bind(user_id)
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| Self::item_from_row(&r)).transpose()
    }

    fn item_from_row(row: &sqlx::sqlite::SqliteRow) -> QueueResult<UploadQueueItem> {
        Ok(UploadQueueItem {
            user_id: row.try_get("user_id")?,
            content_hash: row.try_get("content_hash")?,
            visibility: row.try_get("visibility")?,
            attempt_count: row.try_get("attempt_count")?,
            item_ref: AttachmentRef {
                library_id: row.try_get("library_id")?,
                item_key: row.try_get("item_key")?,
            },
            queued_at: row.try_get("queued_at")?,
        })
    }
}
