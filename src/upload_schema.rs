//! Persisted Schema for Attachments and the Upload Queue
//!
//! Two tables: `attachments` tracks every file the host has handed to the
//! agent together with its terminal upload status; `upload_queue` holds one
//! row of pending work per (user, content hash). Both carry a uniqueness
//! constraint on (user, content hash) so re-enqueueing the same bytes can
//! never fan out into duplicate work.

use sqlx::SqlitePool;
use tracing::debug;

/// DDL for the attachment record table.
const ATTACHMENTS_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS attachments (
    user_id TEXT NOT NULL,
    library_id INTEGER NOT NULL,
    item_key TEXT NOT NULL,
    content_hash TEXT,
    upload_status TEXT NOT NULL DEFAULT 'pending'
        CHECK (upload_status IN ('pending', 'completed', 'failed', 'plan_limit')),
    PRIMARY KEY (user_id, library_id, item_key)
)
"#;

/// DDL for the durable work queue.
const UPLOAD_QUEUE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS upload_queue (
    user_id TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    visibility TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 0 CHECK (attempt_count >= 0),
    library_id INTEGER NOT NULL,
    item_key TEXT NOT NULL,
    queued_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    PRIMARY KEY (user_id, content_hash)
)
"#;

const INDEX_DDL: &[&str] = &[
    // Multiple NULL hashes are allowed; a non-null hash is unique per user.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_attachments_user_hash \
     ON attachments (user_id, content_hash)",
    "CREATE INDEX IF NOT EXISTS idx_attachments_status \
     ON attachments (user_id, upload_status)",
    // Claim scans filter on visibility and order by attempt count.
    "CREATE INDEX IF NOT EXISTS idx_upload_queue_claimable \
     ON upload_queue (user_id, visibility, attempt_count)",
];

/// Apply the schema idempotently. Safe to call on every startup.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(ATTACHMENTS_DDL).execute(pool).await?;
    sqlx::query(UPLOAD_QUEUE_DDL).execute(pool).await?;

    for ddl in INDEX_DDL {
        sqlx::query(ddl).execute(pool).await?;
    }

    debug!("Attachment sync schema applied");
    Ok(())
}
