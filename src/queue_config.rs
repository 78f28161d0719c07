// Local Store Connection Configuration
//
// SQLite connection pooling for the attachment store and upload queue.
// WAL mode keeps claim transactions from blocking host-application reads.

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    SqlitePool,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Configuration for the SQLite connection pool backing the queue.
#[derive(Debug, Clone)]
pub struct QueueConnectionConfig {
    /// Database file path.
    pub database_path: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Timeout when acquiring a connection from the pool.
    pub connection_timeout: Duration,

    /// Time to wait when the database file is locked by another connection.
    pub busy_timeout: Duration,

    /// Synchronous mode (NORMAL is durable enough under WAL).
    pub synchronous: SqliteSynchronous,

    /// Create the database file if it does not exist.
    pub create_if_missing: bool,
}

impl Default for QueueConnectionConfig {
    fn default() -> Self {
        Self {
            database_path: "attachment_sync.db".to_string(),
            max_connections: 5,
            min_connections: 1,
            connection_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(30),
            synchronous: SqliteSynchronous::Normal,
            create_if_missing: true,
        }
    }
}

impl QueueConnectionConfig {
    /// Create a configuration pointing at the given database path.
    pub fn with_database_path<P: AsRef<Path>>(path: P) -> Self {
        Self {
            database_path: path.as_ref().to_string_lossy().to_string(),
            ..Self::default()
        }
    }

    /// Build SQLite connection options from this configuration.
    pub fn build_connection_options(&self) -> Result<SqliteConnectOptions, sqlx::Error> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", self.database_path))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(self.synchronous)
            .foreign_keys(true)
            .create_if_missing(self.create_if_missing)
            .busy_timeout(self.busy_timeout);

        Ok(options)
    }

    /// Create a connection pool with this configuration.
    pub async fn create_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        info!("Opening attachment store: {}", self.database_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .acquire_timeout(self.connection_timeout)
            .connect_with(self.build_connection_options()?)
            .await?;

        // Claim transactions rely on WAL for reader/writer concurrency.
        let row: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await?;

        if row.0.to_uppercase() != "WAL" {
            tracing::warn!("Expected WAL journal mode but got: {}", row.0);
        } else {
            debug!("WAL mode confirmed");
        }

        Ok(pool)
    }
}
