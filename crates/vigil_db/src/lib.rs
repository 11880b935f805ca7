//! Persistence layer for Vigil.
//!
//! Relational rows for targets, authorization records, runs, jobs, findings,
//! artifact references, run logs and audit events. Artifact bytes live in an
//! object store; only references are stored here.
//!
//! # Usage
//!
//! ```rust,ignore
//! use vigil_db::{JobQueue, VigilDb};
//!
//! let db = VigilDb::open("~/.vigil/vigil.sqlite3").await?;
//! let queue = JobQueue::new(db.clone(), RetryPolicy::default());
//! let job = queue.enqueue(&run_id).await?;
//! ```

mod error;
mod rows;
mod schema;

// Method implementations organized by domain
mod artifacts;
mod audit;
mod findings;
mod logs;
pub mod queue;
pub mod runs;
mod targets;

pub use error::{DbError, Result};
pub use queue::{JobQueue, Lease, NackOutcome, NackReason, QueueStats, ReclaimReport};
pub use runs::{NewRun, RunUpdate};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;
use vigil_protocol::RunId;

/// Capacity of the log notification channel. Lagging subscribers re-read from
/// the table, so overflow only costs latency.
const LOG_EVENT_CAPACITY: usize = 1024;

/// Handle to the Vigil database. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct VigilDb {
    pool: SqlitePool,
    log_events: broadcast::Sender<RunId>,
}

impl std::fmt::Debug for VigilDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VigilDb")
            .field("connections", &self.pool.size())
            .finish()
    }
}

impl VigilDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self::from_pool(pool);
        db.ensure_schema(true).await?;

        info!(path = %path.display(), "Database opened");

        Ok(db)
    }

    /// Private in-memory database.
    ///
    /// The pool is pinned to a single connection that never idles out, since
    /// every SQLite memory connection is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let db = Self::from_pool(pool);
        db.ensure_schema(false).await?;
        Ok(db)
    }

    fn from_pool(pool: SqlitePool) -> Self {
        let (log_events, _) = broadcast::channel(LOG_EVENT_CAPACITY);
        Self { pool, log_events }
    }

    /// Get the underlying connection pool (escape hatch for complex queries).
    ///
    /// Prefer using the typed methods instead.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database connection.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
impl VigilDb {
    /// Current time as milliseconds since Unix epoch.
    pub fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Convert milliseconds to DateTime.
    pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }
}
