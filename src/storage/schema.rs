use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

// ============================================================================
// Database
// ============================================================================

/// The durable work store: candidate pool, dispositions and feed registry.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("connections", &self.pool.size())
            .finish()
    }
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process has the
    /// database locked (SQLITE_BUSY, SQLITE_LOCKED, SQLITE_CANTOPEN).
    /// Returns `DatabaseError::Migration` if schema creation fails.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        Self::open_with_busy_timeout(path, Duration::from_secs(5)).await
    }

    /// Like [`Database::open`], with an explicit SQLite `busy_timeout`.
    pub async fn open_with_busy_timeout(
        path: &str,
        busy_timeout: Duration,
    ) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout lets SQLite absorb short lock waits itself; what still
        // surfaces as SQLITE_BUSY is handled by the scheduler's commit retry.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .busy_timeout(busy_timeout);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
            {
                DatabaseError::InstanceLocked
            } else {
                DatabaseError::Migration(e.to_string())
            }
        })?;
        Ok(db)
    }

    /// Create the schema atomically within a transaction.
    ///
    /// Every statement uses `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // Candidate pool. canonical_url and host are derived once at import.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS candidates (
                id INTEGER PRIMARY KEY,
                url TEXT UNIQUE NOT NULL,
                canonical_url TEXT NOT NULL,
                host TEXT,
                score INTEGER,
                submitted_at INTEGER,
                source TEXT,
                added_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Feed registry keyed by the canonical root URL
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                root_canonical_url TEXT UNIQUE NOT NULL,
                root_url TEXT NOT NULL,
                feed_url TEXT NOT NULL,
                title TEXT,
                submission_count INTEGER NOT NULL DEFAULT 0,
                total_score INTEGER NOT NULL DEFAULT 0,
                latest_submitted_at INTEGER,
                discovered_at INTEGER NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // One terminal disposition per candidate; the primary key rejects a second one
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dispositions (
                candidate_id INTEGER PRIMARY KEY REFERENCES candidates(id) ON DELETE CASCADE,
                kind TEXT NOT NULL CHECK (kind IN ('discarded', 'matched')),
                reason TEXT,
                feed_id INTEGER REFERENCES feeds(id),
                decided_at INTEGER NOT NULL,
                CHECK ((kind = 'matched') = (feed_id IS NOT NULL)),
                CHECK ((kind = 'discarded') = (reason IS NOT NULL))
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_candidates_host ON candidates(host)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dispositions_kind ON dispositions(kind, reason)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_dispositions_feed ON dispositions(feed_id)")
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}
