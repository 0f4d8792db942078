use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors, split by how the scheduler must react to them
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database locked while it is being opened
    #[error("Another feedprobe process appears to hold the database. Please stop it and try again.")]
    InstanceLocked,

    /// Transient lock contention (SQLITE_BUSY / SQLITE_LOCKED); safe to retry
    #[error("Database busy: {0}")]
    Contention(String),

    /// A row the operation depends on does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[source] sqlx::Error),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(err: sqlx::Error) -> Self {
        if is_lock_error(&err) {
            DatabaseError::Contention(err.to_string())
        } else {
            DatabaseError::Other(err)
        }
    }
}

impl DatabaseError {
    /// Classify an error raised while opening the database: lock errors at
    /// open time mean another process owns the file.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_error(&err)
            || err
                .to_string()
                .to_lowercase()
                .contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }

    /// True for errors the commit layer may retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Contention(_))
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_lock_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => return true,
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code().and_then(|c| c.parse::<i32>().ok()) {
                if matches!(code & 0xff, 5 | 6) {
                    return true;
                }
            }
        }
        _ => {}
    }
    let message = err.to_string().to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
}

// ============================================================================
// Candidates
// ============================================================================

/// A harvested URL to be imported into the candidate pool
#[derive(Debug, Clone, Default)]
pub struct NewCandidate {
    pub url: String,
    pub score: Option<i64>,
    pub submitted_at: Option<i64>,
    pub source: Option<String>,
}

impl NewCandidate {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }
}

/// A candidate row as stored. `host` is `None` when the URL did not parse or
/// has no host; such candidates never reach the prober.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Candidate {
    pub id: i64,
    pub url: String,
    pub canonical_url: String,
    pub host: Option<String>,
    pub score: Option<i64>,
    pub submitted_at: Option<i64>,
    pub source: Option<String>,
}

impl Candidate {
    /// The counters this candidate contributes to the feed it resolves to.
    pub fn submission(&self) -> Submission {
        Submission {
            candidate_id: self.id,
            score: self.score.unwrap_or(0),
            submitted_at: self.submitted_at,
        }
    }
}

/// Result counts for a candidate import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub inserted: u64,
    pub duplicates: u64,
}

// ============================================================================
// Feeds
// ============================================================================

/// A discovered feed, identified by the canonical form of its root URL
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct FeedRecord {
    pub id: i64,
    pub root_canonical_url: String,
    pub root_url: String,
    pub feed_url: String,
    pub title: Option<String>,
    pub submission_count: i64,
    pub total_score: i64,
    pub latest_submitted_at: Option<i64>,
    pub discovered_at: i64,
}

// ============================================================================
// Dispositions
// ============================================================================

/// Why a candidate was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Host is on the configured skip list
    SkippedHost,
    /// URL did not parse, has no host, or the oracle rejected it
    InvalidUrl,
    /// Every probe point answered without a single feed
    FeedNotFound,
    /// The candidate's own URL could not be fetched
    Unreachable,
    /// The candidate's own URL served XML that is not a valid feed
    BadFeed,
}

impl DiscardReason {
    pub const ALL: [DiscardReason; 5] = [
        DiscardReason::SkippedHost,
        DiscardReason::InvalidUrl,
        DiscardReason::FeedNotFound,
        DiscardReason::Unreachable,
        DiscardReason::BadFeed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::SkippedHost => "skipped_host",
            DiscardReason::InvalidUrl => "invalid_url",
            DiscardReason::FeedNotFound => "feed_not_found",
            DiscardReason::Unreachable => "unreachable",
            DiscardReason::BadFeed => "bad_feed",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown discard reason '{0}'")]
pub struct UnknownReason(pub String);

impl FromStr for DiscardReason {
    type Err = UnknownReason;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiscardReason::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| UnknownReason(s.to_owned()))
    }
}

/// Terminal state of a processed candidate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Discarded { candidate_id: i64, reason: String },
    Matched { candidate_id: i64, feed_id: i64 },
}

impl Disposition {
    pub fn candidate_id(&self) -> i64 {
        match self {
            Disposition::Discarded { candidate_id, .. } | Disposition::Matched { candidate_id, .. } => {
                *candidate_id
            }
        }
    }
}

/// Row type for disposition queries: (candidate_id, kind, reason, feed_id)
pub(crate) type DispositionRow = (i64, String, Option<String>, Option<i64>);

// ============================================================================
// Mutations
// ============================================================================

/// What a candidate adds to a feed's aggregate counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    pub candidate_id: i64,
    pub score: i64,
    pub submitted_at: Option<i64>,
}

/// One unit of work for the commit layer; each is applied in a single
/// transaction and writes exactly one disposition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// Mark the candidate discarded
    Discard {
        candidate_id: i64,
        reason: DiscardReason,
    },
    /// Mark the candidate matched to an already registered feed
    Match { submission: Submission, feed_id: i64 },
    /// Register (or reinforce) the feed found by probing and mark the candidate matched
    Register {
        submission: Submission,
        root_url: String,
        feed_url: String,
        title: Option<String>,
    },
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of the work store for `status`
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub candidates: i64,
    pub pending: i64,
    pub matched: i64,
    pub discarded: Vec<(String, i64)>,
    pub feeds: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_round_trips_through_str() {
        for reason in DiscardReason::ALL {
            assert_eq!(reason.as_str().parse::<DiscardReason>().unwrap(), reason);
        }
        assert!("nope".parse::<DiscardReason>().is_err());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = DatabaseError::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient());
        let err = DatabaseError::from(sqlx::Error::RowNotFound);
        assert!(!err.is_transient());
    }
}
