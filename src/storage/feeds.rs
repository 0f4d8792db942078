use super::schema::Database;
use super::types::{DatabaseError, Disposition, DispositionRow, FeedRecord, StoreStats};
use crate::util::matches_root;

const FEED_COLUMNS: &str = "id, root_canonical_url, root_url, feed_url, title, submission_count, \
     total_score, latest_submitted_at, discovered_at";

impl Database {
    // ========================================================================
    // Feed Registry
    // ========================================================================

    /// Find the registered feed whose root covers `canonical`.
    ///
    /// SQL narrows to roots that are raw string prefixes of `canonical`;
    /// [`matches_root`] then enforces the path-segment boundary. When nested
    /// roots both match, the most specific (longest) root wins.
    pub async fn find_feed_for(&self, canonical: &str) -> Result<Option<FeedRecord>, DatabaseError> {
        let prefixes: Vec<FeedRecord> = sqlx::query_as(&format!(
            r#"
            SELECT {FEED_COLUMNS}
            FROM feeds
            WHERE substr(?, 1, length(root_canonical_url)) = root_canonical_url
            ORDER BY length(root_canonical_url) DESC
        "#
        ))
        .bind(canonical)
        .fetch_all(&self.pool)
        .await?;

        Ok(prefixes
            .into_iter()
            .find(|feed| matches_root(canonical, &feed.root_canonical_url)))
    }

    /// Get a feed by its canonical root
    pub async fn feed_by_root(&self, root_canonical: &str) -> Result<Option<FeedRecord>, DatabaseError> {
        let feed = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds WHERE root_canonical_url = ?"
        ))
        .bind(root_canonical)
        .fetch_optional(&self.pool)
        .await?;
        Ok(feed)
    }

    /// All discovered feeds, most submitted first
    pub async fn feeds(&self) -> Result<Vec<FeedRecord>, DatabaseError> {
        let feeds = sqlx::query_as(&format!(
            "SELECT {FEED_COLUMNS} FROM feeds ORDER BY submission_count DESC, total_score DESC, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(feeds)
    }

    // ========================================================================
    // Dispositions & Stats
    // ========================================================================

    /// Disposition recorded for a candidate, if any
    pub async fn disposition(&self, candidate_id: i64) -> Result<Option<Disposition>, DatabaseError> {
        let row: Option<DispositionRow> = sqlx::query_as(
            "SELECT candidate_id, kind, reason, feed_id FROM dispositions WHERE candidate_id = ?",
        )
        .bind(candidate_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(disposition_from_row).transpose()
    }

    /// Every recorded disposition, ordered by candidate id
    pub async fn dispositions(&self) -> Result<Vec<Disposition>, DatabaseError> {
        let rows: Vec<DispositionRow> = sqlx::query_as(
            "SELECT candidate_id, kind, reason, feed_id FROM dispositions ORDER BY candidate_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(disposition_from_row).collect()
    }

    /// Counts for the `status` command
    pub async fn stats(&self) -> Result<StoreStats, DatabaseError> {
        let (candidates,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM candidates")
            .fetch_one(&self.pool)
            .await?;
        let (matched,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM dispositions WHERE kind = 'matched'")
                .fetch_one(&self.pool)
                .await?;
        let discarded: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT reason, COUNT(*) FROM dispositions
            WHERE kind = 'discarded'
            GROUP BY reason
            ORDER BY COUNT(*) DESC, reason
        "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let (feeds,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(&self.pool)
            .await?;

        Ok(StoreStats {
            candidates,
            pending: self.pending_count().await?,
            matched,
            discarded,
            feeds,
        })
    }
}

fn disposition_from_row(
    (candidate_id, kind, reason, feed_id): DispositionRow,
) -> Result<Disposition, DatabaseError> {
    match (kind.as_str(), reason, feed_id) {
        ("matched", _, Some(feed_id)) => Ok(Disposition::Matched {
            candidate_id,
            feed_id,
        }),
        ("discarded", Some(reason), _) => Ok(Disposition::Discarded {
            candidate_id,
            reason,
        }),
        _ => Err(DatabaseError::NotFound(format!(
            "malformed disposition for candidate {candidate_id} (kind '{kind}')"
        ))),
    }
}
