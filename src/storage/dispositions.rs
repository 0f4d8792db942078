use sqlx::{Sqlite, Transaction};

use super::schema::Database;
use super::types::{DatabaseError, Mutation, Submission};
use crate::util::canonicalize;

impl Database {
    // ========================================================================
    // Mutations
    // ========================================================================

    /// Apply one mutation in a single transaction.
    ///
    /// Returns the id of the feed the candidate resolved to, or `None` for a
    /// discard. A second disposition for the same candidate violates the
    /// primary key and fails without retry.
    ///
    /// # Errors
    ///
    /// [`DatabaseError::Contention`] when SQLite reports the database busy or
    /// locked; the caller may retry the whole mutation since the transaction
    /// was rolled back.
    pub async fn apply(&self, mutation: &Mutation) -> Result<Option<i64>, DatabaseError> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        let feed_id = match mutation {
            Mutation::Discard {
                candidate_id,
                reason,
            } => {
                sqlx::query(
                    "INSERT INTO dispositions (candidate_id, kind, reason, decided_at) VALUES (?, 'discarded', ?, ?)",
                )
                .bind(candidate_id)
                .bind(reason.as_str())
                .bind(now)
                .execute(&mut *tx)
                .await?;
                None
            }
            Mutation::Match {
                submission,
                feed_id,
            } => {
                claim_feed_table(&mut tx).await?;
                let updated = sqlx::query(
                    r#"
                    UPDATE feeds SET
                        submission_count = submission_count + 1,
                        total_score = total_score + ?,
                        latest_submitted_at = MAX(COALESCE(latest_submitted_at, ?), COALESCE(?, latest_submitted_at))
                    WHERE id = ?
                "#,
                )
                .bind(submission.score)
                .bind(submission.submitted_at)
                .bind(submission.submitted_at)
                .bind(feed_id)
                .execute(&mut *tx)
                .await?;
                if updated.rows_affected() == 0 {
                    return Err(DatabaseError::NotFound(format!("feed {feed_id}")));
                }
                insert_match(&mut tx, submission, *feed_id, now).await?;
                Some(*feed_id)
            }
            Mutation::Register {
                submission,
                root_url,
                feed_url,
                title,
            } => {
                claim_feed_table(&mut tx).await?;
                let (feed_id,): (i64,) = sqlx::query_as(
                    r#"
                    INSERT INTO feeds (
                        root_canonical_url, root_url, feed_url, title,
                        submission_count, total_score, latest_submitted_at, discovered_at
                    )
                    VALUES (?, ?, ?, ?, 1, ?, ?, ?)
                    ON CONFLICT(root_canonical_url) DO UPDATE SET
                        submission_count = feeds.submission_count + 1,
                        total_score = feeds.total_score + excluded.total_score,
                        latest_submitted_at = MAX(
                            COALESCE(feeds.latest_submitted_at, excluded.latest_submitted_at),
                            COALESCE(excluded.latest_submitted_at, feeds.latest_submitted_at)
                        ),
                        title = COALESCE(feeds.title, excluded.title)
                    RETURNING id
                "#,
                )
                .bind(canonicalize(root_url))
                .bind(root_url)
                .bind(feed_url)
                .bind(title)
                .bind(submission.score)
                .bind(submission.submitted_at)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                insert_match(&mut tx, submission, feed_id, now).await?;
                Some(feed_id)
            }
        };

        tx.commit().await?;
        Ok(feed_id)
    }
}

/// No-op write that takes SQLite's write lock up front, so the read-then-write
/// steps that follow cannot interleave with another writer.
async fn claim_feed_table(tx: &mut Transaction<'_, Sqlite>) -> Result<(), DatabaseError> {
    sqlx::query("UPDATE feeds SET id = id WHERE 0")
        .execute(&mut **tx)
        .await?;
    Ok(())
}

async fn insert_match(
    tx: &mut Transaction<'_, Sqlite>,
    submission: &Submission,
    feed_id: i64,
    now: i64,
) -> Result<(), DatabaseError> {
    sqlx::query(
        "INSERT INTO dispositions (candidate_id, kind, feed_id, decided_at) VALUES (?, 'matched', ?, ?)",
    )
    .bind(submission.candidate_id)
    .bind(feed_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
