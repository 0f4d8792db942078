use sqlx::QueryBuilder;
use url::Url;

use super::schema::Database;
use super::types::{Candidate, DatabaseError, DiscardReason, ImportReport, NewCandidate};
use crate::util::{canonicalize, host_key};

const CANDIDATE_COLUMNS: &str =
    "c.id, c.url, c.canonical_url, c.host, c.score, c.submitted_at, c.source";

/// Predicate for candidates that have no disposition yet
const PENDING: &str = "NOT EXISTS (SELECT 1 FROM dispositions d WHERE d.candidate_id = c.id)";

impl Database {
    // ========================================================================
    // Import
    // ========================================================================

    /// Add harvested URLs to the pool. URLs already present are skipped.
    ///
    /// Canonical URL and host bucket are computed here, once; a URL that does
    /// not parse is still stored (with no host) so it receives a disposition.
    pub async fn insert_candidates(
        &self,
        candidates: &[NewCandidate],
    ) -> Result<ImportReport, DatabaseError> {
        if candidates.is_empty() {
            return Ok(ImportReport::default());
        }

        const BATCH_SIZE: usize = 100;
        let now = chrono::Utc::now().timestamp();
        let mut inserted = 0u64;
        let mut tx = self.pool.begin().await?;

        for chunk in candidates.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
                "INSERT INTO candidates (url, canonical_url, host, score, submitted_at, source, added_at) ",
            );

            builder.push_values(chunk, |mut b, candidate| {
                let url = candidate.url.trim();
                let parsed = Url::parse(url).ok();
                // Feed roots are canonicalized from the parsed form; candidates must match it
                let canonical = match &parsed {
                    Some(parsed) => canonicalize(parsed.as_str()),
                    None => canonicalize(url),
                };
                b.push_bind(url.to_owned())
                    .push_bind(canonical)
                    .push_bind(parsed.as_ref().and_then(host_key))
                    .push_bind(candidate.score)
                    .push_bind(candidate.submitted_at)
                    .push_bind(candidate.source.clone())
                    .push_bind(now);
            });
            builder.push(" ON CONFLICT(url) DO NOTHING");

            let result = builder.build().execute(&mut *tx).await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;

        Ok(ImportReport {
            inserted,
            duplicates: candidates.len() as u64 - inserted,
        })
    }

    // ========================================================================
    // Work Selection
    // ========================================================================

    /// Select the next undisposed candidate, skipping `excluded` hosts.
    ///
    /// Candidates without a host come first (they resolve without probing).
    /// Otherwise the candidate is taken from the host with the most pending
    /// candidates; ties are broken arbitrarily.
    pub async fn next_candidate(
        &self,
        excluded: &[String],
    ) -> Result<Option<Candidate>, DatabaseError> {
        let hostless: Option<Candidate> = sqlx::query_as(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidates c WHERE c.host IS NULL AND {PENDING} LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        if hostless.is_some() {
            return Ok(hostless);
        }

        let Some((host, remaining)) = self.largest_pending_host(excluded).await? else {
            return Ok(None);
        };

        let candidate: Option<Candidate> = sqlx::query_as(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidates c WHERE c.host = ? AND {PENDING} ORDER BY c.id LIMIT 1"
        ))
        .bind(&host)
        .fetch_optional(&self.pool)
        .await?;

        tracing::trace!(host = %host, remaining = remaining, "Picked host bucket");
        Ok(candidate)
    }

    /// Host with the most pending candidates that is not in `excluded`
    pub async fn largest_pending_host(
        &self,
        excluded: &[String],
    ) -> Result<Option<(String, i64)>, DatabaseError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT c.host, COUNT(*) AS remaining FROM candidates c WHERE c.host IS NOT NULL AND ");
        builder.push(PENDING);

        if !excluded.is_empty() {
            builder.push(" AND c.host NOT IN (");
            let mut separated = builder.separated(", ");
            for host in excluded {
                separated.push_bind(host.as_str());
            }
            separated.push_unseparated(")");
        }

        builder.push(" GROUP BY c.host ORDER BY remaining DESC LIMIT 1");

        let row: Option<(String, i64)> = builder.build_query_as().fetch_optional(&self.pool).await?;
        Ok(row)
    }

    /// Number of candidates without a disposition
    pub async fn pending_count(&self) -> Result<i64, DatabaseError> {
        let (count,): (i64,) = sqlx::query_as(&format!(
            "SELECT COUNT(*) FROM candidates c WHERE {PENDING}"
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Get a candidate by its exact URL
    pub async fn candidate_by_url(&self, url: &str) -> Result<Option<Candidate>, DatabaseError> {
        let candidate = sqlx::query_as(&format!(
            "SELECT {CANDIDATE_COLUMNS} FROM candidates c WHERE c.url = ?"
        ))
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(candidate)
    }

    /// Return discarded candidates with `reason` to the pending pool.
    ///
    /// This is the only path by which a disposition is ever removed.
    pub async fn requeue(&self, reason: DiscardReason) -> Result<u64, DatabaseError> {
        let result =
            sqlx::query("DELETE FROM dispositions WHERE kind = 'discarded' AND reason = ?")
                .bind(reason.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }
}
