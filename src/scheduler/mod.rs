//! Host-aware concurrent scheduler.
//!
//! A fixed pool of workers drains the pending candidates of a [`Database`].
//! Each worker loops through three phases:
//!
//! 1. **Picking**, under the shared lock: choose a candidate on an idle host
//!    (largest pending bucket first). Candidates that can be settled without
//!    network access (invalid URL, skipped host, already covered by a known
//!    feed) are committed right there. Otherwise the host is activated.
//! 2. **Probing**, without the lock: run the [`FeedProber`] against the oracle.
//! 3. **Committing**, under the lock again: write the result, then release
//!    the host.
//!
//! At most one probe is in flight per host at any time. A worker stops when
//! the picker finds nothing on an idle host; hosts still active are drained by
//! the workers holding them.

mod committer;
mod hosts;
mod picker;
mod progress;

pub use committer::{commit_with_retry, Committer, RetryPolicy};
pub use hosts::HostExclusionSet;
pub use progress::{format_duration, ProgressUpdate};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::config::Config;
use crate::feed::{DiscoveryOracle, FeedProber};
use crate::storage::{DatabaseError, Database, Mutation};
use crate::util::root_display;
use picker::Pick;

// ============================================================================
// Error Types
// ============================================================================

/// Conditions that abort a run
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] DatabaseError),

    #[error("Database still busy after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: DatabaseError,
    },

    /// In-memory and persisted state disagree; continuing could corrupt results
    #[error("Scheduler invariant violated: {0}")]
    Invariant(String),

    #[error("Worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

// ============================================================================
// Options & Summary
// ============================================================================

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub workers: usize,
    pub retry: RetryPolicy,
    /// Hosts discarded without probing; subdomains match too
    pub skip_hosts: Vec<String>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl SchedulerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.workers,
            retry: RetryPolicy {
                attempts: config.commit_attempts,
                backoff: Duration::from_millis(config.commit_backoff_ms),
            },
            skip_hosts: config.skip_hosts.clone(),
        }
    }
}

/// Totals for a completed run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub processed: u64,
    pub total: u64,
    /// Oracle calls across all probes
    pub requests: u64,
    pub elapsed: Duration,
    /// Candidates whose probe registered (or reinforced) a feed
    pub registered: u64,
    /// Candidates matched to an already registered feed without probing
    pub matched: u64,
    pub discarded: u64,
}

// ============================================================================
// Shared State
// ============================================================================

/// Everything guarded by the scheduler's single lock.
#[derive(Debug)]
struct SharedState {
    hosts: HostExclusionSet,
    summary: RunSummary,
    started: Instant,
}

impl SharedState {
    /// Count a committed mutation and build the progress line for it.
    fn record(&mut self, worker: usize, mutation: &Mutation, requests: usize) -> ProgressUpdate {
        let summary = &mut self.summary;
        summary.processed += 1;
        summary.requests += requests as u64;
        match mutation {
            Mutation::Discard { .. } => summary.discarded += 1,
            Mutation::Match { .. } => summary.matched += 1,
            Mutation::Register { .. } => summary.registered += 1,
        }
        ProgressUpdate {
            worker,
            processed: summary.processed,
            total: summary.total,
            elapsed: self.started.elapsed(),
            requests,
        }
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Drains pending candidates with a pool of concurrent workers.
pub struct Scheduler {
    db: Database,
    prober: FeedProber,
    options: SchedulerOptions,
    progress: Option<mpsc::Sender<ProgressUpdate>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("db", &self.db)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(db: Database, oracle: Arc<dyn DiscoveryOracle>, options: SchedulerOptions) -> Self {
        Self {
            db,
            prober: FeedProber::new(oracle),
            options,
            progress: None,
        }
    }

    /// Send a [`ProgressUpdate`] after every processed candidate.
    pub fn with_progress(mut self, tx: mpsc::Sender<ProgressUpdate>) -> Self {
        self.progress = Some(tx);
        self
    }

    /// Process every pending candidate.
    ///
    /// Returns once all workers have stopped. The first fatal error aborts
    /// the remaining workers and is returned; everything committed before it
    /// stays committed.
    ///
    /// # Errors
    ///
    /// - [`SchedulerError::RetriesExhausted`] when the store stays busy
    /// - [`SchedulerError::Store`] on any other store failure
    /// - [`SchedulerError::Invariant`] when host bookkeeping is inconsistent
    /// - [`SchedulerError::Join`] if a worker panics
    pub async fn run(self) -> Result<RunSummary, SchedulerError> {
        let total = self.db.pending_count().await?.max(0) as u64;
        let workers = self.options.workers.max(1);
        tracing::info!(pending = total, workers = workers, "Starting run");

        let state = Arc::new(Mutex::new(SharedState {
            hosts: HostExclusionSet::new(),
            summary: RunSummary {
                total,
                ..RunSummary::default()
            },
            started: Instant::now(),
        }));
        let committer = Committer::new(self.db.clone(), self.options.retry);
        let skip_hosts: Arc<[String]> = self.options.skip_hosts.into();

        let mut set = JoinSet::new();
        for id in 0..workers {
            let worker = Worker {
                id,
                db: self.db.clone(),
                prober: self.prober.clone(),
                committer: committer.clone(),
                skip_hosts: Arc::clone(&skip_hosts),
                state: Arc::clone(&state),
                progress: self.progress.clone(),
            };
            set.spawn(worker.run());
        }
        // Only workers hold senders now, so the receiver closes when they finish
        drop(self.progress);

        while let Some(joined) = set.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => SchedulerError::Join(e),
            };
            tracing::error!(error = %failure, "Aborting run");
            set.abort_all();
            return Err(failure);
        }

        let state = state.lock().await;
        let summary = RunSummary {
            elapsed: state.started.elapsed(),
            ..state.summary.clone()
        };
        tracing::info!(
            processed = summary.processed,
            registered = summary.registered,
            matched = summary.matched,
            discarded = summary.discarded,
            requests = summary.requests,
            "Run complete"
        );
        Ok(summary)
    }
}

// ============================================================================
// Worker
// ============================================================================

struct Worker {
    id: usize,
    db: Database,
    prober: FeedProber,
    committer: Committer,
    skip_hosts: Arc<[String]>,
    state: Arc<Mutex<SharedState>>,
    progress: Option<mpsc::Sender<ProgressUpdate>>,
}

impl Worker {
    async fn run(self) -> Result<(), SchedulerError> {
        loop {
            let mut state = self.state.lock().await;

            match picker::pick(&self.db, &mut state.hosts, &self.skip_hosts).await? {
                Pick::Exhausted => {
                    tracing::debug!(worker = self.id, "No idle host with pending work, stopping");
                    return Ok(());
                }
                Pick::Resolved {
                    candidate,
                    mutation,
                } => {
                    self.committer.commit(&mutation).await?;
                    tracing::debug!(worker = self.id, candidate_id = candidate.id, "Resolved without probing");
                    let update = state.record(self.id, &mutation, 0);
                    drop(state);
                    self.report(update).await;
                }
                Pick::Probe {
                    candidate,
                    url,
                    host,
                } => {
                    drop(state);

                    let report = self.prober.probe(&url).await;
                    let mutation = match &report.hit {
                        Some(hit) => Mutation::Register {
                            submission: candidate.submission(),
                            root_url: root_display(&hit.root_url),
                            feed_url: hit.feed_url.clone(),
                            title: hit.title.clone(),
                        },
                        None => Mutation::Discard {
                            candidate_id: candidate.id,
                            reason: report.discard_reason(),
                        },
                    };

                    let mut state = self.state.lock().await;
                    let committed = self.committer.commit(&mutation).await;
                    // The host is released even when the commit failed
                    let released = state.hosts.release(&host);
                    let feed_id = committed?;
                    if !released {
                        return Err(SchedulerError::Invariant(format!(
                            "host {host} was not active when its probe finished"
                        )));
                    }

                    if let (Some(hit), Some(feed_id)) = (&report.hit, feed_id) {
                        tracing::info!(
                            candidate_id = candidate.id,
                            feed_id = feed_id,
                            root = %hit.root_url,
                            feed = %hit.feed_url,
                            "Feed found"
                        );
                    }
                    let update = state.record(self.id, &mutation, report.requests);
                    drop(state);
                    self.report(update).await;
                }
            }
        }
    }

    async fn report(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.progress {
            if let Err(e) = tx.send(update).await {
                tracing::warn!(error = %e, worker = self.id, "Progress channel send failed (receiver dropped)");
            }
        }
    }
}
