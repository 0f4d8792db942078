use url::Url;

use super::hosts::HostExclusionSet;
use super::SchedulerError;
use crate::storage::{Candidate, Database, DiscardReason, Mutation};

/// What the picker decided for the next unit of work.
#[derive(Debug)]
pub(crate) enum Pick {
    /// No pending candidate on any host that is not already active
    Exhausted,
    /// Settled without probing; commit `mutation` straight away
    Resolved { candidate: Candidate, mutation: Mutation },
    /// Needs the prober. `host` has been activated and must be released after commit.
    Probe {
        candidate: Candidate,
        url: Url,
        host: String,
    },
}

/// True when `host` is `skip` itself or one of its subdomains.
pub(crate) fn is_skipped(host: &str, skip_hosts: &[String]) -> bool {
    skip_hosts.iter().any(|skip| {
        let skip = skip.trim().trim_start_matches("www.").to_ascii_lowercase();
        !skip.is_empty()
            && (host == skip
                || host
                    .strip_suffix(skip.as_str())
                    .is_some_and(|rest| rest.ends_with('.')))
    })
}

/// Choose the next candidate and classify it.
///
/// Must be called with the scheduler lock held: the check that the
/// candidate's host is idle and its activation happen in the same critical
/// section.
pub(crate) async fn pick(
    db: &Database,
    hosts: &mut HostExclusionSet,
    skip_hosts: &[String],
) -> Result<Pick, SchedulerError> {
    let Some(candidate) = db.next_candidate(&hosts.active()).await? else {
        return Ok(Pick::Exhausted);
    };

    let discard = |candidate: Candidate, reason: DiscardReason| Pick::Resolved {
        mutation: Mutation::Discard {
            candidate_id: candidate.id,
            reason,
        },
        candidate,
    };

    let Some(host) = candidate.host.clone() else {
        return Ok(discard(candidate, DiscardReason::InvalidUrl));
    };
    let url = match Url::parse(&candidate.url) {
        Ok(url) => url,
        Err(e) => {
            tracing::debug!(candidate_id = candidate.id, error = %e, "Candidate URL does not parse");
            return Ok(discard(candidate, DiscardReason::InvalidUrl));
        }
    };

    if is_skipped(&host, skip_hosts) {
        return Ok(discard(candidate, DiscardReason::SkippedHost));
    }

    if let Some(feed) = db.find_feed_for(&candidate.canonical_url).await? {
        tracing::debug!(
            candidate_id = candidate.id,
            root = %feed.root_canonical_url,
            "Candidate covered by known feed"
        );
        return Ok(Pick::Resolved {
            mutation: Mutation::Match {
                submission: candidate.submission(),
                feed_id: feed.id,
            },
            candidate,
        });
    }

    if !hosts.try_activate(&host) {
        return Err(SchedulerError::Invariant(format!(
            "picked candidate {} on host {host} which already has a probe in flight",
            candidate.id
        )));
    }

    Ok(Pick::Probe {
        candidate,
        url,
        host,
    })
}
