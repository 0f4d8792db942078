//! Iterative URL-shrinking search for the most general URL exposing a feed.

use std::sync::Arc;
use url::Url;

use super::oracle::{DiscoveryOracle, DiscoveryResult, FoundFeed, Outcome};
use crate::storage::DiscardReason;

/// Best answer found by a probe run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeHit {
    pub feed_url: String,
    /// Most general probe point that yielded `feed_url`
    pub root_url: Url,
    pub title: Option<String>,
}

/// Everything a probe run learned about one candidate.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub hit: Option<ProbeHit>,
    /// Number of oracle calls made
    pub requests: usize,
    /// Oracle classification of the first probe point (the candidate itself)
    pub first_outcome: Option<Outcome>,
}

impl ProbeReport {
    /// Reason to record when the probe found nothing.
    pub fn discard_reason(&self) -> DiscardReason {
        match self.first_outcome {
            Some(Outcome::CouldNotReach) => DiscardReason::Unreachable,
            Some(Outcome::BadFeed) => DiscardReason::BadFeed,
            Some(Outcome::NotAUrl) => DiscardReason::InvalidUrl,
            _ => DiscardReason::FeedNotFound,
        }
    }
}

/// Successive URLs a probe visits, most specific first.
///
/// The first point is `url` without fragment and without trailing slashes.
/// Each following point drops the query string if there is one, otherwise the
/// last path segment. The final point is the bare scheme+host. For a path of
/// depth `d` this yields `d + 1` points, plus one when a query is present.
///
/// Empty path segments are dropped, so `/a//b/` is treated as `/a/b`.
pub fn probe_points(url: &Url) -> Vec<Url> {
    let mut base = url.clone();
    base.set_fragment(None);
    base.set_query(None);

    let Some(segments) = url.path_segments() else {
        // cannot-be-a-base URLs (mailto:, data:) have nothing to shrink
        return vec![base];
    };
    let mut segments: Vec<&str> = segments.filter(|s| !s.is_empty()).collect();
    let mut query = url.query().filter(|q| !q.is_empty());

    let mut points = Vec::with_capacity(segments.len() + 2);
    loop {
        let mut point = base.clone();
        point.set_path(&format!("/{}", segments.join("/")));
        point.set_query(query);
        points.push(point);

        if query.take().is_some() {
            continue;
        }
        if segments.pop().is_none() {
            break;
        }
    }
    points
}

/// True for feeds served from a `/blog/` or `/posts/` section, which lose to a
/// broader feed found at a shorter prefix.
fn is_section_feed(feed_url: &str) -> bool {
    let path = Url::parse(feed_url)
        .map(|u| u.path().to_owned())
        .unwrap_or_else(|_| feed_url.to_owned());
    path.contains("/blog/") || path.contains("/posts/")
}

/// Fold one productive probe point into the best answer so far.
fn choose(best: Option<ProbeHit>, found: FoundFeed, point: &Url) -> ProbeHit {
    let candidate = ProbeHit {
        feed_url: found.feed_url,
        root_url: point.clone(),
        title: found.title,
    };
    match best {
        None => candidate,
        Some(prev) if prev.feed_url == candidate.feed_url => ProbeHit {
            root_url: candidate.root_url,
            title: prev.title.or(candidate.title),
            ..prev
        },
        Some(prev) if is_section_feed(&prev.feed_url) && !is_section_feed(&candidate.feed_url) => {
            candidate
        }
        Some(prev) => prev,
    }
}

/// Runs the shrinking search against a [`DiscoveryOracle`].
#[derive(Clone)]
pub struct FeedProber {
    oracle: Arc<dyn DiscoveryOracle>,
}

impl std::fmt::Debug for FeedProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedProber").finish_non_exhaustive()
    }
}

impl FeedProber {
    pub fn new(oracle: Arc<dyn DiscoveryOracle>) -> Self {
        Self { oracle }
    }

    /// Probe `url` and every shorter prefix of it.
    ///
    /// Oracle classifications other than a single feed are data about that
    /// probe point and never abort the search.
    pub async fn probe(&self, url: &Url) -> ProbeReport {
        let mut best = None;
        let mut requests = 0;
        let mut first_outcome = None;

        for (i, point) in probe_points(url).iter().enumerate() {
            let result = self.oracle.discover(point, i > 0).await;
            requests += 1;

            let outcome = result.outcome();
            first_outcome.get_or_insert(outcome);
            tracing::debug!(url = %point, outcome = %outcome, "Probe point");

            if let DiscoveryResult::SingleFeed(found) = result {
                best = Some(choose(best, found, point));
            }
        }

        ProbeReport {
            hit: best,
            requests,
            first_outcome,
        }
    }
}
