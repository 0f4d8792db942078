use async_trait::async_trait;
use std::fmt;
use url::Url;

/// A feed the oracle found at (or advertised by) a probed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFeed {
    /// URL of the RSS/Atom document itself
    pub feed_url: String,
    /// Feed title, if the document carried one
    pub title: Option<String>,
    /// Page URL after redirects
    pub final_url: String,
    /// Raw feed document
    pub content: String,
}

/// What the discovery oracle reports for one URL.
///
/// Only [`DiscoveryResult::SingleFeed`] is productive; every other variant is a
/// classification of the probe point, not a failure of the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryResult {
    SingleFeed(FoundFeed),
    MultipleFeeds(Vec<String>),
    NotAUrl,
    CouldNotReach,
    NoFeeds,
    BadFeed,
}

impl DiscoveryResult {
    pub fn outcome(&self) -> Outcome {
        match self {
            DiscoveryResult::SingleFeed(_) => Outcome::SingleFeed,
            DiscoveryResult::MultipleFeeds(_) => Outcome::MultipleFeeds,
            DiscoveryResult::NotAUrl => Outcome::NotAUrl,
            DiscoveryResult::CouldNotReach => Outcome::CouldNotReach,
            DiscoveryResult::NoFeeds => Outcome::NoFeeds,
            DiscoveryResult::BadFeed => Outcome::BadFeed,
        }
    }
}

/// Payload-free tag of a [`DiscoveryResult`], for logging and disposition reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    SingleFeed,
    MultipleFeeds,
    NotAUrl,
    CouldNotReach,
    NoFeeds,
    BadFeed,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::SingleFeed => "single_feed",
            Outcome::MultipleFeeds => "multiple_feeds",
            Outcome::NotAUrl => "not_a_url",
            Outcome::CouldNotReach => "could_not_reach",
            Outcome::NoFeeds => "no_feeds",
            Outcome::BadFeed => "bad_feed",
        })
    }
}

/// The feed-discovery engine the prober consults.
///
/// `is_probe` is false for the candidate's own URL and true for the shorter
/// prefixes tried afterwards; implementations may do less work on probes.
#[async_trait]
pub trait DiscoveryOracle: Send + Sync {
    async fn discover(&self, url: &Url, is_probe: bool) -> DiscoveryResult;
}
