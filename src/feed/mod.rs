//! Feed discovery for harvested URLs.
//!
//! - [`oracle`] - the contract consumed from a discovery engine: given a URL,
//!   classify it as a single feed, several feeds, unreachable, not a feed, ...
//! - [`prober`] - the URL-shrinking search that asks the oracle about
//!   successively shorter prefixes of a candidate to find its feed root
//! - [`discovery`] - the HTTP implementation of the oracle (reqwest + feed-rs)
//!
//! # Example
//!
//! ```ignore
//! use feedprobe::feed::{FeedProber, HttpOracle};
//!
//! let oracle = Arc::new(HttpOracle::from_config(&config)?);
//! let report = FeedProber::new(oracle).probe(&url).await;
//! if let Some(hit) = report.hit {
//!     println!("{} serves {}", hit.root_url, hit.feed_url);
//! }
//! ```

mod discovery;
mod oracle;
mod prober;

pub use discovery::{HttpOracle, OracleError};
pub use oracle::{DiscoveryOracle, DiscoveryResult, FoundFeed, Outcome};
pub use prober::{probe_points, FeedProber, ProbeHit, ProbeReport};
