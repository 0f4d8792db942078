use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::oracle::{DiscoveryOracle, DiscoveryResult, FoundFeed};
use crate::config::Config;
use crate::util::validate_url;

/// Paths tried next to a candidate page that advertises no feed.
const WELL_KNOWN_FEED_PATHS: [&str; 3] = ["feed", "rss", "atom.xml"];

const MAX_REDIRECTS: usize = 5;

/// Redirect policy that runs [`validate_url`] on every hop, so a public page
/// cannot bounce the oracle onto a private address.
fn checked_redirects() -> reqwest::redirect::Policy {
    reqwest::redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            attempt.error("too many redirects")
        } else if let Err(e) = validate_url(attempt.url().as_str()) {
            attempt.error(e)
        } else {
            attempt.follow()
        }
    })
}

/// Transport-level failures while fetching one document. The oracle folds all
/// of them into [`DiscoveryResult::CouldNotReach`].
#[derive(Debug, Error)]
pub enum OracleError {
    /// HTTP request failed
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Request exceeded the configured timeout
    #[error("request timed out")]
    Timeout,
    /// Response body exceeded the configured size limit
    #[error("response too large")]
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ContentKind {
    Xml,
    Html,
    Unknown,
}

/// A fetched document
struct Fetched {
    final_url: Url,
    kind: ContentKind,
    bytes: Vec<u8>,
}

/// Discovery oracle backed by reqwest and feed-rs.
///
/// Recognises direct RSS/Atom documents and HTML pages advertising feeds via
/// `<link rel="alternate">`.
#[derive(Debug, Clone)]
pub struct HttpOracle {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
    /// Reject localhost/private targets before fetching
    validate: bool,
}

impl HttpOracle {
    pub fn new(client: reqwest::Client, timeout: Duration, max_bytes: usize) -> Self {
        Self {
            client,
            timeout,
            max_bytes,
            validate: true,
        }
    }

    /// Build the oracle and its HTTP client from configuration
    pub fn from_config(config: &Config) -> Result<Self, OracleError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .redirect(checked_redirects())
            .build()?;
        Ok(Self::new(
            client,
            Duration::from_secs(config.request_timeout_secs),
            config.max_response_bytes,
        ))
    }

    /// Fetch a URL with timeout and size limit
    async fn fetch(&self, url: &str) -> Result<Fetched, OracleError> {
        let response = tokio::time::timeout(self.timeout, self.client.get(url).send())
            .await
            .map_err(|_| OracleError::Timeout)??;

        let status = response.status();
        if !status.is_success() {
            return Err(OracleError::HttpStatus(status.as_u16()));
        }

        let final_url = response.url().clone();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_lowercase();

        let kind = content_kind(&content_type);

        let bytes = tokio::time::timeout(self.timeout, self.read_limited(response))
            .await
            .map_err(|_| OracleError::Timeout)??;

        Ok(Fetched {
            final_url,
            kind,
            bytes,
        })
    }

    /// Reads the response body, failing once it exceeds `max_bytes`.
    async fn read_limited(&self, response: reqwest::Response) -> Result<Vec<u8>, OracleError> {
        if let Some(len) = response.content_length() {
            if len > self.max_bytes as u64 {
                return Err(OracleError::TooLarge);
            }
        }

        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if bytes.len().saturating_add(chunk.len()) > self.max_bytes {
                return Err(OracleError::TooLarge);
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(bytes)
    }

    fn allowed(&self, url: &str) -> bool {
        !self.validate || validate_url(url).is_ok()
    }

    /// Classify a page that is not itself a feed
    async fn discover_from_html(&self, page: &Fetched, is_probe: bool) -> DiscoveryResult {
        let html = String::from_utf8_lossy(&page.bytes);
        let mut links = find_feed_links_in_html(&html, &page.final_url);
        links.retain(|link| self.allowed(link));

        match links.len() {
            0 if is_probe => DiscoveryResult::NoFeeds,
            0 => self.try_well_known(&page.final_url).await,
            1 => self.fetch_feed(&links[0], &page.final_url).await,
            _ => DiscoveryResult::MultipleFeeds(links),
        }
    }

    /// Fetch an advertised feed URL and parse it
    async fn fetch_feed(&self, feed_url: &str, page_url: &Url) -> DiscoveryResult {
        match self.fetch(feed_url).await {
            Ok(doc) => match parse_feed(&doc.bytes, feed_url, page_url) {
                Some(found) => DiscoveryResult::SingleFeed(found),
                None => DiscoveryResult::BadFeed,
            },
            Err(e) => {
                tracing::debug!(feed = %feed_url, error = %e, "Advertised feed unreachable");
                DiscoveryResult::CouldNotReach
            }
        }
    }

    async fn try_well_known(&self, page_url: &Url) -> DiscoveryResult {
        for path in WELL_KNOWN_FEED_PATHS {
            let Ok(guess) = page_url.join(path) else {
                continue;
            };
            if !self.allowed(guess.as_str()) {
                continue;
            }
            if let Ok(doc) = self.fetch(guess.as_str()).await {
                if doc.kind != ContentKind::Html {
                    if let Some(found) = parse_feed(&doc.bytes, guess.as_str(), page_url) {
                        return DiscoveryResult::SingleFeed(found);
                    }
                }
            }
        }
        DiscoveryResult::NoFeeds
    }

    /// Discovery without the up-front URL policy check
    async fn discover_unchecked(&self, url: &Url, is_probe: bool) -> DiscoveryResult {
        let page = match self.fetch(url.as_str()).await {
            Ok(page) => page,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Fetch failed");
                return DiscoveryResult::CouldNotReach;
            }
        };

        match page.kind {
            ContentKind::Xml => {
                match parse_feed(&page.bytes, url.as_str(), &page.final_url) {
                    Some(found) => DiscoveryResult::SingleFeed(found),
                    None => DiscoveryResult::BadFeed,
                }
            }
            ContentKind::Html => self.discover_from_html(&page, is_probe).await,
            // Ambiguous or missing Content-Type: try feed first, fallback to HTML scan
            ContentKind::Unknown => {
                match parse_feed(&page.bytes, url.as_str(), &page.final_url) {
                    Some(found) => DiscoveryResult::SingleFeed(found),
                    None => self.discover_from_html(&page, is_probe).await,
                }
            }
        }
    }
}

#[async_trait]
impl DiscoveryOracle for HttpOracle {
    async fn discover(&self, url: &Url, is_probe: bool) -> DiscoveryResult {
        if self.validate {
            if let Err(e) = validate_url(url.as_str()) {
                tracing::debug!(url = %url, error = %e, "Rejected URL");
                return DiscoveryResult::NotAUrl;
            }
        }
        self.discover_unchecked(url, is_probe).await
    }
}

/// Classifies a lowercased `Content-Type` header value.
fn content_kind(content_type: &str) -> ContentKind {
    if content_type.contains("application/rss+xml")
        || content_type.contains("application/atom+xml")
        || content_type.contains("application/feed+json")
        || content_type.contains("application/xml")
        || content_type.contains("text/xml")
    {
        ContentKind::Xml
    } else if content_type.contains("text/html") || content_type.contains("application/xhtml") {
        ContentKind::Html
    } else {
        ContentKind::Unknown
    }
}

/// Parses feed bytes with feed-rs; `None` if they are not RSS/Atom/JSON Feed.
fn parse_feed(bytes: &[u8], feed_url: &str, page_url: &Url) -> Option<FoundFeed> {
    let feed = feed_rs::parser::parse(bytes).ok()?;

    // Titles end up in terminal listings; drop control characters
    let title = feed
        .title
        .map(|t| t.content.chars().filter(|c| !c.is_control()).collect::<String>())
        .map(|t| t.trim().to_owned())
        .filter(|t| !t.is_empty());

    Some(FoundFeed {
        feed_url: feed_url.to_owned(),
        title,
        final_url: page_url.to_string(),
        content: String::from_utf8_lossy(bytes).into_owned(),
    })
}

/// Scans HTML for `<link>` tags with `rel="alternate"` and an RSS/Atom type.
///
/// Uses simple string scanning (no HTML parser dependency). Handles attribute
/// ordering variations and resolves relative URLs against the page URL.
/// Returns every distinct feed URL in document order.
fn find_feed_links_in_html(html: &str, base_url: &Url) -> Vec<String> {
    // ASCII lowercasing keeps byte offsets aligned with the original
    let html_lower = html.to_ascii_lowercase();
    let mut links: Vec<String> = Vec::new();
    let mut search_from = 0;

    while let Some(link_start) = html_lower[search_from..].find("<link") {
        let abs_start = search_from + link_start;
        let remaining = &html_lower[abs_start..];

        let tag_end = match remaining.find('>') {
            Some(pos) => pos,
            None => break,
        };

        let tag = &remaining[..=tag_end];

        if contains_attr(tag, "rel", "alternate") && is_feed_type(tag) {
            // Extract href from the original HTML to preserve URL case
            let original_tag = &html[abs_start..abs_start + tag_end + 1];
            if let Some(href) = extract_attr_value(original_tag, "href") {
                if let Ok(resolved) = base_url.join(href.trim()) {
                    let resolved = resolved.to_string();
                    if !links.contains(&resolved) {
                        links.push(resolved);
                    }
                }
            }
        }

        search_from = abs_start + tag_end + 1;
    }

    links
}

/// Checks if a lowercased tag contains an attribute with the given value.
fn contains_attr(tag: &str, attr_name: &str, attr_value: &str) -> bool {
    let pattern_double = format!("{attr_name}=\"{attr_value}\"");
    let pattern_single = format!("{attr_name}='{attr_value}'");
    tag.contains(&pattern_double) || tag.contains(&pattern_single)
}

/// Checks if a lowercased `<link>` tag has an RSS or Atom feed type.
fn is_feed_type(tag: &str) -> bool {
    tag.contains("application/rss+xml") || tag.contains("application/atom+xml")
}

/// Extracts the value of an attribute from a tag string (case-preserving).
fn extract_attr_value<'a>(tag: &'a str, attr_name: &str) -> Option<&'a str> {
    let tag_lower = tag.to_ascii_lowercase();
    let attr_prefix = format!("{attr_name}=");

    let attr_start = tag_lower.find(&attr_prefix)?;
    let value_start = attr_start + attr_prefix.len();

    let rest = tag.get(value_start..)?;
    let quote = *rest.as_bytes().first()?;

    if quote != b'"' && quote != b'\'' {
        return None;
    }

    let inner = &rest[1..];
    let end = inner.find(quote as char)?;

    Some(&inner[..end])
}
