use url::Url;

/// Maps a URL string to its canonical identity by removing `scheme://` and a
/// leading `www.`.
///
/// This is a string transform, not a validity check: malformed input passes
/// through with only those prefixes removed. Stripping repeats until neither
/// prefix is present, so the result is a fixed point and
/// `canonicalize(&canonicalize(u)) == canonicalize(u)` holds for every input.
///
/// # Examples
///
/// ```
/// use feedprobe::util::canonicalize;
///
/// assert_eq!(canonicalize("https://www.example.com/feed"), "example.com/feed");
/// assert_eq!(canonicalize("example.com/feed"), "example.com/feed");
/// assert_eq!(canonicalize("not a url"), "not a url");
/// ```
pub fn canonicalize(url: &str) -> String {
    let mut rest = url;
    loop {
        let before = rest.len();
        if let Some(stripped) = strip_scheme(rest) {
            rest = stripped;
        }
        if let Some(stripped) = strip_www(rest) {
            rest = stripped;
        }
        if rest.len() == before {
            return rest.to_owned();
        }
    }
}

/// Returns the text after `scheme://` when `url` starts with a syntactically
/// valid scheme (RFC 3986: ALPHA *( ALPHA / DIGIT / "+" / "-" / "." )).
fn strip_scheme(url: &str) -> Option<&str> {
    let (scheme, rest) = url.split_once("://")?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    if !first.is_ascii_alphabetic() {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) {
        Some(rest)
    } else {
        None
    }
}

fn strip_www(url: &str) -> Option<&str> {
    match url.get(..4) {
        Some(prefix) if prefix.eq_ignore_ascii_case("www.") => Some(&url[4..]),
        _ => None,
    }
}

/// Returns true when a candidate with canonical URL `canonical` belongs to the
/// feed rooted at `root`.
///
/// Matching is a prefix match on whole path segments: `example.com/blog`
/// covers `example.com/blog` and `example.com/blog/post-1`, but not
/// `example.com/blogging`.
pub fn matches_root(canonical: &str, root: &str) -> bool {
    if root.is_empty() {
        return false;
    }
    match canonical.strip_prefix(root) {
        Some("") => true,
        Some(rest) => root.ends_with('/') || rest.starts_with(['/', '?', '#']),
        None => false,
    }
}

/// Host bucket key for a parsed URL: lowercase host with a leading `www.`
/// removed, so `www.example.com` and `example.com` share one bucket.
pub fn host_key(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    if host.is_empty() {
        return None;
    }
    match strip_www(&host) {
        Some(stripped) if !stripped.is_empty() => Some(stripped.to_owned()),
        _ => Some(host),
    }
}

/// Serializes a probe URL for storage as a feed root.
///
/// `url` always renders an empty http(s) path as `/`; roots drop that lone
/// slash so a bare-host root canonicalizes to `example.com`.
pub fn root_display(url: &Url) -> String {
    let s = url.as_str();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        s.strip_suffix('/').unwrap_or(s).to_owned()
    } else {
        s.to_owned()
    }
}
