//! Candidate import from plain-text URL lists.
//!
//! One candidate per line: `url[<TAB>score[<TAB>submitted_at]]`, where
//! `submitted_at` is unix seconds or an RFC 3339 timestamp. Blank lines and
//! lines starting with `#` are ignored.
use chrono::DateTime;
use std::path::Path;
use thiserror::Error;

use crate::storage::NewCandidate;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Failed to read import file: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: invalid score '{value}'")]
    Score { line: usize, value: String },

    #[error("line {line}: invalid timestamp '{value}' (expected unix seconds or RFC 3339)")]
    Timestamp { line: usize, value: String },
}

/// Parse one line. Returns `Ok(None)` for blank lines and comments.
pub fn parse_line(
    line_no: usize,
    line: &str,
    source: Option<&str>,
) -> Result<Option<NewCandidate>, ImportError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }

    let mut fields = line.split('\t').map(str::trim);
    let url = fields.next().unwrap_or_default();
    if url.is_empty() {
        return Ok(None);
    }

    let score = match fields.next().filter(|s| !s.is_empty()) {
        Some(value) => Some(value.parse::<i64>().map_err(|_| ImportError::Score {
            line: line_no,
            value: value.to_owned(),
        })?),
        None => None,
    };

    let submitted_at = match fields.next().filter(|s| !s.is_empty()) {
        Some(value) => Some(parse_timestamp(value).ok_or_else(|| ImportError::Timestamp {
            line: line_no,
            value: value.to_owned(),
        })?),
        None => None,
    };

    Ok(Some(NewCandidate {
        url: url.to_owned(),
        score,
        submitted_at,
        source: source.map(str::to_owned),
    }))
}

fn parse_timestamp(value: &str) -> Option<i64> {
    value.parse::<i64>().ok().or_else(|| {
        DateTime::parse_from_rfc3339(value)
            .ok()
            .map(|dt| dt.timestamp())
    })
}

/// Parse a whole document; line numbers in errors are 1-based.
pub fn parse_candidates(content: &str, source: Option<&str>) -> Result<Vec<NewCandidate>, ImportError> {
    let mut candidates = Vec::new();
    for (i, line) in content.lines().enumerate() {
        if let Some(candidate) = parse_line(i + 1, line, source)? {
            candidates.push(candidate);
        }
    }
    Ok(candidates)
}

/// Read and parse an import file.
pub fn read_candidates(path: &Path, source: Option<&str>) -> Result<Vec<NewCandidate>, ImportError> {
    let content = std::fs::read_to_string(path)?;
    let candidates = parse_candidates(&content, source)?;
    tracing::debug!(path = %path.display(), count = candidates.len(), "Parsed import file");
    Ok(candidates)
}
