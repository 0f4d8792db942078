//! Configuration file parser for ~/.config/feedprobe/config.toml.
//!
//! The config file is optional: a missing file yields `Config::default()`.
//! Unknown keys are ignored by serde, though we log a warning for each so
//! typos do not pass silently.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database path. `None` means `<config dir>/feedprobe.db`.
    pub database_path: Option<PathBuf>,

    /// Number of concurrent probe workers.
    pub workers: usize,

    /// Attempts per commit before a busy database aborts the run.
    pub commit_attempts: u32,

    /// Fixed sleep between commit attempts, in milliseconds.
    pub commit_backoff_ms: u64,

    /// Per-request timeout for the HTTP oracle, in seconds.
    pub request_timeout_secs: u64,

    /// Largest response body the HTTP oracle will read.
    pub max_response_bytes: usize,

    /// User-Agent header sent with every request.
    pub user_agent: String,

    /// Hosts whose candidates are discarded without probing. Subdomains match too.
    pub skip_hosts: Vec<String>,

    /// Print a progress line after each processed candidate.
    pub progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: None,
            workers: 32,
            commit_attempts: 3,
            commit_backoff_ms: 1000,
            request_timeout_secs: 10,
            max_response_bytes: 5 * 1024 * 1024,
            user_agent: format!("feedprobe/{}", env!("CARGO_PKG_VERSION")),
            skip_hosts: [
                "youtube.com",
                "youtu.be",
                "twitter.com",
                "x.com",
                "github.com",
                "reddit.com",
                "news.ycombinator.com",
                "wikipedia.org",
                "google.com",
                "amazon.com",
            ]
            .iter()
            .map(|h| h.to_string())
            .collect(),
            progress: true,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 9] = [
        "database_path",
        "workers",
        "commit_attempts",
        "commit_backoff_ms",
        "request_timeout_secs",
        "max_response_bytes",
        "user_agent",
        "skip_hosts",
        "progress",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Zero workers or zero commit attempts → `Err(ConfigError::Invalid)`
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Deleted between metadata and read
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        tracing::info!(
            path = %path.display(),
            workers = config.workers,
            skip_hosts = config.skip_hosts.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".into()));
        }
        if self.commit_attempts == 0 {
            return Err(ConfigError::Invalid(
                "commit_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
