//! Configuration file parser for ~/.config/podqueue/config.toml.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted by serde and logged as a warning.
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
}

// ============================================================================
// Configuration
// ============================================================================

pub const MIN_CONCURRENT_DOWNLOADS: usize = 1;
pub const MAX_CONCURRENT_DOWNLOADS: usize = 16;

/// Application configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where episode media is stored. `None` means `<config dir>/episodes`.
    pub download_dir: Option<PathBuf>,

    /// Only download on an unmetered connection.
    pub download_needs_wifi: bool,

    /// Parallel transfers, clamped to 1..=16.
    pub max_concurrent_downloads: usize,

    /// Per-request timeout for feed fetches.
    pub feed_timeout_secs: u64,

    pub user_agent: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: None,
            download_needs_wifi: true,
            max_concurrent_downloads: 3,
            feed_timeout_secs: 30,
            user_agent: concat!("podqueue/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 5] = [
        "download_dir",
        "download_needs_wifi",
        "max_concurrent_downloads",
        "feed_timeout_secs",
        "user_agent",
    ];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
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

        let mut config: Config = toml::from_str(&content)?;
        config.clamp();
        tracing::info!(
            path = %path.display(),
            needs_wifi = config.download_needs_wifi,
            max_concurrent = config.max_concurrent_downloads,
            "Loaded configuration"
        );
        Ok(config)
    }

    fn clamp(&mut self) {
        let clamped = self
            .max_concurrent_downloads
            .clamp(MIN_CONCURRENT_DOWNLOADS, MAX_CONCURRENT_DOWNLOADS);
        if clamped != self.max_concurrent_downloads {
            tracing::warn!(
                requested = self.max_concurrent_downloads,
                using = clamped,
                "max_concurrent_downloads out of range"
            );
            self.max_concurrent_downloads = clamped;
        }
    }

    /// Download directory, defaulting under the config directory.
    pub fn download_dir(&self, config_dir: &Path) -> PathBuf {
        self.download_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("episodes"))
    }
}

// ============================================================================
// Tests
// ============================================================================
