//! Run configuration: directory layout, provider settings and pacing.
//!
//! Every section has defaults matching the layout under `~/stocks/`, so an
//! empty TOML file is a valid config.

use crate::data::alphavantage::{SeriesFunction, DEFAULT_BASE_URL};
use crate::data::circuit_breaker::QUOTA_WINDOW;
use crate::error::DataError;
use crate::listing::Exchange;
use crate::registry::TieBreak;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory; the other paths default to locations under it.
    pub root_dir: PathBuf,

    /// Directory holding `companylist_{exchange}.csv`. Defaults to `root_dir`.
    pub listing_dir: Option<PathBuf>,

    /// Per-symbol series cache. Defaults to `root_dir/symbols`.
    pub cache_dir: Option<PathBuf>,

    /// One-line file with the API key. Defaults to `root_dir/alpha_api_key`.
    pub api_key_file: Option<PathBuf>,

    pub provider: ProviderConfig,
    pub download: DownloadConfig,
    pub registry: RegistryConfig,
}

/// Remote API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub base_url: String,
    pub function: SeriesFunction,
    pub request_timeout_secs: u64,
}

/// Pacing and failure handling for the bulk downloader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum number of requests per day.
    pub daily_quota: u32,

    /// Pause after the provider returns an error payload.
    pub error_cooldown_secs: u64,

    /// Number of concurrent fetches. They share one rate limiter.
    pub concurrency: usize,

    /// Consecutive rejections before the batch stops. 0 disables.
    pub breaker_threshold: u32,
}

/// Which listings make up the registry and how duplicates are resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub exchanges: Vec<Exchange>,
    pub tie_break: TieBreak,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_root(default_root_dir())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            function: SeriesFunction::default(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            daily_quota: 500,
            error_cooldown_secs: 20,
            concurrency: 1,
            breaker_threshold: 10,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            exchanges: Exchange::ALL.to_vec(),
            tie_break: TieBreak::FirstSeen,
        }
    }
}

/// `~/stocks`, or `./stocks` when no home directory is known.
pub fn default_root_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stocks")
}

impl Config {
    /// Default config rooted at `root_dir`.
    pub fn with_root(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            listing_dir: None,
            cache_dir: None,
            api_key_file: None,
            provider: ProviderConfig::default(),
            download: DownloadConfig::default(),
            registry: RegistryConfig::default(),
        }
    }

    /// Load and validate a config from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, DataError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DataError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Parse and validate a config from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, DataError> {
        let config: Self =
            toml::from_str(content).map_err(|e| DataError::Config(format!("parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, DataError> {
        toml::to_string_pretty(self).map_err(|e| DataError::Config(format!("serialize: {e}")))
    }

    pub fn validate(&self) -> Result<(), DataError> {
        if self.download.daily_quota == 0 {
            return Err(DataError::Config("download.daily_quota must be > 0".into()));
        }
        if self.download.concurrency == 0 {
            return Err(DataError::Config("download.concurrency must be >= 1".into()));
        }
        if self.registry.exchanges.is_empty() {
            return Err(DataError::Config("registry.exchanges must not be empty".into()));
        }
        if self.provider.base_url.trim().is_empty() {
            return Err(DataError::Config("provider.base_url must not be empty".into()));
        }
        Ok(())
    }

    pub fn listing_dir(&self) -> PathBuf {
        self.listing_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.clone())
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.root_dir.join("symbols"))
    }

    pub fn api_key_file(&self) -> PathBuf {
        self.api_key_file
            .clone()
            .unwrap_or_else(|| self.root_dir.join("alpha_api_key"))
    }

    /// Where `registry --output` writes by default.
    pub fn registry_file(&self) -> PathBuf {
        self.root_dir.join("reduced_data.csv")
    }

    /// Minimum spacing between requests: one day divided by the quota.
    pub fn request_interval(&self) -> Duration {
        QUOTA_WINDOW / self.download.daily_quota.max(1)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.download.error_cooldown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.request_timeout_secs)
    }
}

/// Provider credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Read the key from the first line of `path`.
    pub fn from_file(path: &Path) -> Result<Self, DataError> {
        let content = std::fs::read_to_string(path).map_err(|e| DataError::ApiKey {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let key = content.lines().next().unwrap_or("").trim();
        if key.is_empty() {
            return Err(DataError::ApiKey {
                path: path.to_path_buf(),
                reason: "first line is empty".into(),
            });
        }
        Ok(Self(key.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(****)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_root_layout() {
        let config = Config::with_root("/data/stocks");
        assert_eq!(config.listing_dir(), PathBuf::from("/data/stocks"));
        assert_eq!(config.cache_dir(), PathBuf::from("/data/stocks/symbols"));
        assert_eq!(
            config.api_key_file(),
            PathBuf::from("/data/stocks/alpha_api_key")
        );
        assert_eq!(config.download.daily_quota, 500);
        assert_eq!(config.error_cooldown(), Duration::from_secs(20));
    }

    #[test]
    fn request_interval_spreads_quota_over_a_day() {
        let config = Config::with_root("/tmp");
        assert_eq!(config.request_interval(), Duration::from_millis(172_800));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
root_dir = "/srv/stocks"
cache_dir = "/var/cache/stocks"

[download]
daily_quota = 86400

[registry]
exchanges = ["nyse"]
"#,
        )
        .unwrap();

        assert_eq!(config.cache_dir(), PathBuf::from("/var/cache/stocks"));
        assert_eq!(config.request_interval(), Duration::from_secs(1));
        assert_eq!(config.download.error_cooldown_secs, 20);
        assert_eq!(config.registry.exchanges, vec![Exchange::Nyse]);
        assert_eq!(config.provider.function, SeriesFunction::WeeklyAdjusted);
    }

    #[test]
    fn zero_quota_is_rejected() {
        let err = Config::from_toml("[download]\ndaily_quota = 0\n").unwrap_err();
        assert!(err.to_string().contains("daily_quota"));
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::with_root("/srv/stocks");
        let text = config.to_toml().unwrap();
        assert_eq!(Config::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn api_key_reads_first_line_and_hides_itself() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha_api_key");
        std::fs::write(&path, "  SECRET123 \nignored\n").unwrap();

        let key = ApiKey::from_file(&path).unwrap();
        assert_eq!(key.expose(), "SECRET123");
        assert!(!format!("{key:?}").contains("SECRET"));
    }

    #[test]
    fn empty_api_key_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha_api_key");
        std::fs::write(&path, "\n").unwrap();
        assert!(ApiKey::from_file(&path).is_err());
    }
}
