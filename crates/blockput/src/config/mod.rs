//! Configuration management for blockput.
//!
//! Configuration is an explicit value: load it once, then pass the pieces
//! that are needed to the uploader, store and client.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/blockput/config.toml` |
//! | macOS | `~/Library/Application Support/blockput/config.toml` |
//! | Windows | `%APPDATA%\blockput\config.toml` |
//!
//! ## Example
//!
//! ```toml
//! [upload]
//! chunk_size = 8          # units of 256 KiB
//! max_attempts = 5
//! retry_delay = "500ms"
//!
//! [resume]
//! expiry = "7d"
//!
//! [network]
//! up_host = "https://upload.qiniup.com"
//! request_timeout = "60s"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::control::DEFAULT_PAUSE_POLL_INTERVAL;
use crate::error::{Error, Result};
use crate::executor::{
    UploadOptions, UploadOptionsBuilder, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY,
    MAX_ATTEMPTS_LIMIT,
};
use crate::plan::ChunkSize;
use crate::resume::file::{FileResumeStore, DEFAULT_EXPIRY};

/// Default upload endpoint.
pub const DEFAULT_UP_HOST: &str = "https://upload.qiniup.com";

/// Main configuration struct for blockput.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upload executor settings
    pub upload: UploadConfig,
    /// Resume store settings
    pub resume: ResumeConfig,
    /// HTTP client settings
    pub network: NetworkConfig,
}

/// Upload executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Chunk size in units of 256 KiB (1, 2, 4, 8 or 16)
    pub chunk_size: ChunkSize,
    /// Attempts per wire call (1-20)
    pub max_attempts: u32,
    /// Delay between attempts of the same wire call
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
    /// Re-check interval while paused
    #[serde(with = "humantime_serde")]
    pub pause_poll_interval: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: ChunkSize::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            pause_poll_interval: DEFAULT_PAUSE_POLL_INTERVAL,
        }
    }
}

impl UploadConfig {
    /// Builder for [`UploadOptions`] seeded from these settings.
    ///
    /// Callbacks, the control handle and finalize parameters are per upload
    /// and are added on the returned builder.
    pub fn to_options(&self) -> UploadOptionsBuilder {
        UploadOptions::builder()
            .chunk_size(self.chunk_size)
            .max_attempts(self.max_attempts)
            .retry_delay(self.retry_delay)
            .pause_poll_interval(self.pause_poll_interval)
    }
}

/// Resume store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    /// Checkpoint directory (platform data directory if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    /// Age after which checkpoint files are removed by cleanup
    #[serde(with = "humantime_serde")]
    pub expiry: Duration,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            dir: None,
            expiry: DEFAULT_EXPIRY,
        }
    }
}

impl ResumeConfig {
    /// Directory checkpoint files are written to.
    pub fn resume_dir(&self) -> PathBuf {
        self.dir
            .clone()
            .unwrap_or_else(FileResumeStore::default_resume_dir)
    }

    /// Open the file-backed store and remove checkpoints older than `expiry`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open_store(&self) -> Result<FileResumeStore> {
        let store = FileResumeStore::with_dir(self.resume_dir()).await?;

        if let Err(e) = store.cleanup_older_than(self.expiry).await {
            tracing::warn!(error = %e, "Failed to clean up expired checkpoints");
        }

        Ok(store)
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Base URL of the upload service
    pub up_host: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// `User-Agent` header value
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            up_host: DEFAULT_UP_HOST.to_string(),
            request_timeout: crate::client::http::DEFAULT_REQUEST_TIMEOUT,
            user_agent: format!("blockput/{}", crate::VERSION),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read,
    /// parsed or validated.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }

        Self::load_from(&path)
    }

    /// Load and validate configuration from `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check that every value is within its allowed range.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.upload.max_attempts) {
            return Err(invalid(
                "upload.max_attempts",
                format!(
                    "must be between 1 and {MAX_ATTEMPTS_LIMIT}, got {}",
                    self.upload.max_attempts
                ),
            ));
        }
        if self.upload.pause_poll_interval.is_zero() {
            return Err(invalid(
                "upload.pause_poll_interval",
                "must be greater than zero".to_string(),
            ));
        }
        if self.resume.expiry.is_zero() {
            return Err(invalid("resume.expiry", "must be greater than zero".to_string()));
        }
        if self.network.up_host.trim().is_empty() {
            return Err(invalid("network.up_host", "must not be empty".to_string()));
        }
        if self.network.request_timeout.is_zero() {
            return Err(invalid(
                "network.request_timeout",
                "must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "blockput")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

fn invalid(key: &str, reason: String) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        reason,
    }
}

/// Durations as `"500ms"`, `"30s"`, `"5m"`, `"2h"` or `"7d"`.
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    const UNITS: [(&str, u64); 4] = [("d", 86_400), ("h", 3_600), ("m", 60), ("s", 1)];

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() != 0 || duration.is_zero() {
            return serializer.serialize_str(&format!("{}ms", duration.as_millis()));
        }

        let secs = duration.as_secs();
        let (suffix, scale) = UNITS
            .iter()
            .copied()
            .find(|(_, scale)| secs % scale == 0)
            .unwrap_or(("s", 1));
        serializer.serialize_str(&format!("{}{suffix}", secs / scale))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(s.trim()).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        let number = |digits: &str| {
            digits
                .trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };

        if let Some(millis) = s.strip_suffix("ms") {
            return number(millis).map(Duration::from_millis);
        }

        for (suffix, scale) in UNITS {
            if let Some(value) = s.strip_suffix(suffix) {
                let value = number(value)?;
                return value
                    .checked_mul(scale)
                    .map(Duration::from_secs)
                    .ok_or_else(|| format!("duration '{s}' is too large"));
            }
        }

        Err(format!(
            "invalid duration format '{s}' (expected e.g. 500ms, 30s, 5m, 2h, 7d)"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.upload.chunk_size, ChunkSize::Mib1);
        assert_eq!(config.upload.max_attempts, 5);
        assert_eq!(config.upload.retry_delay, Duration::from_millis(500));
        assert_eq!(config.resume.expiry, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(config.network.up_host, DEFAULT_UP_HOST);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.upload.chunk_size = ChunkSize::Mib4;
        original.upload.max_attempts = 12;
        original.upload.retry_delay = Duration::from_millis(250);
        original.resume.dir = Some(temp_dir.path().join("resume"));
        original.network.up_host = "http://127.0.0.1:9000".to_string();

        original.save_to(&config_path).expect("save");
        let loaded = Config::load_from(&config_path).expect("load");

        assert_eq!(loaded.upload.chunk_size, ChunkSize::Mib4);
        assert_eq!(loaded.upload.max_attempts, 12);
        assert_eq!(loaded.upload.retry_delay, Duration::from_millis(250));
        assert_eq!(loaded.resume.dir, original.resume.dir);
        assert_eq!(loaded.network.up_host, "http://127.0.0.1:9000");
    }

    #[test]
    fn test_config_serialization() {
        let toml_str = toml::to_string_pretty(&Config::default()).expect("serialize");

        assert!(toml_str.contains("[upload]"), "Should have [upload] section");
        assert!(toml_str.contains("[resume]"), "Should have [resume] section");
        assert!(toml_str.contains("[network]"), "Should have [network] section");
        assert!(toml_str.contains("chunk_size = 4"));
        assert!(toml_str.contains("retry_delay = \"500ms\""));
        assert!(toml_str.contains("expiry = \"7d\""));
        assert!(toml_str.contains("request_timeout = \"1m\""));
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[upload]
chunk_size = 16
retry_delay = "2s"

[network]
up_host = "https://up-z1.qiniup.com"
"#;

        let config: Config = toml::from_str(partial_toml).expect("parse partial config");

        assert_eq!(config.upload.chunk_size, ChunkSize::Mib4);
        assert_eq!(config.upload.retry_delay, Duration::from_secs(2));
        assert_eq!(config.upload.max_attempts, 5);
        assert_eq!(config.network.up_host, "https://up-z1.qiniup.com");
        assert_eq!(config.resume.expiry, DEFAULT_EXPIRY);
    }

    #[test]
    fn test_invalid_chunk_size_rejected() {
        let result: std::result::Result<Config, _> = toml::from_str("[upload]\nchunk_size = 3\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_ranges() {
        let mut config = Config::default();
        config.upload.max_attempts = 21;
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidConfig { ref key, .. }) if key == "upload.max_attempts"
        ));

        let mut config = Config::default();
        config.upload.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.up_host = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.network.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_rejects_invalid_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.toml");
        std::fs::write(&path, "[upload]\nmax_attempts = 50\n").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("config.toml"));
    }

    #[test]
    fn test_humantime_parse() {
        use humantime_serde::parse;

        assert_eq!(parse("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(parse("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(parse("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(parse("2h"), Ok(Duration::from_secs(7_200)));
        assert_eq!(parse("7d"), Ok(Duration::from_secs(604_800)));
        assert!(parse("soon").is_err());
        assert!(parse("5w").is_err());
        assert!(parse("ms").is_err());
    }

    #[test]
    fn test_to_options() {
        let mut config = UploadConfig::default();
        config.chunk_size = ChunkSize::Kib512;
        config.max_attempts = 3;

        let options = config.to_options().build().expect("valid options");
        assert_eq!(options.chunk_size(), ChunkSize::Kib512);
        assert_eq!(options.max_attempts(), 3);
        assert_eq!(options.retry_delay(), config.retry_delay);
    }

    #[tokio::test]
    async fn test_open_store_uses_configured_dir() {
        let temp_dir = TempDir::new().unwrap();
        let config = ResumeConfig {
            dir: Some(temp_dir.path().join("checkpoints")),
            ..ResumeConfig::default()
        };

        let store = config.open_store().await.expect("open store");
        assert_eq!(store.resume_dir(), temp_dir.path().join("checkpoints"));
        assert!(store.resume_dir().is_dir());
    }
}
