//! Configuration management for regtail
//!
//! Handles loading and validation of `regtail.toml`. Every section and field
//! has a default, so an empty file (or no file) is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::blocks::CompletionBoundary;
use crate::catchup::CatchUpConfig;
use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;
use crate::registry::HttpClientConfig;
use crate::synchronizer::SyncConfig;

/// Config file name looked up in the working directory and the user config
/// directory.
pub const CONFIG_FILE_NAME: &str = "regtail.toml";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    /// Replication source and engine tuning
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Progress persistence
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging
    #[serde(default)]
    pub logging: LogConfig,
}

/// Registry and engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Replication source base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Catch-up worker pool size and in-flight request cap
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Records per catch-up block
    #[serde(default = "default_block_size")]
    pub block_size: u64,

    /// Per-block and per-probe retry budget
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Scheduler ceiling per endpoint
    #[serde(default = "default_queries_per_second")]
    pub queries_per_second: u32,

    /// Connect and read timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Wait between empty live-tail polls in milliseconds
    #[serde(default = "default_tail_delay_ms")]
    pub tail_delay_ms: u64,

    /// When a block's progress counts as complete
    #[serde(default)]
    pub completion_boundary: CompletionBoundary,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            concurrency: default_concurrency(),
            block_size: default_block_size(),
            max_retries: default_max_retries(),
            queries_per_second: default_queries_per_second(),
            request_timeout_secs: default_request_timeout_secs(),
            tail_delay_ms: default_tail_delay_ms(),
            completion_boundary: CompletionBoundary::default(),
        }
    }
}

fn default_endpoint() -> String {
    "https://replicate.npmjs.com/registry".to_string()
}

fn default_concurrency() -> usize {
    8
}

fn default_block_size() -> u64 {
    10_000
}

fn default_max_retries() -> u32 {
    5
}

fn default_queries_per_second() -> u32 {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_tail_delay_ms() -> u64 {
    1_000
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database holding the checkpoint
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .map_or_else(|| PathBuf::from(".regtail"), |dir| dir.join("regtail"))
        .join("progress.db")
}

impl Config {
    /// Load from `./regtail.toml`, then the user config directory, falling
    /// back to defaults when neither exists.
    pub fn load() -> Result<Self> {
        for candidate in Self::search_paths() {
            if candidate.is_file() {
                return Self::load_from(&candidate);
            }
        }
        Ok(Self::default())
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("regtail").join(CONFIG_FILE_NAME));
        }
        paths
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let registry = &self.registry;
        if registry.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("registry.endpoint is empty".into()));
        }
        if !(registry.endpoint.starts_with("http://") || registry.endpoint.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "registry.endpoint must be an http(s) URL: {}",
                registry.endpoint
            )));
        }
        if registry.concurrency == 0 {
            return Err(ConfigError::Invalid("registry.concurrency must be positive".into()));
        }
        if registry.block_size == 0 {
            return Err(ConfigError::Invalid("registry.block_size must be positive".into()));
        }
        if registry.queries_per_second == 0 {
            return Err(ConfigError::Invalid(
                "registry.queries_per_second must be positive".into(),
            ));
        }
        if registry.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "registry.request_timeout_secs must be positive".into(),
            ));
        }
        if self.storage.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("storage.path is empty".into()));
        }
        Ok(())
    }

    /// Engine settings derived from this configuration.
    #[must_use]
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            catch_up: CatchUpConfig {
                block_size: self.registry.block_size,
                concurrency: self.registry.concurrency,
                max_retries: self.registry.max_retries,
            },
            queries_per_second: self.registry.queries_per_second,
            tail_delay: Duration::from_millis(self.registry.tail_delay_ms),
            ..SyncConfig::default()
        }
    }

    /// HTTP client settings derived from this configuration.
    #[must_use]
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.registry.request_timeout_secs),
            ..HttpClientConfig::new(self.registry.endpoint.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::logging::LogFormat;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.registry.concurrency, 8);
        assert_eq!(config.registry.completion_boundary, CompletionBoundary::RangeEnd);
        assert!(config.storage.path.ends_with("progress.db"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn partial_sections_merge_with_defaults() {
        let config = Config::from_toml(
            r#"
            [registry]
            endpoint = "http://localhost:5984/registry"
            block_size = 250
            completion_boundary = "range_end_minus_one"

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.registry.block_size, 250);
        assert_eq!(config.registry.max_retries, 5);
        assert_eq!(
            config.registry.completion_boundary,
            CompletionBoundary::RangeEndMinusOne
        );
        assert_eq!(config.logging.format, LogFormat::Json);

        let sync = config.sync_config();
        assert_eq!(sync.catch_up.block_size, 250);
        assert_eq!(sync.tail_delay, Duration::from_secs(1));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for text in [
            "[registry]\nconcurrency = 0",
            "[registry]\nblock_size = 0",
            "[registry]\nqueries_per_second = 0",
            "[registry]\nendpoint = \"ftp://mirror\"",
        ] {
            assert!(
                matches!(Config::from_toml(text), Err(Error::Config(ConfigError::Invalid(_)))),
                "accepted {text:?}"
            );
        }
    }

    #[test]
    fn syntax_errors_are_parse_errors() {
        assert!(matches!(
            Config::from_toml("[registry\nblock_size = 1"),
            Err(Error::Config(ConfigError::ParseError(_)))
        ));
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[storage]\npath = \"/tmp/regtail-test.db\"\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage.path, PathBuf::from("/tmp/regtail-test.db"));

        let missing = Config::load_from(&dir.path().join("nope.toml"));
        assert!(matches!(
            missing,
            Err(Error::Config(ConfigError::FileNotFound(_)))
        ));
    }
}
