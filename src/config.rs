//! Configuration Module
//!
//! Handles configuration loading from YAML files and environment variables.

use crate::access_gate::MAX_CONCURRENT_READERS;
use crate::cache_policy::EvictionAlgorithm;
use crate::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<PathBuf>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(|s| expand_tilde(&s)))
    }

    pub(super) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        s.map(|s| parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        // Find where the number ends and the unit begins
        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let secs = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" | "" => value,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600.0,
            "ms" | "millis" | "millisecond" | "milliseconds" => value / 1000.0,
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        let duration = Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("Duration '{}' out of range: {}", s, e))?;

        Ok(duration)
    }
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content)?;

        info!("Configuration loaded from file: {:?}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.cache.apply_env_overrides();
        self.logging.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<()> {
        self.cache.validate()
    }
}

/// Cache engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(
        default = "default_cache_dir",
        deserialize_with = "pathbuf_serde::deserialize"
    )]
    pub cache_dir: PathBuf,
    #[serde(default = "default_data_file")]
    pub data_file: String,
    #[serde(default = "default_index_file")]
    pub index_file: String,
    /// Memory tier budget in bytes (default: 512 MiB)
    #[serde(default = "default_max_memory_size")]
    pub max_memory_size: u64,
    /// Disk tier budget in bytes (default: 1 GiB)
    #[serde(default = "default_max_disk_size")]
    pub max_disk_size: u64,
    #[serde(default)]
    pub eviction_algorithm: EvictionAlgorithm,
    /// Readers allowed inside the table at once. Valid range: 1-1024
    #[serde(default = "default_max_concurrent_readers")]
    pub max_concurrent_readers: usize,
    /// Upper bound on waiting for exclusive access in `set`/`clear`.
    /// Unset means wait indefinitely.
    #[serde(default, deserialize_with = "duration_serde::deserialize_option")]
    pub write_gate_timeout: Option<Duration>,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache")
}

fn default_data_file() -> String {
    "cache.bin".to_string()
}

fn default_index_file() -> String {
    "cache.index".to_string()
}

fn default_max_memory_size() -> u64 {
    512 * 1024 * 1024
}

fn default_max_disk_size() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_concurrent_readers() -> usize {
    MAX_CONCURRENT_READERS
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            data_file: default_data_file(),
            index_file: default_index_file(),
            max_memory_size: default_max_memory_size(),
            max_disk_size: default_max_disk_size(),
            eviction_algorithm: EvictionAlgorithm::default(),
            max_concurrent_readers: default_max_concurrent_readers(),
            write_gate_timeout: None,
        }
    }
}

impl CacheConfig {
    pub fn data_path(&self) -> PathBuf {
        self.cache_dir.join(&self.data_file)
    }

    pub fn index_path(&self) -> PathBuf {
        self.cache_dir.join(&self.index_file)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(cache_dir) = std::env::var("CACHE_DIR") {
            self.cache_dir = pathbuf_serde::expand_tilde(&cache_dir);
        }

        if let Ok(size) = std::env::var("CACHE_MAX_MEMORY_SIZE") {
            match size.parse() {
                Ok(size) => self.max_memory_size = size,
                Err(_) => warn!("Ignoring invalid CACHE_MAX_MEMORY_SIZE: {}", size),
            }
        }

        if let Ok(size) = std::env::var("CACHE_MAX_DISK_SIZE") {
            match size.parse() {
                Ok(size) => self.max_disk_size = size,
                Err(_) => warn!("Ignoring invalid CACHE_MAX_DISK_SIZE: {}", size),
            }
        }

        if let Ok(name) = std::env::var("CACHE_EVICTION_ALGORITHM") {
            match EvictionAlgorithm::parse(&name) {
                Some(algorithm) => self.eviction_algorithm = algorithm,
                None => warn!("Ignoring unknown CACHE_EVICTION_ALGORITHM: {}", name),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_memory_size == 0 {
            return Err(CacheError::ConfigError(
                "max_memory_size must be greater than 0".to_string(),
            ));
        }

        if self.max_disk_size == 0 {
            return Err(CacheError::ConfigError(
                "max_disk_size must be greater than 0".to_string(),
            ));
        }

        if !(1..=1024).contains(&self.max_concurrent_readers) {
            return Err(CacheError::ConfigError(format!(
                "max_concurrent_readers must be between 1 and 1024, got {}",
                self.max_concurrent_readers
            )));
        }

        if self.data_file.trim().is_empty() || self.index_file.trim().is_empty() {
            return Err(CacheError::ConfigError(
                "data_file and index_file must not be empty".to_string(),
            ));
        }

        if self.data_file == self.index_file {
            return Err(CacheError::ConfigError(format!(
                "data_file and index_file must differ, both are {}",
                self.data_file
            )));
        }

        if self.write_gate_timeout == Some(Duration::ZERO) {
            return Err(CacheError::ConfigError(
                "write_gate_timeout must be greater than 0 when set".to_string(),
            ));
        }

        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for daily rolling log files; console only when unset
    #[serde(default, deserialize_with = "pathbuf_serde::deserialize_option")]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    pub fn apply_env_overrides(&mut self) {
        if let Ok(log_level) = std::env::var("LOG_LEVEL") {
            self.log_level = log_level;
        }

        if let Ok(log_dir) = std::env::var("LOG_DIR") {
            self.log_dir = Some(pathbuf_serde::expand_tilde(&log_dir));
        }
    }
}
