//! YAML configuration: parsed with serde, validated fail-fast before any
//! resource is opened.

use crate::resource::ResourceUrl;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_sync_wait() -> Duration {
    Duration::from_secs(5)
}

fn default_eol_separator() -> String {
    "\n".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// How often idle streams are re-polled for new data.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Upper bound on a single resource read.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Directory for persisted repositioning data. Without it every start
    /// is a cold start.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,

    #[serde(default)]
    pub sync: SyncConfig,

    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub enabled: bool,

    /// How long a silent source may block cross-source ordering.
    #[serde(with = "humantime_serde", default = "default_sync_wait")]
    pub wait_time: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            wait_time: default_sync_wait(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// `file://...` or `unix://...`.
    pub url: String,

    /// Records larger than this are reported and discarded, not parsed.
    pub max_record_length: usize,

    #[serde(default = "default_eol_separator")]
    pub eol_separator: String,

    /// Split on complete top-level JSON values instead of separators.
    #[serde(default)]
    pub json_format: bool,

    /// Delegate boundary detection to the parsing model. Mutually
    /// exclusive with `json_format`.
    #[serde(default)]
    pub xml_format: bool,

    /// Regex with named capture groups applied to each record.
    #[serde(default)]
    pub pattern: Option<String>,

    /// Capture group holding the record timestamp.
    #[serde(default)]
    pub timestamp_group: Option<String>,

    /// chrono format string, or `iso8601` / `epoch` / `epoch_ms`.
    #[serde(default)]
    pub timestamp_format: Option<String>,

    /// Match-tree paths checked for the timestamp, in order.
    #[serde(default)]
    pub timestamp_paths: Vec<String>,

    /// Stamp atoms with the wall clock instead of a parsed timestamp.
    #[serde(default)]
    pub use_real_time: bool,

    #[serde(default)]
    pub continuous_timestamp_missing_warning: bool,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sources.is_empty() {
            return Err(ConfigError::Invalid("no sources configured".to_string()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "chunk_size must be positive".to_string(),
            ));
        }
        for source in &self.sources {
            source.validate()?;
        }
        Ok(())
    }
}

impl SourceConfig {
    /// Match-tree paths consulted for the record timestamp. When none are
    /// configured, the timestamp group's own path is used, so naming a
    /// group is enough to get timestamped atoms.
    pub fn effective_timestamp_paths(&self) -> Vec<String> {
        if !self.timestamp_paths.is_empty() {
            return self.timestamp_paths.clone();
        }
        self.timestamp_group
            .iter()
            .map(|group| format!("/{group}"))
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        ResourceUrl::parse(&self.url)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.max_record_length == 0 {
            return Err(ConfigError::Invalid(format!(
                "source '{}': max_record_length must be positive",
                self.url
            )));
        }
        if self.eol_separator.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "source '{}': eol_separator must not be empty",
                self.url
            )));
        }
        if self.json_format && self.xml_format {
            return Err(ConfigError::Invalid(format!(
                "source '{}': json_format and xml_format are mutually exclusive",
                self.url
            )));
        }
        if self.timestamp_group.is_some() && self.pattern.is_none() {
            return Err(ConfigError::Invalid(format!(
                "source '{}': timestamp_group requires a pattern",
                self.url
            )));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: Config = serde_yaml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

/// Written by `config init`.
pub const DEFAULT_CONFIG: &str = "\
# logmill configuration
poll_interval: 1s
chunk_size: 65536
# state_dir: /var/lib/logmill

sync:
  enabled: false
  wait_time: 5s

sources:
  - url: file:///var/log/syslog
    max_record_length: 65536
    pattern: '^(?P<ts>\\w{3} [ \\d]\\d \\d{2}:\\d{2}:\\d{2}) (?P<host>\\S+) (?P<msg>.*)$'
    timestamp_group: ts
    timestamp_format: '%b %e %H:%M:%S'
    timestamp_paths: ['/ts']
";
