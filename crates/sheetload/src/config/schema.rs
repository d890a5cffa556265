use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Builds a default configuration whose directories all live under `base`.
    pub fn with_base_dir<P: AsRef<Path>>(base: P) -> Self {
        let base = base.as_ref();
        Self {
            version: "1.0".to_string(),
            database: DatabaseConfig {
                path: base.join("data").join("sheetload.db"),
                ..DatabaseConfig::default()
            },
            processing: ProcessingConfig {
                pending_dir: base.join("pending"),
                processed_dir: base.join("processed"),
                ..ProcessingConfig::default()
            },
            queue: QueueConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Returns `~/.sheetload`, falling back to the working directory.
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".sheetload"))
        .unwrap_or_else(|| PathBuf::from(".sheetload"))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
    #[serde(default = "default_staging_schema")]
    pub staging_schema: String,
    #[serde(default = "default_target_table")]
    pub target_table: String,
    #[serde(default = "default_business_key")]
    pub business_key: String,
}

fn default_database_path() -> PathBuf {
    default_base_dir().join("data").join("sheetload.db")
}

fn default_staging_schema() -> String {
    "temp_processing".to_string()
}

fn default_target_table() -> String {
    "tracking_data".to_string()
}

fn default_business_key() -> String {
    "hawb".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            staging_schema: default_staging_schema(),
            target_table: default_target_table(),
            business_key: default_business_key(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default = "default_pending_dir")]
    pub pending_dir: PathBuf,
    #[serde(default = "default_processed_dir")]
    pub processed_dir: PathBuf,
    /// Location of the dedup index. Defaults to `processed_files.json`
    /// inside the processed directory.
    #[serde(default)]
    pub dedup_index: Option<PathBuf>,
    #[serde(default = "default_retention_days")]
    pub file_retention_days: u32,
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval_secs: u64,
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl ProcessingConfig {
    pub fn dedup_index_path(&self) -> PathBuf {
        self.dedup_index
            .clone()
            .unwrap_or_else(|| self.processed_dir.join("processed_files.json"))
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }
}

fn default_pending_dir() -> PathBuf {
    default_base_dir().join("pending")
}

fn default_processed_dir() -> PathBuf {
    default_base_dir().join("processed")
}

fn default_retention_days() -> u32 {
    30
}

fn default_schedule_interval() -> u64 {
    3600
}

fn default_extensions() -> Vec<String> {
    vec!["csv".to_string(), "tsv".to_string()]
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            pending_dir: default_pending_dir(),
            processed_dir: default_processed_dir(),
            dedup_index: None,
            file_retention_days: default_retention_days(),
            schedule_interval_secs: default_schedule_interval(),
            allowed_extensions: default_extensions(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// One backoff "time unit"; retry `n` waits `2^n` units.
    #[serde(default = "default_backoff_unit")]
    pub backoff_unit_ms: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl QueueConfig {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_unit() -> u64 {
    1000
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_shutdown_timeout() -> u64 {
    30
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_unit_ms: default_backoff_unit(),
            poll_interval_ms: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `sheetload=debug,info`.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}
