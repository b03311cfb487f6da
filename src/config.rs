//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::course::controller::Course;
use crate::error::{Result, TelemetryError};
use crate::network::ProbeSettings;
use crate::sync::SyncSettings;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub collector: CollectorConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    pub vehicle: VehicleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub courses: Vec<Course>,
}

/// Remote collector endpoints
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    pub url: String,

    /// Reachability check target; defaults to `url`
    #[serde(default)]
    pub probe_url: Option<String>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

/// Network state inference
#[derive(Debug, Deserialize, Clone)]
pub struct NetworkConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,

    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

/// Offline queue resynchronization
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_pause_ms")]
    pub batch_pause_ms: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

/// Capture loop and course lifecycle timing
#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    #[serde(default = "default_capture_interval_ms")]
    pub capture_interval_ms: u64,

    #[serde(default = "default_finish_grace_ms")]
    pub finish_grace_ms: u64,

    #[serde(default = "default_replay_file")]
    pub replay_file: String,
}

/// Local durable storage
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Vehicle identity
#[derive(Debug, Deserialize, Clone)]
pub struct VehicleConfig {
    pub number: String,

    /// Environment variable holding the bearer token
    #[serde(default = "default_credential_env")]
    pub credential_env: String,
}

/// Log output
#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Daily-rolling log files are written here when set
    #[serde(default)]
    pub log_dir: Option<String>,
}

// Default value functions
fn default_request_timeout_ms() -> u64 { 15000 }

fn default_failure_threshold() -> u32 { 3 }
fn default_probe_interval_ms() -> u64 { 60000 }
fn default_probe_timeout_ms() -> u64 { 5000 }

fn default_batch_size() -> usize { 50 }
fn default_batch_pause_ms() -> u64 { 1000 }
fn default_max_attempts() -> u32 { 3 }
fn default_check_interval_ms() -> u64 { 120000 }

fn default_capture_interval_ms() -> u64 { 10000 }
fn default_finish_grace_ms() -> u64 { 5000 }
fn default_replay_file() -> String { "./data/positions.jsonl".to_string() }

fn default_data_dir() -> String { "./data".to_string() }

fn default_credential_env() -> String { "COURSE_TELEMETRY_TOKEN".to_string() }

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_pause_ms: default_batch_pause_ms(),
            max_attempts: default_max_attempts(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            capture_interval_ms: default_capture_interval_ms(),
            finish_grace_ms: default_finish_grace_ms(),
            replay_file: default_replay_file(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

fn invalid(message: impl std::fmt::Display) -> TelemetryError {
    TelemetryError::Config(toml::de::Error::custom(message))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use course_telemetry::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration text
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("collector url", Some(&self.collector.url)),
            ("collector probe_url", self.collector.probe_url.as_ref()),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(invalid(format!("{} must be an http(s) URL", name)));
                }
            }
        }

        if self.vehicle.number.trim().is_empty() {
            return Err(invalid("vehicle number cannot be empty"));
        }

        if self.vehicle.credential_env.is_empty() {
            return Err(invalid("credential_env cannot be empty"));
        }

        if self.storage.data_dir.is_empty() {
            return Err(invalid("storage data_dir cannot be empty"));
        }

        // Validate timing fields
        for (name, value, max) in [
            ("request_timeout_ms", self.collector.request_timeout_ms, 60_000),
            ("probe_timeout_ms", self.network.probe_timeout_ms, 60_000),
            ("probe_interval_ms", self.network.probe_interval_ms, 3_600_000),
            ("check_interval_ms", self.sync.check_interval_ms, 3_600_000),
            ("capture_interval_ms", self.tracking.capture_interval_ms, 3_600_000),
        ] {
            if value == 0 || value > max {
                return Err(invalid(format!("{} must be between 1 and {}", name, max)));
            }
        }

        if self.sync.batch_pause_ms > 60_000 {
            return Err(invalid("batch_pause_ms must be at most 60000"));
        }

        if self.tracking.finish_grace_ms > 300_000 {
            return Err(invalid("finish_grace_ms must be at most 300000"));
        }

        if self.network.probe_timeout_ms >= self.network.probe_interval_ms {
            return Err(invalid("probe_timeout_ms must be shorter than probe_interval_ms"));
        }

        if self.network.failure_threshold == 0 {
            return Err(invalid("failure_threshold must be greater than 0"));
        }

        if self.sync.batch_size == 0 || self.sync.batch_size > 500 {
            return Err(invalid("batch_size must be between 1 and 500"));
        }

        if self.sync.max_attempts == 0 {
            return Err(invalid("max_attempts must be greater than 0"));
        }

        // Course ids are bridge keys and must be unique
        let mut seen = std::collections::HashSet::new();
        for course in &self.courses {
            if course.id.is_empty() || course.uit.is_empty() {
                return Err(invalid("course id and uit cannot be empty"));
            }
            if !seen.insert(course.id.as_str()) {
                return Err(invalid(format!("duplicate course id {}", course.id)));
            }
        }

        Ok(())
    }

    pub fn probe_url(&self) -> &str {
        self.collector.probe_url.as_deref().unwrap_or(&self.collector.url)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.collector.request_timeout_ms)
    }

    pub fn finish_grace(&self) -> Duration {
        Duration::from_millis(self.tracking.finish_grace_ms)
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_millis(self.tracking.capture_interval_ms)
    }

    pub fn probe_settings(&self) -> ProbeSettings {
        ProbeSettings {
            interval: Duration::from_millis(self.network.probe_interval_ms),
            timeout: Duration::from_millis(self.network.probe_timeout_ms),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            batch_size: self.sync.batch_size,
            batch_pause: Duration::from_millis(self.sync.batch_pause_ms),
            max_attempts: self.sync.max_attempts,
            check_interval: Duration::from_millis(self.sync.check_interval_ms),
        }
    }
}
