//! Service configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use penguard_core::{DeviceProfile, SystemConfig};
use penguard_types::DeviceType;

/// Service configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// System-wide settings.
    pub system: SystemSection,
    /// Per-device-type profile overrides, keyed by type (e.g. `penguin_detector`).
    pub profiles: BTreeMap<String, ProfileOverrides>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - Counts and intervals in `[system]` are non-zero
    /// - Every `[profiles.*]` key names a known device type
    /// - Profile overrides are non-zero
    ///
    /// # Example
    ///
    /// ```
    /// use penguard_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.system.validate();

        for (key, overrides) in &self.profiles {
            let prefix = format!("profiles.{}", key);
            if device_type_for_key(key).is_none() {
                errors.push(ValidationError {
                    field: prefix.clone(),
                    message: format!("unknown device type '{}'", key),
                });
            }
            errors.extend(overrides.validate(&prefix));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Build the core system configuration.
    ///
    /// Overrides for unknown device types are skipped; run [`Config::validate`]
    /// first to reject them.
    pub fn to_system_config(&self) -> SystemConfig {
        let section = &self.system;
        let mut config = SystemConfig::new()
            .max_concurrent_connections(section.max_concurrent_connections)
            .scan_interval(Duration::from_millis(section.scan_interval_ms))
            .max_buffer_size(section.max_buffer_size)
            .processing_interval(Duration::from_millis(section.processing_interval_ms))
            .max_batch_size(section.max_batch_size)
            .event_capacity(section.event_capacity)
            .reset_delay(Duration::from_millis(section.reset_delay_ms))
            .power_on_delay(Duration::from_millis(section.power_on_delay_ms));

        for (key, overrides) in &self.profiles {
            let Some(device_type) = device_type_for_key(key) else {
                continue;
            };
            let Some(base) = DeviceProfile::builtin(device_type) else {
                continue;
            };
            config = config.profile(device_type, overrides.apply(base));
        }

        config
    }
}

fn device_type_for_key(key: &str) -> Option<DeviceType> {
    DeviceType::ALL
        .into_iter()
        .find(|device_type| device_type.config_key() == key)
}

/// The `[system]` section. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemSection {
    /// Upper bound on connected plus in-flight devices.
    pub max_concurrent_connections: usize,
    /// Period between discovery scans.
    pub scan_interval_ms: u64,
    /// Per-device buffer capacity.
    pub max_buffer_size: usize,
    /// Period of the batch parsing job.
    pub processing_interval_ms: u64,
    /// Frames parsed per device per tick.
    pub max_batch_size: usize,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
    /// Wait after tearing down a stale link.
    pub reset_delay_ms: u64,
    /// Wait after powering on the adapter.
    pub power_on_delay_ms: u64,
}

impl Default for SystemSection {
    fn default() -> Self {
        let defaults = SystemConfig::default();
        Self {
            max_concurrent_connections: defaults.max_concurrent_connections,
            scan_interval_ms: defaults.scan_interval.as_millis() as u64,
            max_buffer_size: defaults.max_buffer_size,
            processing_interval_ms: defaults.processing_interval.as_millis() as u64,
            max_batch_size: defaults.max_batch_size,
            event_capacity: defaults.event_capacity,
            reset_delay_ms: defaults.reset_delay.as_millis() as u64,
            power_on_delay_ms: defaults.power_on_delay.as_millis() as u64,
        }
    }
}

impl SystemSection {
    /// Validate the system section.
    pub fn validate(&self) -> Vec<ValidationError> {
        let checks = [
            ("max_concurrent_connections", self.max_concurrent_connections as u64),
            ("scan_interval_ms", self.scan_interval_ms),
            ("max_buffer_size", self.max_buffer_size as u64),
            ("processing_interval_ms", self.processing_interval_ms),
            ("max_batch_size", self.max_batch_size as u64),
            ("event_capacity", self.event_capacity as u64),
        ];

        checks
            .into_iter()
            .filter(|(_, value)| *value == 0)
            .map(|(field, _)| ValidationError {
                field: format!("system.{}", field),
                message: "must be greater than 0".to_string(),
            })
            .collect()
    }
}

/// Optional overrides for one device profile. Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileOverrides {
    /// Connection attempts allowed before blacklisting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    /// Base delay for linear reconnect backoff.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_delay_ms: Option<u64>,
    /// Period of keep-alive reads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_interval_ms: Option<u64>,
    /// Failed keep-alive reads that end the link.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_missed_keep_alives: Option<u32>,
}

impl ProfileOverrides {
    /// Validate the overrides.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let checks = [
            ("max_reconnect_attempts", self.max_reconnect_attempts.map(u64::from)),
            ("keep_alive_interval_ms", self.keep_alive_interval_ms),
            ("max_missed_keep_alives", self.max_missed_keep_alives.map(u64::from)),
        ];

        checks
            .into_iter()
            .filter(|(_, value)| *value == Some(0))
            .map(|(field, _)| ValidationError {
                field: format!("{}.{}", prefix, field),
                message: "must be greater than 0".to_string(),
            })
            .collect()
    }

    /// Apply the overrides to a base profile.
    pub fn apply(&self, base: DeviceProfile) -> DeviceProfile {
        let max_attempts = self
            .max_reconnect_attempts
            .unwrap_or(base.max_reconnect_attempts);
        let delay = self
            .reconnect_delay_ms
            .map_or(base.reconnect_delay, Duration::from_millis);
        let interval = self
            .keep_alive_interval_ms
            .map_or(base.keep_alive_interval, Duration::from_millis);
        let max_missed = self
            .max_missed_keep_alives
            .unwrap_or(base.max_missed_keep_alives);

        base.with_reconnect(max_attempts, delay)
            .with_keep_alive(interval, max_missed)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `system.scan_interval_ms`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("penguard")
        .join("penguard.toml")
}
