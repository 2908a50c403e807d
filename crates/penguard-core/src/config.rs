//! Runtime configuration for the sensor system.

use std::time::Duration;

use penguard_types::DeviceType;

use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::profile::{DeviceProfile, ProfileTable};

/// Configuration for [`SensorSystem`](crate::SensorSystem).
///
/// Unset values use the defaults below; [`validate`](Self::validate) rejects
/// zero values.
///
/// | Field | Default |
/// |-------|---------|
/// | `max_concurrent_connections` | 10 |
/// | `scan_interval` | 5 s |
/// | `max_buffer_size` | 1000 frames |
/// | `processing_interval` | 100 ms |
/// | `max_batch_size` | 50 frames |
/// | `event_capacity` | 256 events |
/// | `reset_delay` | 1 s |
/// | `power_on_delay` | 2 s |
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Upper bound on connected plus in-flight devices.
    pub max_concurrent_connections: usize,
    /// Period between discovery scans.
    pub scan_interval: Duration,
    /// Capacity of each per-device raw and processed buffer.
    pub max_buffer_size: usize,
    /// Period of the batch parsing job.
    pub processing_interval: Duration,
    /// Frames parsed per device per tick.
    pub max_batch_size: usize,
    /// Events buffered per subscriber.
    pub event_capacity: usize,
    /// Wait after tearing down a stale link before reconnecting.
    pub reset_delay: Duration,
    /// Wait after powering on the adapter.
    pub power_on_delay: Duration,
    /// Per-device-type protocol profiles.
    pub profiles: ProfileTable,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 10,
            scan_interval: Duration::from_millis(5000),
            max_buffer_size: 1000,
            processing_interval: Duration::from_millis(100),
            max_batch_size: 50,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            reset_delay: Duration::from_millis(1000),
            power_on_delay: Duration::from_millis(2000),
            profiles: ProfileTable::builtin(),
        }
    }
}

impl SystemConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection cap.
    pub fn max_concurrent_connections(mut self, max: usize) -> Self {
        self.max_concurrent_connections = max;
        self
    }

    /// Set the discovery scan period.
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Set the per-device buffer capacity.
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    /// Set the batch parsing period.
    pub fn processing_interval(mut self, interval: Duration) -> Self {
        self.processing_interval = interval;
        self
    }

    /// Set the batch size.
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set the event buffer capacity.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Set the stale link reset delay.
    pub fn reset_delay(mut self, delay: Duration) -> Self {
        self.reset_delay = delay;
        self
    }

    /// Set the power-on settle delay.
    pub fn power_on_delay(mut self, delay: Duration) -> Self {
        self.power_on_delay = delay;
        self
    }

    /// Replace the profile of one device type.
    pub fn profile(mut self, device_type: DeviceType, profile: DeviceProfile) -> Self {
        self.profiles = self.profiles.with_profile(device_type, profile);
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let positive_counts = [
            ("max_concurrent_connections", self.max_concurrent_connections),
            ("max_buffer_size", self.max_buffer_size),
            ("max_batch_size", self.max_batch_size),
            ("event_capacity", self.event_capacity),
        ];
        for (name, value) in positive_counts {
            if value == 0 {
                return Err(Error::invalid_config(format!("{name} must be > 0")));
            }
        }
        if self.scan_interval.is_zero() {
            return Err(Error::invalid_config("scan_interval must be > 0"));
        }
        if self.processing_interval.is_zero() {
            return Err(Error::invalid_config("processing_interval must be > 0"));
        }
        self.profiles.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SystemConfig::default();
        assert_eq!(config.max_concurrent_connections, 10);
        assert_eq!(config.scan_interval, Duration::from_secs(5));
        assert_eq!(config.max_buffer_size, 1000);
        assert_eq!(config.processing_interval, Duration::from_millis(100));
        assert_eq!(config.max_batch_size, 50);
        assert_eq!(config.reset_delay, Duration::from_secs(1));
        assert_eq!(config.power_on_delay, Duration::from_secs(2));
        assert!(config.profiles.get(DeviceType::PenguinDetector).is_some());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SystemConfig::new()
            .max_concurrent_connections(1)
            .scan_interval(Duration::from_millis(250))
            .max_batch_size(5)
            .reset_delay(Duration::ZERO);
        assert_eq!(config.max_concurrent_connections, 1);
        assert_eq!(config.scan_interval, Duration::from_millis(250));
        assert_eq!(config.max_batch_size, 5);
        // A zero reset delay is allowed.
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let err = SystemConfig::new()
            .max_concurrent_connections(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_connections"));

        assert!(SystemConfig::new().max_buffer_size(0).validate().is_err());
        assert!(
            SystemConfig::new()
                .scan_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(
            SystemConfig::new()
                .processing_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_validate_checks_profiles() {
        let profile = DeviceProfile::penguin_detector().with_keep_alive(Duration::ZERO, 3);
        let config = SystemConfig::new().profile(DeviceType::PenguinDetector, profile);
        assert!(config.validate().is_err());
    }
}
