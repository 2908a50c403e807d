//! Per-device-type protocol profiles.
//!
//! A profile describes how to talk to one kind of field device: the name it
//! advertises, the GATT services and characteristics to try (in order, first
//! match wins) and its link-maintenance parameters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use penguard_types::DeviceType;
use penguard_types::uuids::{BATTERY_LEVEL, BATTERY_SERVICE, DETECTOR_SERVICE, DETECTOR_SUMMARY};

use crate::error::{Error, Result};
use crate::reconnect::ReconnectPolicy;

/// Protocol and link parameters for one device type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Exact advertised name.
    pub name: String,
    /// Candidate primary services, tried in order.
    pub services: Vec<Uuid>,
    /// Candidate notify characteristics, tried in order.
    pub characteristics: Vec<Uuid>,
    /// Connection attempts allowed before blacklisting.
    pub max_reconnect_attempts: u32,
    /// Base delay for linear reconnect backoff.
    pub reconnect_delay: Duration,
    /// Period of keep-alive reads.
    pub keep_alive_interval: Duration,
    /// Consecutive failed keep-alive reads that end the link.
    pub max_missed_keep_alives: u32,
}

impl DeviceProfile {
    /// The penguin detector profile.
    pub fn penguin_detector() -> Self {
        Self {
            name: DeviceType::PenguinDetector.advertised_name().to_string(),
            services: vec![BATTERY_SERVICE, DETECTOR_SERVICE],
            characteristics: vec![BATTERY_LEVEL, DETECTOR_SUMMARY],
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(5000),
            keep_alive_interval: Duration::from_millis(2000),
            max_missed_keep_alives: 3,
        }
    }

    /// The built-in profile for a device type, if one ships with this crate.
    pub fn builtin(device_type: DeviceType) -> Option<Self> {
        match device_type {
            DeviceType::PenguinDetector => Some(Self::penguin_detector()),
            _ => None,
        }
    }

    /// Set the reconnect parameters.
    pub fn with_reconnect(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_delay = delay;
        self
    }

    /// Set the keep-alive parameters.
    pub fn with_keep_alive(mut self, interval: Duration, max_missed: u32) -> Self {
        self.keep_alive_interval = interval;
        self.max_missed_keep_alives = max_missed;
        self
    }

    /// The reconnect policy derived from this profile.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new()
            .max_attempts(self.max_reconnect_attempts)
            .base_delay(self.reconnect_delay)
    }

    /// Validate the profile.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_config("profile name must not be empty"));
        }
        if self.services.is_empty() {
            return Err(Error::invalid_config(format!(
                "profile '{}' lists no services",
                self.name
            )));
        }
        if self.characteristics.is_empty() {
            return Err(Error::invalid_config(format!(
                "profile '{}' lists no characteristics",
                self.name
            )));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(Error::invalid_config("keep_alive_interval must be > 0"));
        }
        if self.max_missed_keep_alives == 0 {
            return Err(Error::invalid_config("max_missed_keep_alives must be > 0"));
        }
        self.reconnect_policy().validate()
    }
}

/// Immutable lookup from device type to profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileTable {
    profiles: BTreeMap<DeviceType, Arc<DeviceProfile>>,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileTable {
    /// A table with the built-in profile of every known device type.
    pub fn builtin() -> Self {
        let profiles = DeviceType::ALL
            .into_iter()
            .filter_map(|device_type| {
                DeviceProfile::builtin(device_type).map(|profile| (device_type, Arc::new(profile)))
            })
            .collect();
        Self { profiles }
    }

    /// Replace the profile of a device type.
    pub fn with_profile(mut self, device_type: DeviceType, profile: DeviceProfile) -> Self {
        self.profiles.insert(device_type, Arc::new(profile));
        self
    }

    /// The profile for a device type.
    pub fn get(&self, device_type: DeviceType) -> Option<&Arc<DeviceProfile>> {
        self.profiles.get(&device_type)
    }

    /// Match an advertised name against the table.
    pub fn match_name(&self, name: &str) -> Option<(DeviceType, Arc<DeviceProfile>)> {
        self.profiles
            .iter()
            .find(|(_, profile)| profile.name == name)
            .map(|(device_type, profile)| (*device_type, Arc::clone(profile)))
    }

    /// Iterate profiles in device type order.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceType, &DeviceProfile)> {
        self.profiles
            .iter()
            .map(|(device_type, profile)| (*device_type, profile.as_ref()))
    }

    /// Validate every profile.
    pub fn validate(&self) -> Result<()> {
        self.profiles.values().try_for_each(|profile| profile.validate())
    }
}
