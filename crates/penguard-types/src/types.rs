//! Core types for penguard sensor data.

use core::fmt;

use bytes::Bytes;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Type of field device.
///
/// The type decides which protocol profile (services, characteristics and
/// link-maintenance parameters) is used when talking to the device.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new device types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum DeviceType {
    /// Acoustic penguin call detector.
    PenguinDetector,
}

impl DeviceType {
    /// All known device types.
    pub const ALL: [DeviceType; 1] = [DeviceType::PenguinDetector];

    /// Resolve a device type from its advertised name.
    ///
    /// Field devices advertise a fixed name per firmware build, so the match
    /// is exact and case-sensitive.
    ///
    /// # Examples
    ///
    /// ```
    /// use penguard_types::DeviceType;
    ///
    /// assert_eq!(DeviceType::from_name("PenguinDetector"), Some(DeviceType::PenguinDetector));
    /// assert_eq!(DeviceType::from_name("penguindetector"), None);
    /// assert_eq!(DeviceType::from_name("Speaker"), None);
    /// ```
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|device_type| device_type.advertised_name() == name)
    }

    /// The name the device advertises over BLE.
    #[must_use]
    pub fn advertised_name(&self) -> &'static str {
        match self {
            DeviceType::PenguinDetector => "PenguinDetector",
        }
    }

    /// Stable key used in configuration files.
    #[must_use]
    pub fn config_key(&self) -> &'static str {
        match self {
            DeviceType::PenguinDetector => "penguin_detector",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.advertised_name())
    }
}

/// Lifecycle state of a managed device.
///
/// ```text
/// Disconnected -> Discovering -> Connecting -> Handshaking -> Connected
///                      |              |             |
///                      v              v             v
///                    Queued         Error         Error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DeviceState {
    /// No link and no attempt in progress.
    Disconnected,
    /// Registered by a scan, not yet scheduled.
    Discovering,
    /// Waiting for a free connection slot.
    Queued,
    /// Transport-level connection in progress.
    Connecting,
    /// Resolving services and characteristics.
    Handshaking,
    /// Link up, notifications and keep-alive running.
    Connected,
    /// The last connection attempt failed.
    Error,
}

impl DeviceState {
    /// All states, in lifecycle order.
    pub const ALL: [DeviceState; 7] = [
        DeviceState::Disconnected,
        DeviceState::Discovering,
        DeviceState::Queued,
        DeviceState::Connecting,
        DeviceState::Handshaking,
        DeviceState::Connected,
        DeviceState::Error,
    ];

    /// Whether a connection attempt is running in this state.
    #[must_use]
    pub fn is_connecting(&self) -> bool {
        matches!(self, DeviceState::Connecting | DeviceState::Handshaking)
    }

    /// Lowercase name of the state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Disconnected => "disconnected",
            DeviceState::Discovering => "discovering",
            DeviceState::Queued => "queued",
            DeviceState::Connecting => "connecting",
            DeviceState::Handshaking => "handshaking",
            DeviceState::Connected => "connected",
            DeviceState::Error => "error",
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Link quality derived from consecutive missed keep-alives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionHealth {
    /// No missed keep-alives.
    Good,
    /// One missed keep-alive.
    Warning,
    /// Two or more missed keep-alives.
    Critical,
}

impl ConnectionHealth {
    /// Classify a missed keep-alive count.
    #[must_use]
    pub fn from_missed(missed: u32) -> Self {
        match missed {
            0 => ConnectionHealth::Good,
            1 => ConnectionHealth::Warning,
            _ => ConnectionHealth::Critical,
        }
    }
}

/// A raw notification payload waiting to be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct RawFrame {
    /// When the payload was received.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Payload bytes as delivered by the characteristic.
    pub data: Bytes,
    /// Whether a batch job has already consumed this frame.
    pub processed: bool,
}

impl RawFrame {
    /// Create an unprocessed frame.
    pub fn new(timestamp: OffsetDateTime, data: Bytes) -> Self {
        Self {
            timestamp,
            data,
            processed: false,
        }
    }

    /// The payload decoded as text (invalid UTF-8 is replaced).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Values extracted from one summary line.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct AcousticSummary {
    /// Summed amplitude over the analysis window.
    pub amplitude: f64,
    /// Dominant frequency in Hz.
    pub frequency: f64,
    /// Whether the device flagged a positive detection.
    pub detection: bool,
}

/// Result of parsing one raw frame.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(untagged))]
pub enum ReadingOutcome {
    /// The frame parsed into a summary.
    Summary(AcousticSummary),
    /// The frame was malformed.
    Error {
        /// Why the frame was rejected.
        error: String,
    },
}

/// A parsed reading, kept per device in a rolling history.
///
/// Malformed frames are kept as error readings with the raw text so they can
/// be inspected later.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProcessedReading {
    /// Receive time of the underlying raw frame.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Parsed values or the parse error.
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub outcome: ReadingOutcome,
    /// The frame text as received.
    pub raw: String,
}

impl ProcessedReading {
    /// The parsed summary, if the frame was well formed.
    pub fn summary(&self) -> Option<&AcousticSummary> {
        match &self.outcome {
            ReadingOutcome::Summary(summary) => Some(summary),
            ReadingOutcome::Error { .. } => None,
        }
    }

    /// The parse error, if the frame was malformed.
    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            ReadingOutcome::Summary(_) => None,
            ReadingOutcome::Error { error } => Some(error),
        }
    }

    /// Whether this reading reports a positive detection.
    pub fn is_detection(&self) -> bool {
        self.summary().is_some_and(|s| s.detection)
    }
}
