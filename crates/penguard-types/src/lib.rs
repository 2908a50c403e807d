//! Platform-agnostic types for penguard acoustic sensor telemetry.
//!
//! This crate provides shared types used by the BLE ingestion core
//! (penguard-core) and by consumers of its events.
//!
//! # Features
//!
//! - Device type and lifecycle state enums
//! - Raw frame and processed reading structures
//! - Summary line parser for detector notifications
//! - UUID constants for BLE services and characteristics
//!
//! # Example
//!
//! ```
//! use penguard_types::frame::parse_summary;
//!
//! let summary = parse_summary("Amp Sum: 1234.5 | Top Freq: 678.9 Hz PENGUIN").unwrap();
//! assert!(summary.detection);
//! ```

pub mod error;
pub mod frame;
pub mod types;
pub mod uuid;

pub use error::{ParseError, ParseResult};
pub use frame::{DETECTION_MARKER, parse_reading, parse_summary};
pub use types::{
    AcousticSummary, ConnectionHealth, DeviceState, DeviceType, ProcessedReading, RawFrame,
    ReadingOutcome,
};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use time::OffsetDateTime;

    // --- DeviceType tests ---

    #[test]
    fn test_device_type_from_name() {
        assert_eq!(
            DeviceType::from_name("PenguinDetector"),
            Some(DeviceType::PenguinDetector)
        );
        assert_eq!(DeviceType::from_name("PenguinDetector 2"), None);
        assert_eq!(DeviceType::from_name(""), None);
    }

    #[test]
    fn test_device_type_display() {
        assert_eq!(DeviceType::PenguinDetector.to_string(), "PenguinDetector");
        assert_eq!(DeviceType::PenguinDetector.config_key(), "penguin_detector");
    }

    // --- DeviceState tests ---

    #[test]
    fn test_device_state_display() {
        assert_eq!(DeviceState::Connected.to_string(), "connected");
        assert_eq!(DeviceState::Queued.to_string(), "queued");
        assert_eq!(DeviceState::Error.to_string(), "error");
    }

    #[test]
    fn test_device_state_is_connecting() {
        assert!(DeviceState::Connecting.is_connecting());
        assert!(DeviceState::Handshaking.is_connecting());
        assert!(!DeviceState::Connected.is_connecting());
        assert!(!DeviceState::Queued.is_connecting());
    }

    #[test]
    fn test_device_state_all_is_complete() {
        assert_eq!(DeviceState::ALL.len(), 7);
        for state in DeviceState::ALL {
            assert_eq!(
                DeviceState::ALL.iter().filter(|s| **s == state).count(),
                1
            );
        }
    }

    // --- ConnectionHealth tests ---

    #[test]
    fn test_connection_health_from_missed() {
        assert_eq!(ConnectionHealth::from_missed(0), ConnectionHealth::Good);
        assert_eq!(ConnectionHealth::from_missed(1), ConnectionHealth::Warning);
        assert_eq!(ConnectionHealth::from_missed(2), ConnectionHealth::Critical);
        assert_eq!(ConnectionHealth::from_missed(9), ConnectionHealth::Critical);
    }

    // --- RawFrame tests ---

    #[test]
    fn test_raw_frame_starts_unprocessed() {
        let frame = RawFrame::new(OffsetDateTime::UNIX_EPOCH, Bytes::from_static(b"abc"));
        assert!(!frame.processed);
        assert_eq!(frame.text(), "abc");
    }

    // --- Serialization tests ---

    #[test]
    fn test_device_state_serialization() {
        assert_eq!(
            serde_json::to_string(&DeviceState::Handshaking).unwrap(),
            "\"handshaking\""
        );
        let state: DeviceState = serde_json::from_str("\"queued\"").unwrap();
        assert_eq!(state, DeviceState::Queued);
    }

    #[test]
    fn test_summary_reading_serialization() {
        let reading = parse_reading(
            OffsetDateTime::UNIX_EPOCH,
            "Amp Sum: 1234.5 | Top Freq: 678.9 Hz".to_string(),
        );
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["amplitude"], 1234.5);
        assert_eq!(json["frequency"], 678.9);
        assert_eq!(json["detection"], false);
        assert_eq!(json["raw"], "Amp Sum: 1234.5 | Top Freq: 678.9 Hz");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_reading_serialization() {
        let reading = parse_reading(OffsetDateTime::UNIX_EPOCH, "garbage".to_string());
        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["error"], "Invalid data format");
        assert_eq!(json["raw"], "garbage");
        assert!(json.get("amplitude").is_none());

        let back: ProcessedReading = serde_json::from_value(json).unwrap();
        assert_eq!(back, reading);
    }
}
