//! Parsing of detector summary lines.
//!
//! The detector does its own signal analysis and notifies a single text line
//! per analysis window:
//!
//! ```text
//! Amp Sum: 1234.5 | Top Freq: 678.9 Hz
//! Amp Sum: 9120.0 | Top Freq: 1210.4 Hz PENGUIN
//! ```
//!
//! The `PENGUIN` marker (case-sensitive) flags a positive detection.

use std::sync::LazyLock;

use regex::Regex;
use time::OffsetDateTime;

use crate::error::{ParseError, ParseResult};
use crate::types::{AcousticSummary, ProcessedReading, RawFrame, ReadingOutcome};

/// Substring marking a positive detection.
pub const DETECTION_MARKER: &str = "PENGUIN";

static SUMMARY_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Amp Sum: ([\d.]+) \| Top Freq: ([\d.]+) Hz").expect("summary pattern is valid")
});

/// Parse one summary line.
///
/// # Examples
///
/// ```
/// use penguard_types::frame::parse_summary;
///
/// let summary = parse_summary("Amp Sum: 1234.5 | Top Freq: 678.9 Hz").unwrap();
/// assert_eq!(summary.amplitude, 1234.5);
/// assert_eq!(summary.frequency, 678.9);
/// assert!(!summary.detection);
///
/// assert!(parse_summary("garbage").is_err());
/// ```
pub fn parse_summary(text: &str) -> ParseResult<AcousticSummary> {
    let captures = SUMMARY_LINE
        .captures(text)
        .ok_or(ParseError::InvalidFormat)?;

    let amplitude = parse_field("amplitude", &captures[1])?;
    let frequency = parse_field("frequency", &captures[2])?;

    Ok(AcousticSummary {
        amplitude,
        frequency,
        detection: text.contains(DETECTION_MARKER),
    })
}

fn parse_field(field: &'static str, value: &str) -> ParseResult<f64> {
    value.parse().map_err(|_| ParseError::InvalidNumber {
        field,
        value: value.to_string(),
    })
}

/// Turn raw frame text into a reading. Never fails: malformed input becomes
/// an error reading that keeps the raw text.
pub fn parse_reading(timestamp: OffsetDateTime, text: String) -> ProcessedReading {
    let outcome = match parse_summary(&text) {
        Ok(summary) => ReadingOutcome::Summary(summary),
        Err(e) => ReadingOutcome::Error {
            error: e.to_string(),
        },
    };

    ProcessedReading {
        timestamp,
        outcome,
        raw: text,
    }
}

impl RawFrame {
    /// Parse this frame into a reading stamped with the frame's receive time.
    pub fn parse(&self) -> ProcessedReading {
        parse_reading(self.timestamp, self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use proptest::prelude::*;

    #[test]
    fn test_parse_plain_summary() {
        let summary = parse_summary("Amp Sum: 1234.5 | Top Freq: 678.9 Hz").unwrap();
        assert_eq!(summary.amplitude, 1234.5);
        assert_eq!(summary.frequency, 678.9);
        assert!(!summary.detection);
    }

    #[test]
    fn test_parse_detection_marker() {
        let summary = parse_summary("Amp Sum: 1234.5 | Top Freq: 678.9 Hz PENGUIN").unwrap();
        assert_eq!(summary.amplitude, 1234.5);
        assert_eq!(summary.frequency, 678.9);
        assert!(summary.detection);
    }

    #[test]
    fn test_detection_marker_is_case_sensitive() {
        let summary = parse_summary("Amp Sum: 1.0 | Top Freq: 2.0 Hz penguin").unwrap();
        assert!(!summary.detection);

        let summary = parse_summary("Amp Sum: 1.0 | Top Freq: 2.0 Hz Penguin").unwrap();
        assert!(!summary.detection);
    }

    #[test]
    fn test_marker_anywhere_in_line() {
        let summary = parse_summary("PENGUIN Amp Sum: 10 | Top Freq: 20 Hz").unwrap();
        assert!(summary.detection);
        assert_eq!(summary.amplitude, 10.0);
        assert_eq!(summary.frequency, 20.0);
    }

    #[test]
    fn test_integer_fields() {
        let summary = parse_summary("Amp Sum: 42 | Top Freq: 440 Hz").unwrap();
        assert_eq!(summary.amplitude, 42.0);
        assert_eq!(summary.frequency, 440.0);
    }

    #[test]
    fn test_garbage_is_invalid_format() {
        assert_eq!(parse_summary("garbage"), Err(ParseError::InvalidFormat));
        assert_eq!(parse_summary(""), Err(ParseError::InvalidFormat));
    }

    #[test]
    fn test_field_order_matters() {
        let err = parse_summary("Top Freq: 678.9 Hz | Amp Sum: 1234.5").unwrap_err();
        assert_eq!(err, ParseError::InvalidFormat);
    }

    #[test]
    fn test_malformed_number() {
        let err = parse_summary("Amp Sum: 1.2.3 | Top Freq: 5 Hz").unwrap_err();
        assert!(matches!(
            err,
            ParseError::InvalidNumber {
                field: "amplitude",
                ..
            }
        ));
        assert!(err.to_string().contains("1.2.3"));
    }

    #[test]
    fn test_parse_reading_keeps_raw_on_error() {
        let reading = parse_reading(OffsetDateTime::UNIX_EPOCH, "garbage".to_string());
        assert_eq!(reading.raw, "garbage");
        assert_eq!(reading.error(), Some("Invalid data format"));
        assert!(reading.summary().is_none());
        assert!(!reading.is_detection());
    }

    #[test]
    fn test_raw_frame_parse_uses_frame_timestamp() {
        let ts = OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(90);
        let frame = RawFrame::new(
            ts,
            Bytes::from_static(b"Amp Sum: 3.5 | Top Freq: 900.25 Hz PENGUIN"),
        );
        let reading = frame.parse();
        assert_eq!(reading.timestamp, ts);
        assert!(reading.is_detection());
        assert_eq!(reading.summary().unwrap().frequency, 900.25);
    }

    #[test]
    fn test_invalid_utf8_is_replaced_not_dropped() {
        let frame = RawFrame::new(OffsetDateTime::UNIX_EPOCH, Bytes::from_static(&[0xff, 0xfe]));
        let reading = frame.parse();
        assert!(reading.error().is_some());
        assert!(!reading.raw.is_empty());
    }

    proptest! {
        #[test]
        fn prop_formatted_line_parses_back(amp in 0u32..1_000_000, amp_frac in 0u32..10,
                                           freq in 0u32..20_000, freq_frac in 0u32..10,
                                           detected: bool) {
            let marker = if detected { " PENGUIN" } else { "" };
            let line = format!("Amp Sum: {amp}.{amp_frac} | Top Freq: {freq}.{freq_frac} Hz{marker}");
            let summary = parse_summary(&line).unwrap();

            let expected_amp: f64 = format!("{amp}.{amp_frac}").parse().unwrap();
            let expected_freq: f64 = format!("{freq}.{freq_frac}").parse().unwrap();
            prop_assert_eq!(summary.amplitude, expected_amp);
            prop_assert_eq!(summary.frequency, expected_freq);
            prop_assert_eq!(summary.detection, detected);
        }

        #[test]
        fn prop_parse_reading_never_loses_raw(text in ".{0,64}") {
            let reading = parse_reading(OffsetDateTime::UNIX_EPOCH, text.clone());
            prop_assert_eq!(reading.raw, text);
        }
    }
}
