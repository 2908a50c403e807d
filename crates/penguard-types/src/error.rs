//! Error types for frame parsing in penguard-types.

use thiserror::Error;

/// Errors that can occur when parsing a sensor summary frame.
///
/// This error type is platform-agnostic and does not include
/// BLE-specific errors (those belong in penguard-core).
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The frame text does not match the summary line layout.
    #[error("Invalid data format")]
    InvalidFormat,

    /// A numeric field matched the layout but is not a valid number.
    #[error("Invalid {field} value: '{value}'")]
    InvalidNumber {
        /// Name of the field (`amplitude` or `frequency`).
        field: &'static str,
        /// The text that failed to parse.
        value: String,
    },
}

/// Result type alias using penguard-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
