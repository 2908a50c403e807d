//! Error types for penguard-core.
//!
//! This module defines all error types that can occur while discovering,
//! connecting to and ingesting data from field devices.
//!
//! # Error Categories
//!
//! Every error belongs to one [`ErrorCategory`], which decides how the
//! device manager reacts to it:
//!
//! | Category | Examples | Reaction |
//! |----------|----------|----------|
//! | [`ErrorCategory::TransientLink`] | [`Error::Bluetooth`], [`Error::KeepAliveFailed`] | Retry with linear backoff, blacklist when attempts run out |
//! | [`ErrorCategory::Protocol`] | [`Error::ServiceNotFound`], [`Error::NotificationsUnsupported`] | Same as transient: a later scan may expose a different service layout |
//! | [`ErrorCategory::Parse`] | [`Error::Parse`] | Never retried; the frame is kept as an error reading |
//! | [`ErrorCategory::Resource`] | [`Error::AdapterUnavailable`] | Fatal to start-up, propagated to the caller |
//! | [`ErrorCategory::Configuration`] | [`Error::InvalidConfig`] | Fix configuration and restart |
//! | [`ErrorCategory::Lifecycle`] | [`Error::Cancelled`], [`Error::ShutDown`] | Expected during shutdown |

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur in the ingestion core.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Transport-level failure reported by a non-btleplug transport.
    #[error("Transport error: {0}")]
    Transport(String),

    /// No usable Bluetooth adapter.
    #[error("Bluetooth adapter unavailable: {0}")]
    AdapterUnavailable(String),

    /// The transport does not know the address.
    #[error("Device '{0}' not found")]
    DeviceNotFound(String),

    /// Operation attempted while not connected to the device.
    #[error("Not connected to device '{0}'")]
    NotConnected(String),

    /// None of the candidate services resolved.
    #[error("Required service not found on '{address}' (tried {})", format_uuids(.candidates))]
    ServiceNotFound {
        /// Device address.
        address: String,
        /// Candidate UUIDs in search order.
        candidates: Vec<Uuid>,
    },

    /// None of the candidate characteristics resolved.
    #[error("Required characteristic not found on '{address}' (tried {})", format_uuids(.candidates))]
    CharacteristicNotFound {
        /// Device address.
        address: String,
        /// Candidate UUIDs in search order.
        candidates: Vec<Uuid>,
    },

    /// The resolved characteristic cannot notify.
    #[error("Notifications not supported by characteristic {uuid}")]
    NotificationsUnsupported {
        /// The characteristic UUID.
        uuid: Uuid,
    },

    /// Too many consecutive keep-alive probes failed.
    #[error("Keep-alive failed after {missed} missed probes")]
    KeepAliveFailed {
        /// Consecutive missed probes.
        missed: u32,
    },

    /// A summary frame could not be parsed.
    #[error("Parse error: {0}")]
    Parse(#[from] penguard_types::ParseError),

    /// A frame decoder rejected a whole batch.
    #[error("Batch decoding failed: {0}")]
    Decode(String),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The system has already been shut down.
    #[error("System has been shut down")]
    ShutDown,

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How an error should be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Link-level failure, retried with backoff.
    TransientLink,
    /// Service negotiation failure, retried like a link failure.
    Protocol,
    /// Malformed payload, never retried.
    Parse,
    /// Missing or unusable hardware, fatal to start-up.
    Resource,
    /// Invalid configuration.
    Configuration,
    /// Cancellation or shutdown.
    Lifecycle,
}

fn format_uuids(uuids: &[Uuid]) -> String {
    uuids
        .iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Create a transport error from any message.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create an adapter error.
    pub fn adapter_unavailable(message: impl Into<String>) -> Self {
        Self::AdapterUnavailable(message.into())
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// The category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Bluetooth(_)
            | Error::Transport(_)
            | Error::DeviceNotFound(_)
            | Error::NotConnected(_)
            | Error::KeepAliveFailed { .. }
            | Error::Io(_) => ErrorCategory::TransientLink,
            Error::ServiceNotFound { .. }
            | Error::CharacteristicNotFound { .. }
            | Error::NotificationsUnsupported { .. } => ErrorCategory::Protocol,
            Error::Parse(_) | Error::Decode(_) => ErrorCategory::Parse,
            Error::AdapterUnavailable(_) => ErrorCategory::Resource,
            Error::InvalidConfig(_) => ErrorCategory::Configuration,
            Error::Cancelled | Error::ShutDown => ErrorCategory::Lifecycle,
        }
    }

    /// Whether the reconnect policy applies to this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::TransientLink | ErrorCategory::Protocol
        )
    }

    /// Whether this error must abort system start-up.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Resource | ErrorCategory::Configuration
        )
    }
}

/// Result type alias using penguard-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
