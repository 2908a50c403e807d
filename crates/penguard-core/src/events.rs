//! System event stream.
//!
//! Every manager publishes into one shared [`EventDispatcher`]; consumers
//! subscribe once and receive discovery, lifecycle, ingestion and system
//! events in a single typed stream.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use penguard_types::{DeviceState, DeviceType, ProcessedReading, RawFrame};

use crate::device::DeviceSnapshot;

/// Events emitted by the ingestion core.
///
/// All events are serializable for logging and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SystemEvent {
    /// A scan registered a new device.
    DeviceDiscovered { device: DeviceSnapshot },
    /// A device changed lifecycle state.
    DeviceStateChange {
        address: String,
        device_type: DeviceType,
        old_state: DeviceState,
        new_state: DeviceState,
    },
    /// A connection attempt or link maintenance step failed.
    DeviceError { address: String, error: String },
    /// A device exhausted its reconnect attempts and will be ignored.
    DeviceBlacklisted { address: String },
    /// A raw notification was buffered.
    DataReceived {
        address: String,
        data: Bytes,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    /// A batch of frames was parsed.
    DataProcessed {
        address: String,
        readings: Vec<ProcessedReading>,
    },
    /// A batch of frames could not be decoded. The rejected frames are
    /// handed back so consumers can keep or inspect them.
    ProcessingError {
        address: String,
        error: String,
        frames: Vec<RawFrame>,
    },
    /// The system started discovery and processing.
    SystemStarted {
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
    /// The system shut down.
    SystemStopped {
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
}

impl SystemEvent {
    /// The device address the event concerns, if any.
    pub fn address(&self) -> Option<&str> {
        match self {
            SystemEvent::DeviceDiscovered { device } => Some(&device.address),
            SystemEvent::DeviceStateChange { address, .. }
            | SystemEvent::DeviceError { address, .. }
            | SystemEvent::DeviceBlacklisted { address }
            | SystemEvent::DataReceived { address, .. }
            | SystemEvent::DataProcessed { address, .. }
            | SystemEvent::ProcessingError { address, .. } => Some(address),
            SystemEvent::SystemStarted { .. } | SystemEvent::SystemStopped { .. } => None,
        }
    }
}

/// Sender for system events.
pub type EventSender = broadcast::Sender<SystemEvent>;

/// Receiver for system events.
pub type EventReceiver = broadcast::Receiver<SystemEvent>;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Fan-out dispatcher shared by all managers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a dispatcher buffering `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SystemEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatch_to_subscribers() {
        let events = EventDispatcher::new(8);
        let mut first = events.subscribe();
        let mut second = events.subscribe();
        assert_eq!(events.receiver_count(), 2);

        events.send(SystemEvent::DeviceBlacklisted {
            address: "AA:BB".to_string(),
        });

        for rx in [&mut first, &mut second] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.address(), Some("AA:BB"));
        }
    }

    #[test]
    fn test_send_without_subscribers() {
        let events = EventDispatcher::default();
        events.send(SystemEvent::SystemStarted {
            timestamp: OffsetDateTime::UNIX_EPOCH,
        });
        assert_eq!(events.receiver_count(), 0);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = SystemEvent::DeviceStateChange {
            address: "AA:BB".to_string(),
            device_type: DeviceType::PenguinDetector,
            old_state: DeviceState::Connecting,
            new_state: DeviceState::Handshaking,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "device_state_change");
        assert_eq!(json["device_type"], "penguin_detector");
        assert_eq!(json["old_state"], "connecting");
        assert_eq!(json["new_state"], "handshaking");

        let event = SystemEvent::ProcessingError {
            address: "AA:BB".to_string(),
            error: "boom".to_string(),
            frames: vec![RawFrame::new(
                OffsetDateTime::UNIX_EPOCH,
                Bytes::from_static(b"Amp Sum"),
            )],
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: SystemEvent = serde_json::from_str(&json).unwrap();
        match back {
            SystemEvent::ProcessingError { frames, .. } => {
                assert_eq!(frames.len(), 1);
                assert_eq!(frames[0].text(), "Amp Sum");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_system_events_have_no_address() {
        let event = SystemEvent::SystemStopped {
            timestamp: OffsetDateTime::UNIX_EPOCH,
        };
        assert_eq!(event.address(), None);
    }
}
