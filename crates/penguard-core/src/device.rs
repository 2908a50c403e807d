//! Managed device entity.
//!
//! A [`Device`] is created by the device manager when a scan matches a known
//! profile and lives in its registry as `Arc<Device>`. The connection manager
//! and the notification tasks hold clones of the same `Arc`.
//!
//! All mutable fields sit behind one per-device lock. Connect and disconnect
//! additionally take a lifecycle lock so that two transitions on the same
//! device never interleave.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::debug;

use penguard_types::{ConnectionHealth, DeviceState, DeviceType, RawFrame};

use crate::buffer::RingBuffer;
use crate::error::Error;
use crate::events::{EventDispatcher, SystemEvent};
use crate::profile::DeviceProfile;
use crate::traits::CharacteristicRef;

/// Errors kept per device.
pub const ERROR_HISTORY_CAPACITY: usize = 100;

/// One entry of a device's error history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// When the error was recorded.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Error message.
    pub message: String,
}

/// Runtime counters of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Payload bytes received.
    pub bytes_received: u64,
    /// Notifications received.
    pub packets_received: u64,
    /// Errors recorded.
    pub errors: u64,
    /// Links lost or closed.
    pub disconnections: u64,
    /// Receive time of the last notification.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_data_received: Option<OffsetDateTime>,
    /// Last time a scan or notification showed the device.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
}

impl DeviceStats {
    /// Errors per received packet. Counts against one packet before any
    /// data arrived.
    pub fn error_rate(&self) -> f64 {
        self.errors as f64 / self.packets_received.max(1) as f64
    }

    /// Time elapsed between the last notification and `now`.
    pub fn since_last_data(&self, now: OffsetDateTime) -> Option<time::Duration> {
        self.last_data_received.map(|received| now - received)
    }
}

/// Read-only view of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Device address.
    pub address: String,
    /// Advertised name.
    pub name: Option<String>,
    /// Device type.
    pub device_type: DeviceType,
    /// Lifecycle state.
    pub state: DeviceState,
    /// Attempts since the last successful connection.
    pub connection_attempts: u32,
    /// Consecutive failed keep-alive reads.
    pub missed_keep_alives: u32,
    /// Link quality.
    pub health: ConnectionHealth,
    /// Milliseconds since the last notification, if any arrived.
    pub ms_since_last_data: Option<u64>,
    /// Errors per received packet.
    pub error_rate: f64,
    /// Runtime counters.
    pub stats: DeviceStats,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// Raw frames held in the device buffer.
    pub buffered_frames: usize,
}

struct DeviceInner {
    name: Option<String>,
    state: DeviceState,
    connection_attempts: u32,
    missed_keep_alives: u32,
    errors: RingBuffer<ErrorRecord>,
    stats: DeviceStats,
    data: RingBuffer<RawFrame>,
    characteristic: Option<CharacteristicRef>,
    keep_alive: Option<JoinHandle<()>>,
    notifications: Option<JoinHandle<()>>,
}

/// A field device managed by the system.
pub struct Device {
    address: String,
    device_type: DeviceType,
    profile: Arc<DeviceProfile>,
    events: EventDispatcher,
    inner: Mutex<DeviceInner>,
    lifecycle: Mutex<()>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("address", &self.address)
            .field("device_type", &self.device_type)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Create a device in the `Discovering` state.
    pub fn new(
        address: impl Into<String>,
        name: Option<String>,
        device_type: DeviceType,
        profile: Arc<DeviceProfile>,
        buffer_capacity: usize,
        events: EventDispatcher,
    ) -> Self {
        Self {
            address: address.into(),
            device_type,
            profile,
            events,
            inner: Mutex::new(DeviceInner {
                name,
                state: DeviceState::Discovering,
                connection_attempts: 0,
                missed_keep_alives: 0,
                errors: RingBuffer::new(ERROR_HISTORY_CAPACITY),
                stats: DeviceStats {
                    last_seen: Some(OffsetDateTime::now_utc()),
                    ..DeviceStats::default()
                },
                data: RingBuffer::new(buffer_capacity),
                characteristic: None,
                keep_alive: None,
                notifications: None,
            }),
            lifecycle: Mutex::new(()),
        }
    }

    /// Device address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Device type.
    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// Protocol profile.
    pub fn profile(&self) -> &Arc<DeviceProfile> {
        &self.profile
    }

    /// Advertised name.
    pub async fn name(&self) -> Option<String> {
        self.inner.lock().await.name.clone()
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> DeviceState {
        self.inner.lock().await.state
    }

    /// Move to `state`, emitting a state change event if it differs.
    ///
    /// Entering `Connected` resets the attempt and keep-alive counters.
    /// Returns the previous state.
    pub async fn set_state(&self, state: DeviceState) -> DeviceState {
        let old_state = {
            let mut inner = self.inner.lock().await;
            let old_state = std::mem::replace(&mut inner.state, state);
            if state == DeviceState::Connected {
                inner.connection_attempts = 0;
                inner.missed_keep_alives = 0;
            }
            old_state
        };

        if old_state != state {
            debug!(address = %self.address, %old_state, new_state = %state, "State change");
            self.events.send(SystemEvent::DeviceStateChange {
                address: self.address.clone(),
                device_type: self.device_type,
                old_state,
                new_state: state,
            });
        }
        old_state
    }

    /// Enter `Connecting` and count the attempt. Returns the attempt number.
    pub async fn begin_attempt(&self) -> u32 {
        let attempts = {
            let mut inner = self.inner.lock().await;
            inner.connection_attempts = inner.connection_attempts.saturating_add(1);
            inner.connection_attempts
        };
        self.set_state(DeviceState::Connecting).await;
        attempts
    }

    /// Attempts since the last successful connection.
    pub async fn connection_attempts(&self) -> u32 {
        self.inner.lock().await.connection_attempts
    }

    /// Consecutive failed keep-alive reads.
    pub async fn missed_keep_alives(&self) -> u32 {
        self.inner.lock().await.missed_keep_alives
    }

    /// Count a failed keep-alive read. Returns the new count.
    pub async fn record_missed_keep_alive(&self) -> u32 {
        let mut inner = self.inner.lock().await;
        inner.missed_keep_alives = inner.missed_keep_alives.saturating_add(1);
        inner.missed_keep_alives
    }

    /// Clear the keep-alive counter after a successful read.
    pub async fn reset_missed_keep_alives(&self) {
        self.inner.lock().await.missed_keep_alives = 0;
    }

    /// Link quality.
    pub async fn health(&self) -> ConnectionHealth {
        ConnectionHealth::from_missed(self.missed_keep_alives().await)
    }

    /// Append an error to the bounded history.
    pub async fn record_error(&self, error: &Error) {
        self.record_error_message(error.to_string()).await;
    }

    /// Append an error message to the bounded history.
    pub async fn record_error_message(&self, message: impl Into<String>) {
        let mut inner = self.inner.lock().await;
        inner.errors.push(ErrorRecord {
            timestamp: OffsetDateTime::now_utc(),
            message: message.into(),
        });
        inner.stats.errors = inner.stats.errors.saturating_add(1);
    }

    /// Error history, oldest first.
    pub async fn errors(&self) -> Vec<ErrorRecord> {
        self.inner.lock().await.errors.to_vec()
    }

    /// Buffer a notified value and update counters.
    pub async fn add_data(&self, data: Bytes) {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.inner.lock().await;
        inner.stats.bytes_received = inner.stats.bytes_received.saturating_add(data.len() as u64);
        inner.stats.packets_received = inner.stats.packets_received.saturating_add(1);
        inner.stats.last_data_received = Some(now);
        inner.stats.last_seen = Some(now);
        inner.data.push(RawFrame::new(now, data));
    }

    /// Raw frames held by the device, oldest first.
    pub async fn raw_data(&self) -> Vec<RawFrame> {
        self.inner.lock().await.data.to_vec()
    }

    /// Count a lost or closed link.
    pub async fn record_disconnection(&self) {
        let mut inner = self.inner.lock().await;
        inner.stats.disconnections = inner.stats.disconnections.saturating_add(1);
    }

    /// Mark the device as seen by a scan.
    pub async fn touch(&self) {
        self.inner.lock().await.stats.last_seen = Some(OffsetDateTime::now_utc());
    }

    /// Runtime counters.
    pub async fn stats(&self) -> DeviceStats {
        self.inner.lock().await.stats.clone()
    }

    /// The characteristic the active link is subscribed to.
    pub async fn characteristic(&self) -> Option<CharacteristicRef> {
        self.inner.lock().await.characteristic.clone()
    }

    /// Store the active link's characteristic and its tasks.
    pub(crate) async fn attach_link(
        &self,
        characteristic: CharacteristicRef,
        keep_alive: JoinHandle<()>,
        notifications: JoinHandle<()>,
    ) {
        let mut inner = self.inner.lock().await;
        inner.characteristic = Some(characteristic);
        for old in [
            inner.keep_alive.replace(keep_alive),
            inner.notifications.replace(notifications),
        ]
        .into_iter()
        .flatten()
        {
            old.abort();
        }
    }

    /// Stop link tasks and forget the characteristic.
    pub(crate) async fn detach_link(&self) {
        let mut inner = self.inner.lock().await;
        inner.characteristic = None;
        for handle in [inner.keep_alive.take(), inner.notifications.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }

    /// Whether link tasks are attached.
    pub async fn has_link_tasks(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.keep_alive.is_some() || inner.notifications.is_some()
    }

    /// Serialise connect and disconnect on this device.
    pub(crate) async fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// Read-only view of the device.
    pub async fn snapshot(&self) -> DeviceSnapshot {
        let inner = self.inner.lock().await;
        let ms_since_last_data = inner
            .stats
            .since_last_data(OffsetDateTime::now_utc())
            .map(|elapsed| elapsed.whole_milliseconds().max(0) as u64);

        DeviceSnapshot {
            address: self.address.clone(),
            name: inner.name.clone(),
            device_type: self.device_type,
            state: inner.state,
            connection_attempts: inner.connection_attempts,
            missed_keep_alives: inner.missed_keep_alives,
            health: ConnectionHealth::from_missed(inner.missed_keep_alives),
            ms_since_last_data,
            error_rate: inner.stats.error_rate(),
            stats: inner.stats.clone(),
            last_error: inner.errors.newest().map(|record| record.message.clone()),
            buffered_frames: inner.data.len(),
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for handle in [inner.keep_alive.take(), inner.notifications.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(events: &EventDispatcher) -> Device {
        Device::new(
            "AA:BB:CC:DD:EE:FF",
            Some("PenguinDetector".to_string()),
            DeviceType::PenguinDetector,
            Arc::new(DeviceProfile::penguin_detector()),
            3,
            events.clone(),
        )
    }

    #[tokio::test]
    async fn test_new_device_is_discovering() {
        let device = device(&EventDispatcher::default());
        assert_eq!(device.state().await, DeviceState::Discovering);
        assert_eq!(device.connection_attempts().await, 0);
        assert_eq!(device.health().await, ConnectionHealth::Good);
        assert!(device.stats().await.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_state_change_emits_event() {
        let events = EventDispatcher::default();
        let mut rx = events.subscribe();
        let device = device(&events);

        let old = device.set_state(DeviceState::Queued).await;
        assert_eq!(old, DeviceState::Discovering);

        match rx.recv().await.unwrap() {
            SystemEvent::DeviceStateChange {
                old_state,
                new_state,
                ..
            } => {
                assert_eq!(old_state, DeviceState::Discovering);
                assert_eq!(new_state, DeviceState::Queued);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // Same state again: no event.
        device.set_state(DeviceState::Queued).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connected_resets_counters() {
        let device = device(&EventDispatcher::default());
        assert_eq!(device.begin_attempt().await, 1);
        assert_eq!(device.begin_attempt().await, 2);
        device.record_missed_keep_alive().await;
        device.record_missed_keep_alive().await;
        assert_eq!(device.health().await, ConnectionHealth::Critical);

        device.set_state(DeviceState::Connected).await;
        assert_eq!(device.connection_attempts().await, 0);
        assert_eq!(device.missed_keep_alives().await, 0);
    }

    #[tokio::test]
    async fn test_error_history_is_bounded() {
        let device = device(&EventDispatcher::default());
        for i in 0..(ERROR_HISTORY_CAPACITY + 5) {
            device.record_error_message(format!("error {i}")).await;
        }
        let errors = device.errors().await;
        assert_eq!(errors.len(), ERROR_HISTORY_CAPACITY);
        assert_eq!(errors[0].message, "error 5");
        assert_eq!(device.stats().await.errors, (ERROR_HISTORY_CAPACITY + 5) as u64);

        let snapshot = device.snapshot().await;
        assert_eq!(
            snapshot.last_error.as_deref(),
            Some(format!("error {}", ERROR_HISTORY_CAPACITY + 4).as_str())
        );
    }

    #[tokio::test]
    async fn test_add_data_updates_stats_and_evicts() {
        let device = device(&EventDispatcher::default());
        for chunk in [&b"ab"[..], b"cde", b"f", b"gh"] {
            device.add_data(Bytes::copy_from_slice(chunk)).await;
        }
        let stats = device.stats().await;
        assert_eq!(stats.bytes_received, 8);
        assert_eq!(stats.packets_received, 4);
        assert!(stats.last_data_received.is_some());

        let frames = device.raw_data().await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data, Bytes::from_static(b"cde"));
        assert_eq!(device.snapshot().await.buffered_frames, 3);
    }

    #[test]
    fn test_stats_derived_health() {
        let received = OffsetDateTime::UNIX_EPOCH;
        let mut stats = DeviceStats {
            errors: 3,
            ..DeviceStats::default()
        };
        assert_eq!(stats.error_rate(), 3.0);
        assert_eq!(stats.since_last_data(received), None);

        stats.packets_received = 12;
        stats.last_data_received = Some(received);
        assert_eq!(stats.error_rate(), 0.25);
        assert_eq!(
            stats.since_last_data(received + time::Duration::seconds(4)),
            Some(time::Duration::seconds(4))
        );
    }

    #[tokio::test]
    async fn test_snapshot_reports_data_age_and_error_rate() {
        let device = device(&EventDispatcher::default());
        let snapshot = device.snapshot().await;
        assert_eq!(snapshot.ms_since_last_data, None);
        assert_eq!(snapshot.error_rate, 0.0);

        device.add_data(Bytes::from_static(b"a")).await;
        device.add_data(Bytes::from_static(b"b")).await;
        device.record_error_message("read failed").await;

        let snapshot = device.snapshot().await;
        assert!(snapshot.ms_since_last_data.is_some());
        assert_eq!(snapshot.error_rate, 0.5);
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let device = device(&EventDispatcher::default());
        device.record_disconnection().await;
        let json = serde_json::to_value(device.snapshot().await).unwrap();
        assert_eq!(json["state"], "discovering");
        assert_eq!(json["health"], "good");
        assert_eq!(json["stats"]["disconnections"], 1);
        assert!(json["stats"]["last_data_received"].is_null());
        assert!(json["ms_since_last_data"].is_null());
        assert_eq!(json["error_rate"], 0.0);
    }

    #[tokio::test]
    async fn test_detach_link_aborts_tasks() {
        let device = device(&EventDispatcher::default());
        let keep_alive = tokio::spawn(std::future::pending::<()>());
        let notifications = tokio::spawn(std::future::pending::<()>());
        let characteristic = CharacteristicRef {
            address: device.address().to_string(),
            service: penguard_types::uuids::DETECTOR_SERVICE,
            uuid: penguard_types::uuids::DETECTOR_SUMMARY,
        };

        device
            .attach_link(characteristic.clone(), keep_alive, notifications)
            .await;
        assert!(device.has_link_tasks().await);
        assert_eq!(device.characteristic().await, Some(characteristic));

        device.detach_link().await;
        assert!(!device.has_link_tasks().await);
        assert!(device.characteristic().await.is_none());
    }
}
