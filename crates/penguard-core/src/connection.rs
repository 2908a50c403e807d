//! Connection protocol for a single device.
//!
//! [`ConnectionManager::connect`] walks a device through the link setup:
//!
//! 1. `Connecting`, attempt counter incremented
//! 2. a stale link reported by the stack is torn down first
//! 3. transport connect, then `Handshaking`
//! 4. first resolvable candidate service
//! 5. first resolvable candidate characteristic
//! 6. the characteristic must support notifications
//! 7. notifications are forwarded to the device and the data manager
//! 8. keep-alive reads start
//! 9. `Connected`
//!
//! Failures are recorded on the device and returned. Retrying is the device
//! manager's decision.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use penguard_types::DeviceState;

use crate::data::DataManager;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::traits::{
    CharacteristicFlag, CharacteristicRef, NotificationStream, ServiceRef, Transport,
};

/// Link events reported to the device manager.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum LinkSignal {
    /// Too many keep-alive reads failed in a row.
    KeepAliveFailed {
        /// Device address.
        address: String,
        /// Consecutive missed reads.
        missed: u32,
    },
}

/// Sender half of the link signal channel.
pub type SignalSender = mpsc::UnboundedSender<LinkSignal>;

/// Receiver half of the link signal channel.
pub type SignalReceiver = mpsc::UnboundedReceiver<LinkSignal>;

/// Create the link signal channel.
pub fn signal_channel() -> (SignalSender, SignalReceiver) {
    mpsc::unbounded_channel()
}

/// Opens and closes device links and keeps them alive.
pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    data: Arc<DataManager>,
    signals: SignalSender,
    active: RwLock<HashMap<String, Arc<Device>>>,
    reset_delay: Duration,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("reset_delay", &self.reset_delay)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a connection manager.
    ///
    /// Keep-alive tasks stop when `cancel_token` is cancelled, and connects
    /// that complete after cancellation are rolled back.
    pub fn new(
        transport: Arc<dyn Transport>,
        data: Arc<DataManager>,
        signals: SignalSender,
        reset_delay: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            data,
            signals,
            active: RwLock::new(HashMap::new()),
            reset_delay,
            cancel_token,
        }
    }

    /// Connect a device. On failure the error is recorded on the device.
    #[tracing::instrument(level = "info", skip_all, fields(address = %device.address()))]
    pub async fn connect(&self, device: &Arc<Device>) -> Result<()> {
        let _lifecycle = device.lock_lifecycle().await;

        match self.establish(device).await {
            Ok(()) => {
                info!("Connected");
                Ok(())
            }
            Err(e) => {
                warn!("Connection failed: {}", e);
                device.record_error(&e).await;
                self.drop_partial_link(device.address()).await;
                Err(e)
            }
        }
    }

    async fn drop_partial_link(&self, address: &str) {
        if self.transport.is_connected(address).await.unwrap_or(false)
            && let Err(e) = self.transport.disconnect(address).await
        {
            debug!("Dropping partial link failed: {}", e);
        }
    }

    async fn establish(&self, device: &Arc<Device>) -> Result<()> {
        let address = device.address();
        let profile = Arc::clone(device.profile());

        let attempt = device.begin_attempt().await;
        debug!(attempt, "Connecting");

        if self.transport.is_connected(address).await.unwrap_or(false) {
            debug!("Stack reports a stale link, resetting it");
            if let Err(e) = self.transport.disconnect(address).await {
                debug!("Stale link reset failed: {}", e);
            }
            sleep(self.reset_delay).await;
        }

        self.transport.connect(address).await?;
        device.set_state(DeviceState::Handshaking).await;

        let service = self.resolve_service(address, &profile.services).await?;
        let characteristic = self
            .resolve_characteristic(&service, &profile.characteristics)
            .await?;

        let flags = self
            .transport
            .characteristic_flags(&characteristic)
            .await?;
        if !flags.contains(&CharacteristicFlag::Notify) {
            return Err(Error::NotificationsUnsupported {
                uuid: characteristic.uuid,
            });
        }

        let stream = self.transport.start_notifications(&characteristic).await?;

        if self.cancel_token.is_cancelled() {
            let _ = self.transport.stop_notifications(&characteristic).await;
            let _ = self.transport.disconnect(address).await;
            return Err(Error::Cancelled);
        }

        let notifications = self.spawn_forwarder(device, stream);
        let keep_alive = self.spawn_keep_alive(device, characteristic.clone());
        device
            .attach_link(characteristic, keep_alive, notifications)
            .await;

        self.active
            .write()
            .await
            .insert(address.to_string(), Arc::clone(device));
        device.set_state(DeviceState::Connected).await;
        Ok(())
    }

    async fn resolve_service(&self, address: &str, candidates: &[Uuid]) -> Result<ServiceRef> {
        for uuid in candidates {
            match self.transport.primary_service(address, *uuid).await {
                Ok(Some(service)) => {
                    debug!(service = %uuid, "Resolved service");
                    return Ok(service);
                }
                Ok(None) => debug!(service = %uuid, "Service not present"),
                Err(e) => debug!(service = %uuid, "Service lookup failed: {}", e),
            }
        }
        Err(Error::ServiceNotFound {
            address: address.to_string(),
            candidates: candidates.to_vec(),
        })
    }

    async fn resolve_characteristic(
        &self,
        service: &ServiceRef,
        candidates: &[Uuid],
    ) -> Result<CharacteristicRef> {
        for uuid in candidates {
            match self.transport.characteristic(service, *uuid).await {
                Ok(Some(characteristic)) => {
                    debug!(characteristic = %uuid, "Resolved characteristic");
                    return Ok(characteristic);
                }
                Ok(None) => debug!(characteristic = %uuid, "Characteristic not present"),
                Err(e) => debug!(characteristic = %uuid, "Characteristic lookup failed: {}", e),
            }
        }
        Err(Error::CharacteristicNotFound {
            address: service.address.clone(),
            candidates: candidates.to_vec(),
        })
    }

    fn spawn_forwarder(&self, device: &Arc<Device>, mut stream: NotificationStream) -> JoinHandle<()> {
        let device = Arc::clone(device);
        let data = Arc::clone(&self.data);

        tokio::spawn(async move {
            while let Some(value) = stream.next().await {
                device.add_data(value.clone()).await;
                data.add_data(device.address(), value).await;
            }
            debug!(address = %device.address(), "Notification stream ended");
        })
    }

    fn spawn_keep_alive(
        &self,
        device: &Arc<Device>,
        characteristic: CharacteristicRef,
    ) -> JoinHandle<()> {
        let device = Arc::clone(device);
        let transport = Arc::clone(&self.transport);
        let signals = self.signals.clone();
        let cancel_token = self.cancel_token.child_token();
        let period = device.profile().keep_alive_interval;
        let max_missed = device.profile().max_missed_keep_alives;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = ticker.tick() => {
                        match transport.read_characteristic(&characteristic).await {
                            Ok(_) => device.reset_missed_keep_alives().await,
                            Err(e) => {
                                let missed = device.record_missed_keep_alive().await;
                                device.record_error(&e).await;
                                warn!(
                                    address = %device.address(),
                                    missed,
                                    "Keep-alive read failed: {}", e
                                );
                                if missed >= max_missed {
                                    let _ = signals.send(LinkSignal::KeepAliveFailed {
                                        address: device.address().to_string(),
                                        missed,
                                    });
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        })
    }

    /// Tear a device's link down.
    ///
    /// Local teardown always completes. A failed transport disconnect is
    /// recorded on the device and returned afterwards.
    #[tracing::instrument(level = "info", skip_all, fields(address = %device.address()))]
    pub async fn disconnect(&self, device: &Arc<Device>) -> Result<()> {
        let _lifecycle = device.lock_lifecycle().await;
        let address = device.address();

        if let Some(characteristic) = device.characteristic().await
            && let Err(e) = self.transport.stop_notifications(&characteristic).await
        {
            debug!("Stopping notifications failed: {}", e);
        }

        let result = self.transport.disconnect(address).await;

        device.detach_link().await;
        self.active.write().await.remove(address);
        device.set_state(DeviceState::Disconnected).await;

        match result {
            Ok(()) => {
                info!("Disconnected");
                Ok(())
            }
            Err(e) => {
                warn!("Transport disconnect failed: {}", e);
                device.record_error(&e).await;
                Err(e)
            }
        }
    }

    /// Disconnect every active device concurrently.
    ///
    /// Returns a map of device addresses to disconnection results.
    pub async fn disconnect_all(&self) -> HashMap<String, Result<()>> {
        let devices: Vec<Arc<Device>> = self.active.read().await.values().cloned().collect();

        let disconnect_futures = devices.iter().map(|device| async move {
            let result = self.disconnect(device).await;
            (device.address().to_string(), result)
        });

        join_all(disconnect_futures).await.into_iter().collect()
    }

    /// Addresses of connected devices, sorted.
    pub async fn active_connections(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.active.read().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Number of connected devices.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// Whether `address` has an active link.
    pub async fn is_active(&self, address: &str) -> bool {
        self.active.read().await.contains_key(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use penguard_types::DeviceType;
    use penguard_types::uuids::{BATTERY_SERVICE, DETECTOR_SERVICE, DETECTOR_SUMMARY};

    use crate::events::EventDispatcher;
    use crate::mock::{MockPeripheral, MockTransport};
    use crate::profile::DeviceProfile;

    const ADDR: &str = "AA:BB:CC:DD:EE:01";

    struct Fixture {
        transport: Arc<MockTransport>,
        data: Arc<DataManager>,
        connections: ConnectionManager,
        signals: SignalReceiver,
        events: EventDispatcher,
    }

    fn fixture(peripheral: MockPeripheral) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        transport.add_peripheral(peripheral);
        let events = EventDispatcher::default();
        let data = Arc::new(DataManager::new(
            events.clone(),
            100,
            10,
            Duration::from_millis(100),
        ));
        let (tx, rx) = signal_channel();
        let connections = ConnectionManager::new(
            transport.clone(),
            Arc::clone(&data),
            tx,
            Duration::from_millis(10),
            CancellationToken::new(),
        );
        Fixture {
            transport,
            data,
            connections,
            signals: rx,
            events,
        }
    }

    fn device(fixture: &Fixture, profile: DeviceProfile) -> Arc<Device> {
        Arc::new(Device::new(
            ADDR,
            Some("PenguinDetector".to_string()),
            DeviceType::PenguinDetector,
            Arc::new(profile),
            100,
            fixture.events.clone(),
        ))
    }

    #[tokio::test]
    async fn test_connect_happy_path() {
        let f = fixture(MockPeripheral::detector(ADDR));
        let device = device(&f, DeviceProfile::penguin_detector());

        f.connections.connect(&device).await.unwrap();

        assert_eq!(device.state().await, DeviceState::Connected);
        assert_eq!(device.connection_attempts().await, 0);
        assert!(device.has_link_tasks().await);
        assert_eq!(
            device.characteristic().await.map(|c| c.uuid),
            Some(DETECTOR_SUMMARY)
        );
        assert_eq!(f.connections.active_connections().await, vec![ADDR.to_string()]);
        assert!(f.transport.is_subscribed(ADDR));
    }

    #[tokio::test]
    async fn test_state_sequence() {
        let f = fixture(MockPeripheral::detector(ADDR));
        let mut rx = f.events.subscribe();
        let device = device(&f, DeviceProfile::penguin_detector());

        f.connections.connect(&device).await.unwrap();

        let mut states = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let crate::events::SystemEvent::DeviceStateChange { new_state, .. } = event {
                states.push(new_state);
            }
        }
        assert_eq!(
            states,
            vec![
                DeviceState::Connecting,
                DeviceState::Handshaking,
                DeviceState::Connected
            ]
        );
    }

    #[tokio::test]
    async fn test_notifications_reach_device_and_data_manager() {
        let f = fixture(MockPeripheral::detector(ADDR));
        let device = device(&f, DeviceProfile::penguin_detector());
        f.connections.connect(&device).await.unwrap();

        assert!(f.transport.notify(ADDR, Bytes::from_static(b"Amp Sum: 1 | Top Freq: 2 Hz")));
        for _ in 0..100 {
            if f.data.pending_count(ADDR).await == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(f.data.pending_count(ADDR).await, 1);
        assert_eq!(device.stats().await.packets_received, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_link_is_reset() {
        let f = fixture(MockPeripheral::detector(ADDR).already_connected(true));
        let device = device(&f, DeviceProfile::penguin_detector());

        f.connections.connect(&device).await.unwrap();
        assert_eq!(f.transport.disconnect_count(ADDR), 1);
        assert_eq!(f.transport.connect_count(ADDR), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_recorded() {
        let f = fixture(MockPeripheral::detector(ADDR).fail_connect(true));
        let device = device(&f, DeviceProfile::penguin_detector());

        let err = f.connections.connect(&device).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(device.connection_attempts().await, 1);
        assert_eq!(device.state().await, DeviceState::Connecting);
        assert_eq!(device.errors().await.len(), 1);
        assert!(!f.connections.is_active(ADDR).await);
    }

    #[tokio::test]
    async fn test_missing_service() {
        let f = fixture(MockPeripheral::detector(ADDR).without_services());
        let device = device(&f, DeviceProfile::penguin_detector());

        let err = f.connections.connect(&device).await.unwrap_err();
        match err {
            Error::ServiceNotFound { candidates, .. } => {
                assert_eq!(candidates, vec![BATTERY_SERVICE, DETECTOR_SERVICE]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(device.state().await, DeviceState::Handshaking);
        assert!(!f.transport.is_link_up(ADDR));
    }

    #[tokio::test]
    async fn test_missing_characteristic() {
        let f = fixture(
            MockPeripheral::new(ADDR)
                .name("PenguinDetector")
                .service(DETECTOR_SERVICE),
        );
        let device = device(&f, DeviceProfile::penguin_detector());

        let err = f.connections.connect(&device).await.unwrap_err();
        assert!(matches!(err, Error::CharacteristicNotFound { .. }));
    }

    #[tokio::test]
    async fn test_notify_required() {
        let f = fixture(
            MockPeripheral::new(ADDR)
                .name("PenguinDetector")
                .characteristic(DETECTOR_SERVICE, DETECTOR_SUMMARY, &[CharacteristicFlag::Read]),
        );
        let device = device(&f, DeviceProfile::penguin_detector());

        let err = f.connections.connect(&device).await.unwrap_err();
        assert!(matches!(err, Error::NotificationsUnsupported { uuid } if uuid == DETECTOR_SUMMARY));
    }

    #[tokio::test]
    async fn test_disconnect() {
        let f = fixture(MockPeripheral::detector(ADDR));
        let device = device(&f, DeviceProfile::penguin_detector());
        f.connections.connect(&device).await.unwrap();

        f.connections.disconnect(&device).await.unwrap();
        assert_eq!(device.state().await, DeviceState::Disconnected);
        assert!(!device.has_link_tasks().await);
        assert!(!f.transport.is_link_up(ADDR));
        assert_eq!(f.connections.active_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_disconnect_still_tears_down() {
        let f = fixture(MockPeripheral::detector(ADDR).fail_disconnect(true));
        let device = device(&f, DeviceProfile::penguin_detector());
        f.connections.connect(&device).await.unwrap();

        assert!(f.connections.disconnect(&device).await.is_err());
        assert_eq!(device.state().await, DeviceState::Disconnected);
        assert!(!device.has_link_tasks().await);
        assert!(!f.connections.is_active(ADDR).await);
        assert_eq!(device.errors().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_failure_signals() {
        let mut f = fixture(MockPeripheral::detector(ADDR));
        let profile =
            DeviceProfile::penguin_detector().with_keep_alive(Duration::from_millis(50), 2);
        let device = device(&f, profile);
        f.connections.connect(&device).await.unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(f.transport.read_count(ADDR) >= 2);
        assert_eq!(device.missed_keep_alives().await, 0);

        f.transport.set_reads_fail(ADDR, true);
        let signal = f.signals.recv().await.unwrap();
        assert_eq!(
            signal,
            LinkSignal::KeepAliveFailed {
                address: ADDR.to_string(),
                missed: 2
            }
        );
        assert_eq!(device.missed_keep_alives().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_recovers() {
        let f = fixture(MockPeripheral::detector(ADDR));
        let profile =
            DeviceProfile::penguin_detector().with_keep_alive(Duration::from_millis(50), 3);
        let device = device(&f, profile);
        f.connections.connect(&device).await.unwrap();

        f.transport.set_reads_fail(ADDR, true);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(device.missed_keep_alives().await, 1);

        f.transport.set_reads_fail(ADDR, false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(device.missed_keep_alives().await, 0);
    }

    #[tokio::test]
    async fn test_disconnect_all_collects_every_result() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peripheral(MockPeripheral::detector("A1"));
        transport.add_peripheral(MockPeripheral::detector("A2").fail_disconnect(true));
        transport.add_peripheral(MockPeripheral::detector("A3"));
        let events = EventDispatcher::default();
        let data = Arc::new(DataManager::new(
            events.clone(),
            10,
            10,
            Duration::from_millis(100),
        ));
        let (tx, _rx) = signal_channel();
        let connections = ConnectionManager::new(
            transport.clone(),
            data,
            tx,
            Duration::ZERO,
            CancellationToken::new(),
        );

        let mut devices = Vec::new();
        for address in ["A1", "A2", "A3"] {
            let device = Arc::new(Device::new(
                address,
                None,
                DeviceType::PenguinDetector,
                Arc::new(DeviceProfile::penguin_detector()),
                10,
                events.clone(),
            ));
            connections.connect(&device).await.unwrap();
            devices.push(device);
        }

        let results = connections.disconnect_all().await;
        assert_eq!(results.len(), 3);
        assert!(results["A1"].is_ok());
        assert!(results["A2"].is_err());
        assert!(results["A3"].is_ok());
        assert_eq!(connections.active_count().await, 0);
        for device in devices {
            assert_eq!(device.state().await, DeviceState::Disconnected);
        }
    }

    #[tokio::test]
    async fn test_connect_after_cancel_rolls_back() {
        let transport = Arc::new(MockTransport::new());
        transport.add_peripheral(MockPeripheral::detector(ADDR));
        let events = EventDispatcher::default();
        let data = Arc::new(DataManager::new(
            events.clone(),
            10,
            10,
            Duration::from_millis(100),
        ));
        let (tx, _rx) = signal_channel();
        let cancel = CancellationToken::new();
        let connections =
            ConnectionManager::new(transport.clone(), data, tx, Duration::ZERO, cancel.clone());
        let device = Arc::new(Device::new(
            ADDR,
            None,
            DeviceType::PenguinDetector,
            Arc::new(DeviceProfile::penguin_detector()),
            10,
            events,
        ));

        cancel.cancel();
        let err = connections.connect(&device).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(!transport.is_link_up(ADDR));
        assert!(!connections.is_active(ADDR).await);
    }
}
