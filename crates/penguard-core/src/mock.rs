//! In-memory transport for testing.
//!
//! This module provides a [`MockTransport`] that implements [`Transport`]
//! without BLE hardware, so the whole system can be driven from tests.
//!
//! # Features
//!
//! - **Failure injection**: failing connects (always or a number of times),
//!   failing disconnects, failing keep-alive reads, missing services and
//!   characteristics, characteristics without notify support
//! - **Notification injection**: push values into an active subscription
//! - **Link loss**: drop a link from the device side
//! - **Latency simulation**: delay connects to keep attempts in flight, or
//!   stall a single peripheral's disconnect

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use uuid::Uuid;

use penguard_types::DeviceType;
use penguard_types::uuids::{DETECTOR_SERVICE, DETECTOR_SUMMARY};

use crate::error::{Error, Result};
use crate::traits::{
    CharacteristicFlag, CharacteristicRef, NotificationStream, ServiceRef, Transport,
};

/// A simulated peripheral, configured with builder methods.
///
/// # Example
///
/// ```
/// use penguard_core::mock::MockPeripheral;
///
/// let flaky = MockPeripheral::detector("AA:BB:CC:DD:EE:01").connect_failures(2);
/// assert_eq!(flaky.address(), "AA:BB:CC:DD:EE:01");
/// ```
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    address: String,
    name: Option<String>,
    services: BTreeMap<Uuid, BTreeMap<Uuid, Vec<CharacteristicFlag>>>,
    connected: bool,
    fail_connect: bool,
    connect_failures: u32,
    fail_disconnect: bool,
    disconnect_latency: Duration,
    fail_name: bool,
    fail_reads: bool,
    value: Bytes,
    notifier: Option<mpsc::UnboundedSender<Bytes>>,
    connects: u32,
    disconnects: u32,
    reads: u32,
}

impl MockPeripheral {
    /// A peripheral with no name and no services.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
            services: BTreeMap::new(),
            connected: false,
            fail_connect: false,
            connect_failures: 0,
            fail_disconnect: false,
            disconnect_latency: Duration::ZERO,
            fail_name: false,
            fail_reads: false,
            value: Bytes::new(),
            notifier: None,
            connects: 0,
            disconnects: 0,
            reads: 0,
        }
    }

    /// A penguin detector exposing its summary characteristic.
    pub fn detector(address: impl Into<String>) -> Self {
        Self::new(address)
            .name(DeviceType::PenguinDetector.advertised_name())
            .characteristic(
                DETECTOR_SERVICE,
                DETECTOR_SUMMARY,
                &[CharacteristicFlag::Read, CharacteristicFlag::Notify],
            )
    }

    /// A peripheral with a random mock address.
    pub fn random_detector() -> Self {
        Self::detector(format!("MOCK-{:06X}", rand::random::<u32>() % 0xFFFFFF))
    }

    /// Address of the peripheral.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Set the advertised name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add an empty primary service.
    pub fn service(mut self, service: Uuid) -> Self {
        self.services.entry(service).or_default();
        self
    }

    /// Add a characteristic (and its service if needed).
    pub fn characteristic(
        mut self,
        service: Uuid,
        uuid: Uuid,
        flags: &[CharacteristicFlag],
    ) -> Self {
        self.services
            .entry(service)
            .or_default()
            .insert(uuid, flags.to_vec());
        self
    }

    /// Remove every service.
    pub fn without_services(mut self) -> Self {
        self.services.clear();
        self
    }

    /// Fail every connect.
    pub fn fail_connect(mut self, fail: bool) -> Self {
        self.fail_connect = fail;
        self
    }

    /// Fail the next `count` connects.
    pub fn connect_failures(mut self, count: u32) -> Self {
        self.connect_failures = count;
        self
    }

    /// Fail every disconnect (the link stays up).
    pub fn fail_disconnect(mut self, fail: bool) -> Self {
        self.fail_disconnect = fail;
        self
    }

    /// Delay every disconnect of this peripheral.
    pub fn disconnect_latency(mut self, latency: Duration) -> Self {
        self.disconnect_latency = latency;
        self
    }

    /// Fail name lookups.
    pub fn fail_name(mut self, fail: bool) -> Self {
        self.fail_name = fail;
        self
    }

    /// Start with an open link, as if left over from a previous session.
    pub fn already_connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    /// Value returned by reads.
    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = value.into();
        self
    }
}

/// In-memory [`Transport`] for tests.
///
/// # Example
///
/// ```
/// use penguard_core::{MockPeripheral, MockTransport, Transport};
///
/// #[tokio::main]
/// async fn main() {
///     let transport = MockTransport::new();
///     transport.add_peripheral(MockPeripheral::detector("AA:BB:CC:DD:EE:01"));
///
///     transport.connect("AA:BB:CC:DD:EE:01").await.unwrap();
///     assert!(transport.is_connected("AA:BB:CC:DD:EE:01").await.unwrap());
/// }
/// ```
#[derive(Debug)]
pub struct MockTransport {
    peripherals: Mutex<BTreeMap<String, MockPeripheral>>,
    powered: AtomicBool,
    can_power_on: AtomicBool,
    discovering: AtomicBool,
    fail_listing: AtomicBool,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
    power_on_calls: AtomicU32,
    releases: AtomicU32,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// A powered transport with no peripherals.
    pub fn new() -> Self {
        Self {
            peripherals: Mutex::new(BTreeMap::new()),
            powered: AtomicBool::new(true),
            can_power_on: AtomicBool::new(true),
            discovering: AtomicBool::new(false),
            fail_listing: AtomicBool::new(false),
            connect_latency_ms: AtomicU64::new(0),
            power_on_calls: AtomicU32::new(0),
            releases: AtomicU32::new(0),
        }
    }

    fn peripherals(&self) -> MutexGuard<'_, BTreeMap<String, MockPeripheral>> {
        self.peripherals
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn with_peripheral<T>(
        &self,
        address: &str,
        f: impl FnOnce(&mut MockPeripheral) -> Result<T>,
    ) -> Result<T> {
        let mut peripherals = self.peripherals();
        let peripheral = peripherals
            .get_mut(address)
            .ok_or_else(|| Error::DeviceNotFound(address.to_string()))?;
        f(peripheral)
    }

    fn with_connected<T>(
        &self,
        address: &str,
        f: impl FnOnce(&mut MockPeripheral) -> Result<T>,
    ) -> Result<T> {
        self.with_peripheral(address, |peripheral| {
            if !peripheral.connected {
                return Err(Error::NotConnected(address.to_string()));
            }
            f(peripheral)
        })
    }

    /// Add or replace a peripheral.
    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        self.peripherals()
            .insert(peripheral.address.clone(), peripheral);
    }

    /// Remove a peripheral, ending its notification stream.
    pub fn remove_peripheral(&self, address: &str) -> bool {
        self.peripherals().remove(address).is_some()
    }

    /// Set whether the adapter is powered.
    pub fn set_powered(&self, powered: bool) {
        self.powered.store(powered, Ordering::SeqCst);
    }

    /// Set whether `power_on` succeeds.
    pub fn set_can_power_on(&self, can: bool) {
        self.can_power_on.store(can, Ordering::SeqCst);
    }

    /// Make `list_devices` fail.
    pub fn set_listing_fails(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Set simulated connect latency.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Make every connect to `address` fail or succeed.
    pub fn set_connect_fails(&self, address: &str, fail: bool) {
        if let Some(peripheral) = self.peripherals().get_mut(address) {
            peripheral.fail_connect = fail;
        }
    }

    /// Make reads from `address` fail or succeed.
    pub fn set_reads_fail(&self, address: &str, fail: bool) {
        if let Some(peripheral) = self.peripherals().get_mut(address) {
            peripheral.fail_reads = fail;
        }
    }

    /// Push a value into the active subscription of `address`.
    ///
    /// Returns `false` if nothing is subscribed.
    pub fn notify(&self, address: &str, value: impl Into<Bytes>) -> bool {
        self.peripherals()
            .get(address)
            .and_then(|peripheral| peripheral.notifier.as_ref())
            .is_some_and(|notifier| notifier.unbounded_send(value.into()).is_ok())
    }

    /// Drop the link from the device side: reads fail and notifications end.
    pub fn drop_link(&self, address: &str) {
        if let Some(peripheral) = self.peripherals().get_mut(address) {
            peripheral.connected = false;
            peripheral.notifier = None;
        }
    }

    /// Whether `address` has an open link.
    pub fn is_link_up(&self, address: &str) -> bool {
        self.peripherals()
            .get(address)
            .is_some_and(|peripheral| peripheral.connected)
    }

    /// Whether `address` has an active subscription.
    pub fn is_subscribed(&self, address: &str) -> bool {
        self.peripherals()
            .get(address)
            .is_some_and(|peripheral| peripheral.notifier.is_some())
    }

    /// Successful connects to `address`.
    pub fn connect_count(&self, address: &str) -> u32 {
        self.peripherals()
            .get(address)
            .map_or(0, |peripheral| peripheral.connects)
    }

    /// Disconnect calls for `address`.
    pub fn disconnect_count(&self, address: &str) -> u32 {
        self.peripherals()
            .get(address)
            .map_or(0, |peripheral| peripheral.disconnects)
    }

    /// Read calls for `address`.
    pub fn read_count(&self, address: &str) -> u32 {
        self.peripherals()
            .get(address)
            .map_or(0, |peripheral| peripheral.reads)
    }

    /// Addresses with an open link.
    pub fn connected_addresses(&self) -> Vec<String> {
        self.peripherals()
            .values()
            .filter(|peripheral| peripheral.connected)
            .map(|peripheral| peripheral.address.clone())
            .collect()
    }

    /// Calls to `power_on`.
    pub fn power_on_count(&self) -> u32 {
        self.power_on_calls.load(Ordering::SeqCst)
    }

    /// Calls to `release`.
    pub fn release_count(&self) -> u32 {
        self.releases.load(Ordering::SeqCst)
    }
}

fn characteristic_flags(
    peripheral: &MockPeripheral,
    characteristic: &CharacteristicRef,
) -> Option<Vec<CharacteristicFlag>> {
    peripheral
        .services
        .get(&characteristic.service)
        .and_then(|characteristics| characteristics.get(&characteristic.uuid))
        .cloned()
}

#[async_trait]
impl Transport for MockTransport {
    async fn is_powered(&self) -> Result<bool> {
        Ok(self.powered.load(Ordering::SeqCst))
    }

    async fn power_on(&self) -> Result<()> {
        self.power_on_calls.fetch_add(1, Ordering::SeqCst);
        if !self.can_power_on.load(Ordering::SeqCst) {
            return Err(Error::adapter_unavailable("mock adapter cannot power on"));
        }
        self.powered.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_discovering(&self) -> Result<bool> {
        Ok(self.discovering.load(Ordering::SeqCst))
    }

    async fn start_discovery(&self) -> Result<()> {
        self.discovering.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        self.discovering.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<String>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(Error::transport("mock listing failure"));
        }
        Ok(self.peripherals().keys().cloned().collect())
    }

    async fn device_name(&self, address: &str) -> Result<Option<String>> {
        self.with_peripheral(address, |peripheral| {
            if peripheral.fail_name {
                return Err(Error::transport("mock name lookup failure"));
            }
            Ok(peripheral.name.clone())
        })
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let latency = self.connect_latency_ms.load(Ordering::Relaxed);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.powered.load(Ordering::SeqCst) {
            return Err(Error::adapter_unavailable("mock adapter is powered off"));
        }

        self.with_peripheral(address, |peripheral| {
            if peripheral.fail_connect {
                return Err(Error::transport("mock connect failure"));
            }
            if peripheral.connect_failures > 0 {
                peripheral.connect_failures -= 1;
                return Err(Error::transport("mock transient connect failure"));
            }
            peripheral.connected = true;
            peripheral.connects += 1;
            Ok(())
        })
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let latency = self.with_peripheral(address, |peripheral| {
            peripheral.disconnects += 1;
            Ok(peripheral.disconnect_latency)
        })?;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        self.with_peripheral(address, |peripheral| {
            if peripheral.fail_disconnect {
                return Err(Error::transport("mock disconnect failure"));
            }
            peripheral.connected = false;
            peripheral.notifier = None;
            Ok(())
        })
    }

    async fn is_connected(&self, address: &str) -> Result<bool> {
        self.with_peripheral(address, |peripheral| Ok(peripheral.connected))
    }

    async fn primary_service(&self, address: &str, uuid: Uuid) -> Result<Option<ServiceRef>> {
        self.with_connected(address, |peripheral| {
            Ok(peripheral.services.contains_key(&uuid).then(|| ServiceRef {
                address: address.to_string(),
                uuid,
            }))
        })
    }

    async fn characteristic(
        &self,
        service: &ServiceRef,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicRef>> {
        self.with_connected(&service.address, |peripheral| {
            let found = peripheral
                .services
                .get(&service.uuid)
                .is_some_and(|characteristics| characteristics.contains_key(&uuid));
            Ok(found.then(|| CharacteristicRef::new(service, uuid)))
        })
    }

    async fn characteristic_flags(
        &self,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<CharacteristicFlag>> {
        self.with_connected(&characteristic.address, |peripheral| {
            characteristic_flags(peripheral, characteristic).ok_or_else(|| {
                Error::transport(format!("unknown characteristic {characteristic}"))
            })
        })
    }

    async fn start_notifications(
        &self,
        characteristic: &CharacteristicRef,
    ) -> Result<NotificationStream> {
        self.with_connected(&characteristic.address, |peripheral| {
            let flags = characteristic_flags(peripheral, characteristic).unwrap_or_default();
            if !flags.contains(&CharacteristicFlag::Notify) {
                return Err(Error::NotificationsUnsupported {
                    uuid: characteristic.uuid,
                });
            }
            let (tx, rx) = mpsc::unbounded();
            peripheral.notifier = Some(tx);
            Ok(Box::pin(rx) as NotificationStream)
        })
    }

    async fn stop_notifications(&self, characteristic: &CharacteristicRef) -> Result<()> {
        self.with_peripheral(&characteristic.address, |peripheral| {
            peripheral.notifier = None;
            Ok(())
        })
    }

    async fn read_characteristic(&self, characteristic: &CharacteristicRef) -> Result<Bytes> {
        self.with_peripheral(&characteristic.address, |peripheral| {
            peripheral.reads += 1;
            if !peripheral.connected {
                return Err(Error::NotConnected(characteristic.address.clone()));
            }
            if peripheral.fail_reads {
                return Err(Error::transport("mock read failure"));
            }
            Ok(peripheral.value.clone())
        })
    }

    async fn release(&self) -> Result<()> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.discovering.store(false, Ordering::SeqCst);
        Ok(())
    }
}
