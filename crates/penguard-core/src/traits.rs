//! Transport abstraction over the BLE stack.
//!
//! This module provides the [`Transport`] trait that abstracts over the real
//! btleplug adapter ([`BtleTransport`](crate::BtleTransport)) and the
//! in-memory [`MockTransport`](crate::MockTransport) used in tests.
//!
//! Devices are addressed by their address string. Services and
//! characteristics are addressed by the small [`ServiceRef`] and
//! [`CharacteristicRef`] values the transport hands out.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use uuid::Uuid;

use crate::error::Result;

/// A primary service resolved on a connected device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceRef {
    /// Device address.
    pub address: String,
    /// Service UUID.
    pub uuid: Uuid,
}

/// A characteristic resolved within a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    /// Device address.
    pub address: String,
    /// Owning service UUID.
    pub service: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
}

impl CharacteristicRef {
    /// Reference a characteristic within a resolved service.
    pub fn new(service: &ServiceRef, uuid: Uuid) -> Self {
        Self {
            address: service.address.clone(),
            service: service.uuid,
            uuid,
        }
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.address, self.service, self.uuid)
    }
}

/// GATT characteristic property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicFlag {
    /// Value may be broadcast.
    Broadcast,
    /// Value may be read.
    Read,
    /// Value may be written without response.
    WriteWithoutResponse,
    /// Value may be written.
    Write,
    /// Value changes are notified.
    Notify,
    /// Value changes are indicated.
    Indicate,
}

/// Stream of notified characteristic values.
pub type NotificationStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// Contract between the managers and the BLE stack.
///
/// The trait is object safe and used as `Arc<dyn Transport>`.
///
/// # Example
///
/// ```ignore
/// use penguard_core::{Transport, Result};
///
/// async fn list_named<T: Transport + ?Sized>(transport: &T) -> Result<Vec<String>> {
///     let mut names = Vec::new();
///     for address in transport.list_devices().await? {
///         if let Some(name) = transport.device_name(&address).await? {
///             names.push(name);
///         }
///     }
///     Ok(names)
/// }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    // --- Adapter ---

    /// Whether the adapter is present and powered.
    async fn is_powered(&self) -> Result<bool>;

    /// Try to power the adapter on.
    async fn power_on(&self) -> Result<()>;

    /// Whether the adapter is currently scanning.
    async fn is_discovering(&self) -> Result<bool>;

    /// Start scanning for advertisements.
    async fn start_discovery(&self) -> Result<()>;

    /// Stop scanning.
    async fn stop_discovery(&self) -> Result<()>;

    /// Addresses of all devices the adapter has seen.
    async fn list_devices(&self) -> Result<Vec<String>>;

    /// Advertised name of a device, if it has one.
    async fn device_name(&self, address: &str) -> Result<Option<String>>;

    // --- Link ---

    /// Open a link to a device.
    async fn connect(&self, address: &str) -> Result<()>;

    /// Close the link to a device.
    async fn disconnect(&self, address: &str) -> Result<()>;

    /// Whether the stack reports an open link.
    async fn is_connected(&self, address: &str) -> Result<bool>;

    // --- GATT ---

    /// Resolve a primary service, `None` if the device does not expose it.
    async fn primary_service(&self, address: &str, uuid: Uuid) -> Result<Option<ServiceRef>>;

    /// Resolve a characteristic, `None` if the service does not expose it.
    async fn characteristic(
        &self,
        service: &ServiceRef,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicRef>>;

    /// Properties of a characteristic.
    async fn characteristic_flags(
        &self,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<CharacteristicFlag>>;

    /// Subscribe to value notifications.
    ///
    /// The stream ends when notifications stop or the link drops.
    async fn start_notifications(
        &self,
        characteristic: &CharacteristicRef,
    ) -> Result<NotificationStream>;

    /// Unsubscribe from value notifications.
    async fn stop_notifications(&self, characteristic: &CharacteristicRef) -> Result<()>;

    /// Read the current value.
    async fn read_characteristic(&self, characteristic: &CharacteristicRef) -> Result<Bytes>;

    /// Release adapter resources. Called once at shutdown.
    async fn release(&self) -> Result<()>;
}
