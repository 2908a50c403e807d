//! btleplug-backed transport.
//!
//! Peripherals are addressed by the identifier string produced during
//! listing: the Bluetooth address, or the platform peripheral ID where the
//! address is hidden (macOS reports `00:00:00:00:00:00`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use btleplug::api::{
    CharPropFlags, Central, Characteristic, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::{StreamExt, future};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::traits::{
    CharacteristicFlag, CharacteristicRef, NotificationStream, ServiceRef, Transport,
};

const HIDDEN_ADDRESS: &str = "00:00:00:00:00:00";

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or_else(|| Error::adapter_unavailable("no Bluetooth adapter found"))
}

fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

fn identifier(address: &str, formatted_id: impl FnOnce() -> String) -> String {
    if address == HIDDEN_ADDRESS {
        formatted_id()
    } else {
        address.to_string()
    }
}

fn map_flags(properties: CharPropFlags) -> Vec<CharacteristicFlag> {
    [
        (CharPropFlags::BROADCAST, CharacteristicFlag::Broadcast),
        (CharPropFlags::READ, CharacteristicFlag::Read),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CharacteristicFlag::WriteWithoutResponse,
        ),
        (CharPropFlags::WRITE, CharacteristicFlag::Write),
        (CharPropFlags::NOTIFY, CharacteristicFlag::Notify),
        (CharPropFlags::INDICATE, CharacteristicFlag::Indicate),
    ]
    .into_iter()
    .filter(|(flag, _)| properties.contains(*flag))
    .map(|(_, mapped)| mapped)
    .collect()
}

/// [`Transport`] over a btleplug [`Adapter`].
pub struct BtleTransport {
    adapter: Adapter,
    peripherals: RwLock<HashMap<String, Peripheral>>,
    discovering: AtomicBool,
    released: AtomicBool,
}

impl std::fmt::Debug for BtleTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleTransport")
            .field("discovering", &self.discovering.load(Ordering::Relaxed))
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl BtleTransport {
    /// Open the first available adapter.
    pub async fn new() -> Result<Self> {
        let adapter = get_adapter().await?;
        Ok(Self::with_adapter(adapter))
    }

    /// Wrap an existing adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        Self {
            adapter,
            peripherals: RwLock::new(HashMap::new()),
            discovering: AtomicBool::new(false),
            released: AtomicBool::new(false),
        }
    }

    async fn refresh(&self) -> Result<Vec<String>> {
        let peripherals = self.adapter.peripherals().await?;
        let mut cache = self.peripherals.write().await;
        cache.clear();

        for peripheral in peripherals {
            let address = peripheral.address().to_string();
            let id = identifier(&address, || format_peripheral_id(&peripheral.id()));
            cache.insert(id, peripheral);
        }

        let mut ids: Vec<String> = cache.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn peripheral(&self, address: &str) -> Result<Peripheral> {
        if let Some(peripheral) = self.peripherals.read().await.get(address) {
            return Ok(peripheral.clone());
        }

        // Might have appeared since the last listing.
        self.refresh().await?;
        self.peripherals
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(address.to_string()))
    }

    async fn resolve(
        &self,
        characteristic: &CharacteristicRef,
    ) -> Result<(Peripheral, Characteristic)> {
        let peripheral = self.peripheral(&characteristic.address).await?;
        let found = peripheral
            .services()
            .into_iter()
            .filter(|service| service.uuid == characteristic.service)
            .flat_map(|service| service.characteristics)
            .find(|c| c.uuid == characteristic.uuid);

        match found {
            Some(found) => Ok((peripheral, found)),
            None => Err(Error::CharacteristicNotFound {
                address: characteristic.address.clone(),
                candidates: vec![characteristic.uuid],
            }),
        }
    }
}

#[async_trait]
impl Transport for BtleTransport {
    async fn is_powered(&self) -> Result<bool> {
        Ok(self.adapter.adapter_info().await.is_ok())
    }

    async fn power_on(&self) -> Result<()> {
        // btleplug has no API to toggle adapter power.
        Err(Error::adapter_unavailable(
            "adapter power cannot be controlled through btleplug",
        ))
    }

    async fn is_discovering(&self) -> Result<bool> {
        Ok(self.discovering.load(Ordering::SeqCst))
    }

    async fn start_discovery(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        self.discovering.store(true, Ordering::SeqCst);
        debug!("Adapter scan started");
        Ok(())
    }

    async fn stop_discovery(&self) -> Result<()> {
        if self.discovering.swap(false, Ordering::SeqCst) {
            self.adapter.stop_scan().await?;
            debug!("Adapter scan stopped");
        }
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<String>> {
        self.refresh().await
    }

    async fn device_name(&self, address: &str) -> Result<Option<String>> {
        let peripheral = self.peripheral(address).await?;
        let properties = peripheral.properties().await?;
        Ok(properties.and_then(|p| p.local_name))
    }

    async fn connect(&self, address: &str) -> Result<()> {
        let peripheral = self.peripheral(address).await?;
        peripheral.connect().await?;
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<()> {
        let peripheral = self.peripheral(address).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn is_connected(&self, address: &str) -> Result<bool> {
        let peripheral = self.peripheral(address).await?;
        Ok(peripheral.is_connected().await?)
    }

    async fn primary_service(&self, address: &str, uuid: Uuid) -> Result<Option<ServiceRef>> {
        let peripheral = self.peripheral(address).await?;
        if peripheral.services().is_empty() {
            peripheral.discover_services().await?;
        }

        let found = peripheral
            .services()
            .iter()
            .any(|service| service.primary && service.uuid == uuid);
        Ok(found.then(|| ServiceRef {
            address: address.to_string(),
            uuid,
        }))
    }

    async fn characteristic(
        &self,
        service: &ServiceRef,
        uuid: Uuid,
    ) -> Result<Option<CharacteristicRef>> {
        let peripheral = self.peripheral(&service.address).await?;
        let found = peripheral
            .services()
            .iter()
            .filter(|s| s.uuid == service.uuid)
            .any(|s| s.characteristics.iter().any(|c| c.uuid == uuid));
        Ok(found.then(|| CharacteristicRef::new(service, uuid)))
    }

    async fn characteristic_flags(
        &self,
        characteristic: &CharacteristicRef,
    ) -> Result<Vec<CharacteristicFlag>> {
        let (_, found) = self.resolve(characteristic).await?;
        Ok(map_flags(found.properties))
    }

    async fn start_notifications(
        &self,
        characteristic: &CharacteristicRef,
    ) -> Result<NotificationStream> {
        let (peripheral, found) = self.resolve(characteristic).await?;
        peripheral.subscribe(&found).await?;

        let uuid = found.uuid;
        let stream = peripheral.notifications().await?.filter_map(move |n| {
            future::ready((n.uuid == uuid).then(|| Bytes::from(n.value)))
        });
        Ok(Box::pin(stream))
    }

    async fn stop_notifications(&self, characteristic: &CharacteristicRef) -> Result<()> {
        let (peripheral, found) = self.resolve(characteristic).await?;
        peripheral.unsubscribe(&found).await?;
        Ok(())
    }

    async fn read_characteristic(&self, characteristic: &CharacteristicRef) -> Result<Bytes> {
        let (peripheral, found) = self.resolve(characteristic).await?;
        Ok(Bytes::from(peripheral.read(&found).await?))
    }

    async fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.stop_discovery().await {
            warn!("Failed to stop scan on release: {}", e);
        }
        self.peripherals.write().await.clear();
        info!("Bluetooth transport released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_prefers_address() {
        let id = identifier("AA:BB:CC:DD:EE:FF", || "ignored".to_string());
        assert_eq!(id, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_identifier_falls_back_for_hidden_address() {
        let id = identifier(HIDDEN_ADDRESS, || "3F2504E0-4F89".to_string());
        assert_eq!(id, "3F2504E0-4F89");
    }

    #[test]
    fn test_map_flags() {
        let flags = map_flags(CharPropFlags::READ | CharPropFlags::NOTIFY);
        assert_eq!(
            flags,
            vec![CharacteristicFlag::Read, CharacteristicFlag::Notify]
        );

        assert!(map_flags(CharPropFlags::empty()).is_empty());
        assert_eq!(
            map_flags(CharPropFlags::EXTENDED_PROPERTIES | CharPropFlags::INDICATE),
            vec![CharacteristicFlag::Indicate]
        );
    }
}
