//! Device discovery and lifecycle management.
//!
//! The [`DeviceManager`] owns the registry of known devices. It scans for
//! devices matching a profile, admits connection attempts up to the
//! concurrency cap, queues the rest, retries failures with linear backoff
//! and blacklists devices that run out of attempts.
//!
//! # Admission
//!
//! Occupied slots are the devices in `Connected` plus attempts that were
//! admitted but have not returned yet. The check and the slot reservation
//! happen under one short admission lock, so concurrent attempts can never
//! push the number of links past the cap.
//!
//! # Lock order
//!
//! `admission` → `devices` → `blacklist` → `queue` → per-device state.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use penguard_types::{DeviceState, DeviceType};

use crate::connection::{ConnectionManager, LinkSignal, SignalReceiver};
use crate::device::{Device, DeviceSnapshot};
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, SystemEvent};
use crate::profile::{DeviceProfile, ProfileTable};
use crate::traits::Transport;

/// Counts of managed devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCounts {
    /// Registered devices.
    pub total: usize,
    /// Devices in `Connected`.
    pub connected: usize,
    /// Devices waiting for a slot.
    pub queued: usize,
    /// Blacklisted addresses.
    pub blacklisted: usize,
    /// Registered devices per state.
    pub by_state: BTreeMap<DeviceState, usize>,
}

/// Configuration for the device manager.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on connected plus in-flight devices.
    pub max_concurrent_connections: usize,
    /// Period between scans.
    pub scan_interval: Duration,
    /// Raw frame capacity of each device.
    pub buffer_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_connections: 10,
            scan_interval: Duration::from_millis(5000),
            buffer_capacity: 1000,
        }
    }
}

/// Discovers devices and drives their connection lifecycle.
pub struct DeviceManager {
    transport: Arc<dyn Transport>,
    connections: Arc<ConnectionManager>,
    profiles: ProfileTable,
    events: EventDispatcher,
    config: ManagerConfig,
    devices: RwLock<HashMap<String, Arc<Device>>>,
    blacklist: RwLock<HashSet<String>>,
    queue: Mutex<VecDeque<String>>,
    admission: Mutex<HashSet<String>>,
    cancel_token: CancellationToken,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DeviceManager {
    /// Create a device manager.
    ///
    /// Pending retries stop when `cancel_token` is cancelled.
    pub fn new(
        transport: Arc<dyn Transport>,
        connections: Arc<ConnectionManager>,
        profiles: ProfileTable,
        events: EventDispatcher,
        config: ManagerConfig,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            connections,
            profiles,
            events,
            config,
            devices: RwLock::new(HashMap::new()),
            blacklist: RwLock::new(HashSet::new()),
            queue: Mutex::new(VecDeque::new()),
            admission: Mutex::new(HashSet::new()),
            cancel_token,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // --- Discovery ---

    /// Spawn the discovery loop: scan now, then every `scan_interval`.
    pub fn start_discovery(self: &Arc<Self>, cancel_token: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            if let Err(e) = manager.transport.start_discovery().await {
                warn!("Failed to start adapter discovery: {}", e);
            }

            let mut ticker = interval(manager.config.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("Discovery cancelled, shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        manager.scan().await;
                    }
                }
            }
        })
    }

    /// Run one scan. Returns the addresses registered by this scan.
    pub async fn scan(self: &Arc<Self>) -> Vec<String> {
        let addresses = match self.transport.list_devices().await {
            Ok(addresses) => addresses,
            Err(e) => {
                warn!("Scan failed: {}", e);
                return Vec::new();
            }
        };

        let mut registered = Vec::new();
        for address in addresses {
            if self.is_blacklisted(&address).await {
                continue;
            }
            if let Some(device) = self.device(&address).await {
                device.touch().await;
                continue;
            }

            let name = match self.transport.device_name(&address).await {
                Ok(Some(name)) => name,
                Ok(None) => continue,
                Err(e) => {
                    debug!(address = %address, "Name lookup failed: {}", e);
                    continue;
                }
            };
            let Some((device_type, profile)) = self.profiles.match_name(&name) else {
                continue;
            };

            if let Some(device) = self.register(&address, name, device_type, profile).await {
                registered.push(address);
                self.spawn_attempt(device);
            }
        }

        if !registered.is_empty() {
            debug!(count = registered.len(), "Scan registered new devices");
        }
        registered
    }

    async fn register(
        &self,
        address: &str,
        name: String,
        device_type: DeviceType,
        profile: Arc<DeviceProfile>,
    ) -> Option<Arc<Device>> {
        let device = {
            let mut devices = self.devices.write().await;
            if devices.contains_key(address) || self.blacklist.read().await.contains(address) {
                return None;
            }
            let device = Arc::new(Device::new(
                address,
                Some(name),
                device_type,
                profile,
                self.config.buffer_capacity,
                self.events.clone(),
            ));
            devices.insert(address.to_string(), Arc::clone(&device));
            device
        };

        info!(address, %device_type, "Discovered device");
        self.events.send(SystemEvent::DeviceDiscovered {
            device: device.snapshot().await,
        });
        Some(device)
    }

    // --- Connection lifecycle ---

    fn spawn_attempt(self: &Arc<Self>, device: Arc<Device>) {
        let manager = Arc::clone(self);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            if !cancel_token.is_cancelled() {
                manager.attempt_connection(&device).await;
            }
        });
    }

    fn schedule_retry(self: &Arc<Self>, device: Arc<Device>, delay: Duration) {
        let manager = Arc::clone(self);
        let cancel_token = self.cancel_token.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel_token.cancelled() => {}
                _ = sleep(delay) => {
                    if manager.is_registered(device.address()).await {
                        manager.attempt_connection(&device).await;
                    }
                }
            }
        });
    }

    /// Try to connect a device, queueing it if no slot is free.
    ///
    /// Failures follow the reconnect policy; this never returns an error.
    pub async fn attempt_connection(self: &Arc<Self>, device: &Arc<Device>) {
        let address = device.address().to_string();

        {
            let mut pending = self.admission.lock().await;
            if pending.contains(&address) || !self.is_registered(&address).await {
                return;
            }
            if device.state().await == DeviceState::Connected {
                return;
            }

            let occupied = self.connected_count().await + pending.len();
            if occupied >= self.config.max_concurrent_connections {
                self.enqueue(device).await;
                info!(address = %address, occupied, "Connection cap reached, queued device");
                return;
            }
            pending.insert(address.clone());
        }

        let result = self.connections.connect(device).await;
        self.admission.lock().await.remove(&address);

        match result {
            Ok(()) => {}
            Err(Error::Cancelled) => {
                debug!(address = %address, "Connection attempt cancelled");
                self.promote_next().await;
            }
            Err(e) => {
                device.set_state(DeviceState::Error).await;
                self.events.send(SystemEvent::DeviceError {
                    address: address.clone(),
                    error: e.to_string(),
                });
                self.promote_next().await;
                if e.is_retryable() {
                    self.apply_reconnect_policy(device).await;
                } else {
                    warn!(address = %address, "Not retrying, forgetting device: {}", e);
                    self.unregister(device).await;
                }
            }
        }
    }

    async fn enqueue(&self, device: &Arc<Device>) {
        {
            let mut queue = self.queue.lock().await;
            if !queue.iter().any(|queued| queued == device.address()) {
                queue.push_back(device.address().to_string());
            }
        }
        device.set_state(DeviceState::Queued).await;
    }

    /// Drop a device from the registry so a later scan can pick it up again.
    async fn unregister(&self, device: &Arc<Device>) {
        let address = device.address();
        self.devices.write().await.remove(address);
        self.queue.lock().await.retain(|queued| queued != address);
        device.detach_link().await;
    }

    /// Start an attempt for the oldest queued device still registered.
    ///
    /// Returns whether a device was promoted.
    async fn promote_next(self: &Arc<Self>) -> bool {
        loop {
            let Some(address) = self.queue.lock().await.pop_front() else {
                return false;
            };
            match self.device(&address).await {
                Some(device) => {
                    debug!(address = %address, "Promoting queued device");
                    self.spawn_attempt(device);
                    return true;
                }
                None => debug!(address = %address, "Skipping stale queue entry"),
            }
        }
    }

    async fn apply_reconnect_policy(self: &Arc<Self>, device: &Arc<Device>) {
        let policy = device.profile().reconnect_policy();
        let attempts = device.connection_attempts().await;

        if policy.should_retry(attempts) {
            let delay = policy.delay_for_attempt(attempts);
            info!(
                address = %device.address(),
                attempts,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            self.schedule_retry(Arc::clone(device), delay);
        } else {
            warn!(address = %device.address(), attempts, "Reconnect attempts exhausted");
            self.handle_disconnection(device).await;
        }
    }

    /// React to a lost or failed link.
    ///
    /// The link is torn down (best effort) and counted. The device then
    /// reconnects immediately if it has attempts left, otherwise it is
    /// blacklisted. A device that gives up its slot to a queued device
    /// goes to the back of the queue instead of competing for the slot.
    pub async fn handle_disconnection(self: &Arc<Self>, device: &Arc<Device>) {
        let was_connected = device.state().await == DeviceState::Connected;

        if let Err(e) = self.connections.disconnect(device).await {
            debug!(address = %device.address(), "Teardown failed: {}", e);
        }
        device.record_disconnection().await;

        let promoted = was_connected && self.promote_next().await;

        let policy = device.profile().reconnect_policy();
        if !policy.should_retry(device.connection_attempts().await) {
            self.blacklist_device(device).await;
        } else if promoted {
            info!(address = %device.address(), "Reconnect queued behind waiting device");
            self.enqueue(device).await;
        } else {
            info!(address = %device.address(), "Reconnecting");
            self.spawn_attempt(Arc::clone(device));
        }
    }

    async fn blacklist_device(&self, device: &Arc<Device>) {
        let address = device.address();
        {
            let mut devices = self.devices.write().await;
            let mut blacklist = self.blacklist.write().await;
            devices.remove(address);
            blacklist.insert(address.to_string());
        }
        self.queue.lock().await.retain(|queued| queued != address);
        device.detach_link().await;

        warn!(address, "Device blacklisted");
        self.events.send(SystemEvent::DeviceBlacklisted {
            address: address.to_string(),
        });
    }

    /// Spawn the supervisor that reacts to link signals.
    pub fn start_supervisor(
        self: &Arc<Self>,
        mut signals: SignalReceiver,
        cancel_token: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("Supervisor cancelled, shutting down");
                        break;
                    }
                    signal = signals.recv() => {
                        let Some(signal) = signal else { break };
                        // One task per signal: a hung teardown must not stall other devices.
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move { manager.handle_signal(signal).await });
                    }
                }
            }
        })
    }

    async fn handle_signal(self: &Arc<Self>, signal: LinkSignal) {
        match signal {
            LinkSignal::KeepAliveFailed { address, missed } => {
                let Some(device) = self.device(&address).await else {
                    return;
                };
                warn!(address = %address, missed, "Link lost");
                self.events.send(SystemEvent::DeviceError {
                    address,
                    error: Error::KeepAliveFailed { missed }.to_string(),
                });
                self.handle_disconnection(&device).await;
            }
        }
    }

    /// Disconnect a device on request. It stays registered and is not
    /// reconnected automatically.
    pub async fn disconnect_device(self: &Arc<Self>, address: &str) -> Result<()> {
        let device = self
            .device(address)
            .await
            .ok_or_else(|| Error::DeviceNotFound(address.to_string()))?;

        let was_connected = device.state().await == DeviceState::Connected;
        self.queue.lock().await.retain(|queued| queued != address);

        let result = self.connections.disconnect(&device).await;
        if was_connected {
            device.record_disconnection().await;
            self.promote_next().await;
        }
        result
    }

    // --- Queries ---

    /// A registered device.
    pub async fn device(&self, address: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(address).cloned()
    }

    /// Whether `address` is registered.
    pub async fn is_registered(&self, address: &str) -> bool {
        self.devices.read().await.contains_key(address)
    }

    /// Whether `address` is blacklisted.
    pub async fn is_blacklisted(&self, address: &str) -> bool {
        self.blacklist.read().await.contains(address)
    }

    /// Blacklisted addresses, sorted.
    pub async fn blacklisted(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.blacklist.read().await.iter().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Queued addresses in promotion order.
    pub async fn queued_addresses(&self) -> Vec<String> {
        self.queue.lock().await.iter().cloned().collect()
    }

    /// Snapshots of all registered devices, sorted by address.
    pub async fn all_devices(&self) -> Vec<DeviceSnapshot> {
        let devices: Vec<Arc<Device>> = self.devices.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(devices.len());
        for device in devices {
            snapshots.push(device.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.address.cmp(&b.address));
        snapshots
    }

    /// Number of devices in `Connected`.
    pub async fn connected_count(&self) -> usize {
        let devices: Vec<Arc<Device>> = self.devices.read().await.values().cloned().collect();
        let mut count = 0;
        for device in devices {
            if device.state().await == DeviceState::Connected {
                count += 1;
            }
        }
        count
    }

    /// Device counts by state.
    pub async fn device_stats(&self) -> DeviceCounts {
        let devices: Vec<Arc<Device>> = self.devices.read().await.values().cloned().collect();
        let mut by_state = BTreeMap::new();
        for device in &devices {
            *by_state.entry(device.state().await).or_insert(0) += 1;
        }

        DeviceCounts {
            total: devices.len(),
            connected: by_state.get(&DeviceState::Connected).copied().unwrap_or(0),
            queued: self.queue.lock().await.len(),
            blacklisted: self.blacklist.read().await.len(),
            by_state,
        }
    }
}
