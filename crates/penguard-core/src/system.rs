//! The sensor system facade.
//!
//! [`SensorSystem`] wires the transport, the three managers and the event
//! stream together and owns their background tasks.
//!
//! ```text
//!            +-------------------+
//!            |   SensorSystem    |---- subscribe() ----> SystemEvent stream
//!            +-------------------+
//!              |       |       |
//!              v       v       v
//!   DeviceManager  ConnectionManager  DataManager
//!        |   ^  link   |      | notifications ^
//!        |   +-signals-+      +---------------+
//!        v                    v
//!              Transport (btleplug or mock)
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use penguard_types::ProcessedReading;

use crate::btle::BtleTransport;
use crate::config::SystemConfig;
use crate::connection::{ConnectionManager, SignalReceiver, signal_channel};
use crate::data::{DataManager, DataQuery};
use crate::device::DeviceSnapshot;
use crate::error::{Error, Result};
use crate::events::{EventDispatcher, EventReceiver, SystemEvent};
use crate::manager::{DeviceCounts, DeviceManager, ManagerConfig};
use crate::traits::Transport;

/// Lifecycle phase of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemPhase {
    /// Created, adapter not checked yet.
    NotInitialized,
    /// Adapter checked and powered.
    Initialized,
    /// Discovery and processing running.
    Running,
    /// Shut down; the transport has been released.
    Stopped,
}

/// System-wide status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Lifecycle phase.
    pub status: SystemPhase,
    /// Device counts.
    pub devices: DeviceCounts,
    /// Devices with an active link.
    pub active_connections: usize,
    /// Whether the adapter reports power.
    pub adapter_powered: bool,
    /// Whether the adapter is scanning.
    pub discovering: bool,
}

struct Runtime {
    phase: SystemPhase,
    signals: Option<SignalReceiver>,
    tasks: Vec<JoinHandle<()>>,
}

/// BLE ingestion system: discovery, connections and data processing.
///
/// # Example
///
/// ```no_run
/// use penguard_core::{DataQuery, SensorSystem, SystemConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let system = SensorSystem::open(SystemConfig::default()).await?;
///     let mut events = system.subscribe();
///     system.start().await?;
///
///     while let Ok(event) = events.recv().await {
///         println!("{event:?}");
///     }
///
///     system.shutdown().await?;
///     Ok(())
/// }
/// ```
pub struct SensorSystem {
    config: SystemConfig,
    transport: Arc<dyn Transport>,
    events: EventDispatcher,
    devices: Arc<DeviceManager>,
    connections: Arc<ConnectionManager>,
    data: Arc<DataManager>,
    cancel_token: CancellationToken,
    runtime: Mutex<Runtime>,
}

impl std::fmt::Debug for SensorSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorSystem")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SensorSystem {
    /// Build a system over the given transport.
    pub fn new(config: SystemConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let events = EventDispatcher::new(config.event_capacity);
        let cancel_token = CancellationToken::new();
        let (signal_tx, signal_rx) = signal_channel();

        let data = Arc::new(DataManager::new(
            events.clone(),
            config.max_buffer_size,
            config.max_batch_size,
            config.processing_interval,
        ));
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&transport),
            Arc::clone(&data),
            signal_tx,
            config.reset_delay,
            cancel_token.child_token(),
        ));
        let devices = Arc::new(DeviceManager::new(
            Arc::clone(&transport),
            Arc::clone(&connections),
            config.profiles.clone(),
            events.clone(),
            ManagerConfig {
                max_concurrent_connections: config.max_concurrent_connections,
                scan_interval: config.scan_interval,
                buffer_capacity: config.max_buffer_size,
            },
            cancel_token.child_token(),
        ));

        Ok(Self {
            config,
            transport,
            events,
            devices,
            connections,
            data,
            cancel_token,
            runtime: Mutex::new(Runtime {
                phase: SystemPhase::NotInitialized,
                signals: Some(signal_rx),
                tasks: Vec::new(),
            }),
        })
    }

    /// Build a system over the first btleplug adapter.
    pub async fn open(config: SystemConfig) -> Result<Self> {
        let transport = BtleTransport::new().await?;
        Self::new(config, Arc::new(transport))
    }

    /// Check the adapter, powering it on if needed. Idempotent.
    pub async fn initialize(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        self.initialize_locked(&mut runtime).await
    }

    async fn initialize_locked(&self, runtime: &mut Runtime) -> Result<()> {
        match runtime.phase {
            SystemPhase::Stopped => return Err(Error::ShutDown),
            SystemPhase::Initialized | SystemPhase::Running => return Ok(()),
            SystemPhase::NotInitialized => {}
        }

        if !self.adapter_powered().await? {
            info!("Adapter is powered off, trying to power it on");
            if let Err(e) = self.transport.power_on().await {
                error!("Failed to power on adapter: {}", e);
                return Err(Error::adapter_unavailable(format!(
                    "failed to power on adapter: {e}"
                )));
            }
            sleep(self.config.power_on_delay).await;

            if !self.adapter_powered().await? {
                error!("Adapter still powered off");
                return Err(Error::adapter_unavailable("adapter did not power on"));
            }
        }

        runtime.phase = SystemPhase::Initialized;
        info!("Sensor system initialized");
        Ok(())
    }

    async fn adapter_powered(&self) -> Result<bool> {
        self.transport
            .is_powered()
            .await
            .map_err(|e| Error::adapter_unavailable(e.to_string()))
    }

    /// Start discovery, processing and link supervision.
    ///
    /// Initializes first if needed. Calling `start` on a running system is a
    /// no-op.
    pub async fn start(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        match runtime.phase {
            SystemPhase::Running => return Ok(()),
            SystemPhase::Stopped => return Err(Error::ShutDown),
            SystemPhase::NotInitialized | SystemPhase::Initialized => {}
        }
        self.initialize_locked(&mut runtime).await?;

        if let Some(signals) = runtime.signals.take() {
            let supervisor = self
                .devices
                .start_supervisor(signals, self.cancel_token.child_token());
            runtime.tasks.push(supervisor);
        }
        let discovery = self
            .devices
            .start_discovery(self.cancel_token.child_token());
        let processing = self
            .data
            .start_processing(self.cancel_token.child_token());
        runtime.tasks.extend([discovery, processing]);

        runtime.phase = SystemPhase::Running;
        info!(
            max_connections = self.config.max_concurrent_connections,
            "Sensor system started"
        );
        self.events.send(SystemEvent::SystemStarted {
            timestamp: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    /// Stop everything and release the transport.
    ///
    /// Links are closed concurrently; individual failures are logged and do
    /// not stop the shutdown. The transport is released exactly once and a
    /// second call is a no-op. Returns the release result.
    pub async fn shutdown(&self) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.phase == SystemPhase::Stopped {
            debug!("Shutdown already completed");
            return Ok(());
        }
        info!("Shutting down sensor system");

        self.cancel_token.cancel();
        for task in runtime.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        let results = self.connections.disconnect_all().await;
        let failures = results.values().filter(|result| result.is_err()).count();
        for (address, result) in &results {
            if let Err(e) = result {
                warn!(address = %address, "Disconnect during shutdown failed: {}", e);
            }
        }
        info!(
            disconnected = results.len() - failures,
            failures, "Closed device links"
        );

        if let Err(e) = self.transport.stop_discovery().await {
            debug!("Stopping adapter discovery failed: {}", e);
        }
        let released = self.transport.release().await;
        if let Err(e) = &released {
            warn!("Releasing transport failed: {}", e);
        }

        runtime.phase = SystemPhase::Stopped;
        info!("Sensor system stopped");
        self.events.send(SystemEvent::SystemStopped {
            timestamp: OffsetDateTime::now_utc(),
        });
        released
    }

    // --- Queries ---

    /// Subscribe to system events.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Snapshots of all registered devices.
    pub async fn all_devices(&self) -> Vec<DeviceSnapshot> {
        self.devices.all_devices().await
    }

    /// Processed readings of a device.
    pub async fn device_data(&self, address: &str, query: DataQuery) -> Vec<ProcessedReading> {
        self.data.get_device_data(address, query).await
    }

    /// Addresses of connected devices.
    pub async fn active_connections(&self) -> Vec<String> {
        self.connections.active_connections().await
    }

    /// Current lifecycle phase.
    pub async fn phase(&self) -> SystemPhase {
        self.runtime.lock().await.phase
    }

    /// System-wide status.
    pub async fn system_status(&self) -> SystemStatus {
        let status = self.phase().await;
        SystemStatus {
            status,
            devices: self.devices.device_stats().await,
            active_connections: self.connections.active_count().await,
            adapter_powered: self.transport.is_powered().await.unwrap_or(false),
            discovering: self.transport.is_discovering().await.unwrap_or(false),
        }
    }

    /// The device manager.
    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    /// The connection manager.
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// The data manager.
    pub fn data(&self) -> &Arc<DataManager> {
        &self.data
    }

    /// The configuration.
    pub fn config(&self) -> &SystemConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use std::time::Duration;

    fn system(transport: &Arc<MockTransport>) -> SensorSystem {
        let config = SystemConfig::new()
            .scan_interval(Duration::from_millis(50))
            .power_on_delay(Duration::from_millis(10));
        SensorSystem::new(config, transport.clone()).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let transport: Arc<dyn Transport> = Arc::new(MockTransport::new());
        let err =
            SensorSystem::new(SystemConfig::new().max_batch_size(0), transport).unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_powers_on_adapter() {
        let transport = Arc::new(MockTransport::new());
        transport.set_powered(false);
        let system = system(&transport);

        system.initialize().await.unwrap();
        assert_eq!(system.phase().await, SystemPhase::Initialized);
        assert_eq!(transport.power_on_count(), 1);

        // Idempotent.
        system.initialize().await.unwrap();
        assert_eq!(transport.power_on_count(), 1);
    }

    #[tokio::test]
    async fn test_initialize_fails_without_power() {
        let transport = Arc::new(MockTransport::new());
        transport.set_powered(false);
        transport.set_can_power_on(false);
        let system = system(&transport);

        let err = system.initialize().await.unwrap_err();
        assert!(matches!(err, Error::AdapterUnavailable(_)));
        assert!(err.is_fatal());
        assert_eq!(system.phase().await, SystemPhase::NotInitialized);
        assert!(system.start().await.is_err());
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let transport = Arc::new(MockTransport::new());
        let system = system(&transport);
        let mut rx = system.subscribe();

        system.start().await.unwrap();
        system.start().await.unwrap();
        assert_eq!(system.phase().await, SystemPhase::Running);
        assert!(matches!(
            rx.recv().await.unwrap(),
            SystemEvent::SystemStarted { .. }
        ));

        system.shutdown().await.unwrap();
        assert_eq!(system.phase().await, SystemPhase::Stopped);
        assert_eq!(transport.release_count(), 1);

        system.shutdown().await.unwrap();
        assert_eq!(transport.release_count(), 1);
        assert!(matches!(system.start().await, Err(Error::ShutDown)));
        assert!(matches!(system.initialize().await, Err(Error::ShutDown)));
    }

    #[tokio::test]
    async fn test_status_before_start() {
        let transport = Arc::new(MockTransport::new());
        let system = system(&transport);

        let status = system.system_status().await;
        assert_eq!(status.status, SystemPhase::NotInitialized);
        assert_eq!(status.devices.total, 0);
        assert_eq!(status.active_connections, 0);
        assert!(status.adapter_powered);
        assert!(!status.discovering);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "not_initialized");
    }
}
