//! Connection orchestration and ingestion core for BLE acoustic sensors.
//!
//! This crate discovers acoustic field sensors over Bluetooth Low Energy,
//! keeps a bounded number of links open, and turns the newline-delimited
//! summaries the sensors notify into structured readings.
//!
//! # Features
//!
//! - **Discovery**: Periodic listing of nearby peripherals, matched by
//!   advertised name against the configured device profiles
//! - **Bounded links**: At most `max_concurrent_connections` devices are
//!   connected; the rest wait in a FIFO queue
//! - **Keep-alive**: Periodic reads detect silent link loss
//! - **Reconnection**: Linear backoff with a per-profile attempt limit, after
//!   which a device is blacklisted
//! - **Processing**: Raw frames are buffered per device and decoded in
//!   batches on a fixed interval
//! - **Events**: Every state change, error and batch is broadcast as a
//!   [`SystemEvent`]
//!
//! # Quick Start
//!
//! ```no_run
//! use penguard_core::{DataQuery, SensorSystem, SystemConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let system = SensorSystem::open(SystemConfig::default()).await?;
//!     system.start().await?;
//!
//!     for device in system.all_devices().await {
//!         let readings = system.device_data(&device.address, DataQuery::Last(10)).await;
//!         println!("{}: {} readings", device.address, readings.len());
//!     }
//!
//!     system.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Testing without hardware
//!
//! [`MockTransport`] implements [`Transport`] in memory. Pass it to
//! [`SensorSystem::new`] to drive the whole pipeline from tests.

pub mod btle;
pub mod buffer;
pub mod config;
pub mod connection;
pub mod data;
pub mod device;
pub mod error;
pub mod events;
pub mod manager;
pub mod mock;
pub mod profile;
pub mod reconnect;
pub mod system;
pub mod traits;

pub use penguard_types::types;
pub use penguard_types::uuids;

// Core exports
pub use btle::BtleTransport;
pub use buffer::RingBuffer;
pub use config::SystemConfig;
pub use connection::{ConnectionManager, LinkSignal, SignalReceiver, SignalSender};
pub use data::{DataManager, DataQuery, FrameDecoder, ProcessingSummary, SummaryLineDecoder};
pub use device::{Device, DeviceSnapshot, DeviceStats, ErrorRecord};
pub use error::{Error, ErrorCategory, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, SystemEvent};
pub use manager::{DeviceCounts, DeviceManager, ManagerConfig};
pub use mock::{MockPeripheral, MockTransport};
pub use profile::{DeviceProfile, ProfileTable};
pub use reconnect::ReconnectPolicy;
pub use system::{SensorSystem, SystemPhase, SystemStatus};
pub use traits::{CharacteristicFlag, CharacteristicRef, NotificationStream, ServiceRef, Transport};

// Re-export from penguard-types
pub use penguard_types::{
    AcousticSummary, ConnectionHealth, DeviceState, DeviceType, ProcessedReading, RawFrame,
    ReadingOutcome,
};
