//! Bluetooth UUIDs used by penguard field devices.
//!
//! The detector firmware exposes its summary line through either the standard
//! battery service or a vendor service, depending on the build flashed onto it.

use uuid::{Uuid, uuid};

// --- Standard BLE Service UUIDs ---

/// Battery service (0x180F).
pub const BATTERY_SERVICE: Uuid = uuid!("0000180f-0000-1000-8000-00805f9b34fb");

// --- Standard BLE Characteristic UUIDs ---

/// Battery level characteristic (0x2A19).
pub const BATTERY_LEVEL: Uuid = uuid!("00002a19-0000-1000-8000-00805f9b34fb");

// --- Detector vendor UUIDs ---

/// Detector vendor service.
pub const DETECTOR_SERVICE: Uuid = uuid!("4fafc201-1fb5-459e-8fcc-c5c9c331914b");

/// Detector summary characteristic (notify + read).
pub const DETECTOR_SUMMARY: Uuid = uuid!("beb5483e-36e1-4688-b7f5-ea07361b26a8");

/// Expand a 16-bit Bluetooth SIG short UUID onto the base UUID.
#[must_use]
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}
