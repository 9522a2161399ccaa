//! BLE transport: the protocol's bit-exact constants, the transport-agnostic
//! `BleLink` seam, a `btleplug`-backed production adapter, and the single-flight
//! request/response client built on top of it.

pub mod client;
pub mod link;
pub mod peripheral;

pub use client::{Client, ClientState};
pub use link::BleLink;
pub use peripheral::PeripheralLink;

use std::time::Duration;

/// GATT service UUID, as a 16-bit alias. `0000ff00-0000-1000-8000-00805f9b34fb`.
pub const SERVICE_UUID_SHORT: u16 = 0xFF00;

/// Write characteristic (commands outbound): `0000ff02-0000-1000-8000-00805f9b34fb`.
pub const WRITE_CHARACTERISTIC_UUID: &str = "0000ff02-0000-1000-8000-00805f9b34fb";

/// Notify characteristic (responses inbound): `0000ff01-0000-1000-8000-00805f9b34fb`.
pub const NOTIFY_CHARACTERISTIC_UUID: &str = "0000ff01-0000-1000-8000-00805f9b34fb";

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const ENCRYPTION_DETECTION_WINDOW: Duration = Duration::from_millis(500);
pub const MTU: usize = 20;
pub const MAX_REGISTERS_PER_REQUEST: u16 = 7;
