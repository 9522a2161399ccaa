//! MODBUS-over-BLE register discovery: the codec, encryption handshake, AES-CBC
//! transport framing, BLE client, and adaptive register scanner for a consumer
//! power station that answers MODBUS requests over a GATT write/notify pair.
//!
//! Device selection, persistent storage, field parsing, device-type recognition,
//! and export are external collaborators this crate does not implement; see
//! `ble::link::BleLink` and `store::ResultStore` for the seams they plug into.

pub mod ble;
pub mod crc;
pub mod crypto;
pub mod error;
pub mod modbus;
pub mod scanner;
pub mod store;

#[cfg(feature = "mock")]
pub mod mock;

pub use ble::{Client, ClientState};
pub use crypto::KeyBundle;
pub use error::{Error, Result};
pub use scanner::{Scanner, ScanRange};
pub use store::{InMemoryResultStore, RegisterResult, ResultStore};
