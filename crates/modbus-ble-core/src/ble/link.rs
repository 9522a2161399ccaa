//! The transport-agnostic seam `Client` is built against. The device handle and
//! the BLE transport binding's own discipline are treated as an external
//! collaborator; this trait is the interface through which `Client` consumes it,
//! with `PeripheralLink` (real `btleplug` hardware) and the test mock as the two
//! implementations.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// One event out of a link's notification stream.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A GATT notification payload arrived on the notify characteristic.
    Notification(Vec<u8>),
    /// The OS/transport signalled loss of the GATT connection.
    Disconnected,
}

/// A connected (or connectable) BLE peripheral exposing the write/notify
/// characteristic pair this protocol speaks.
#[async_trait]
pub trait BleLink: Send + Sync {
    /// Acquires GATT, discovers the service/characteristics, and subscribes to
    /// notifications. Idempotent: calling it again after a clean disconnect
    /// re-establishes the link.
    async fn connect(&self) -> Result<()>;

    /// Tears down the GATT connection. Always succeeds from the caller's point of
    /// view; the underlying transport's own disconnect errors are logged, not
    /// propagated, since the client treats "disconnected" as the end state either way.
    async fn disconnect(&self);

    /// Writes `data` to the write characteristic, with response.
    async fn write(&self, data: &[u8]) -> Result<()>;

    /// Returns a receiver for this link's event stream. `connect()` must have
    /// already subscribed before this is called; each call to `connect()` produces
    /// a fresh stream (and thus a fresh receiver).
    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<LinkEvent>>;

    /// A stable identifier for the device, suitable as a `ResultStore` key.
    fn device_id(&self) -> String;

    /// The device's advertised/local name, where available.
    fn device_name(&self) -> String;
}
