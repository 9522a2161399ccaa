//! The production `BleLink`, backed by `btleplug`: write-with-response outbound,
//! a subscribed notification stream inbound, adapted to this protocol's
//! service/characteristic UUIDs.

use async_trait::async_trait;
use btleplug::api::{Characteristic, Peripheral as _, WriteType};
use futures::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::ble::link::{BleLink, LinkEvent};
use crate::ble::{NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID};
use crate::error::{Error, Result};

pub struct PeripheralLink {
    peripheral: btleplug::platform::Peripheral,
    name: String,
}

impl PeripheralLink {
    pub fn new(peripheral: btleplug::platform::Peripheral, name: String) -> Self {
        Self { peripheral, name }
    }

    fn find_characteristic(&self, uuid_str: &str) -> Result<Characteristic> {
        let uuid = Uuid::parse_str(uuid_str)
            .expect("characteristic UUID constants are valid by construction");
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| Error::Transport(format!("characteristic {uuid_str} not found")))
    }
}

#[async_trait]
impl BleLink for PeripheralLink {
    async fn connect(&self) -> Result<()> {
        self.peripheral
            .connect()
            .await
            .map_err(|e| Error::Transport(format!("GATT connect failed: {e}")))?;
        self.peripheral
            .discover_services()
            .await
            .map_err(|e| Error::Transport(format!("service discovery failed: {e}")))?;
        let notify = self.find_characteristic(NOTIFY_CHARACTERISTIC_UUID)?;
        self.peripheral
            .subscribe(&notify)
            .await
            .map_err(|e| Error::Transport(format!("notification subscribe failed: {e}")))?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Err(e) = self.peripheral.disconnect().await {
            tracing::debug!(error = %e, "disconnect reported an error, ignoring");
        }
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let write_char = self.find_characteristic(WRITE_CHARACTERISTIC_UUID)?;
        self.peripheral
            .write(&write_char, data, WriteType::WithResponse)
            .await
            .map_err(|e| Error::Transport(format!("characteristic write failed: {e}")))
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<LinkEvent>> {
        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| Error::Transport(format!("failed to obtain notification stream: {e}")))?;
        let notify_uuid = Uuid::parse_str(NOTIFY_CHARACTERISTIC_UUID)
            .expect("characteristic UUID constants are valid by construction");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = notifications.next().await {
                if event.uuid == notify_uuid && tx.send(LinkEvent::Notification(event.value)).is_err() {
                    return;
                }
            }
            let _ = tx.send(LinkEvent::Disconnected);
        });
        Ok(rx)
    }

    fn device_id(&self) -> String {
        self.peripheral.id().to_string()
    }

    fn device_name(&self) -> String {
        self.name.clone()
    }
}
