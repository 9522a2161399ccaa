//! The in-process GATT + MODBUS + failure-injection test scaffold.
//! `MockDevice` implements `BleLink` directly, so it plugs into `Client` exactly
//! like `PeripheralLink` does. The client cannot tell the difference.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::ble::link::{BleLink, LinkEvent};
use crate::crc;
use crate::crypto::{AesCbcKey, Handshake, KeyBundle, Role};
use crate::crypto::aes_cbc;
use crate::error::{Error, Result};
use crate::modbus;

/// One queued failure. `timeout` and `crc_error` compose (both fire on the same
/// exchange); `connection_error` and `canned_response` are exclusive in practice
/// but not enforced as such.
#[derive(Debug, Clone, Default)]
pub struct InjectedFailure {
    pub timeout: bool,
    pub crc_error: bool,
    pub connection_error: bool,
    pub canned_response: Option<Vec<u8>>,
}

struct Inner {
    registers: HashMap<u16, [u8; 2]>,
    readable_ranges: Vec<(u16, u16)>,
    writable_ranges: Vec<(u16, u16)>,
    failures: VecDeque<InjectedFailure>,
    notify_tx: Option<mpsc::UnboundedSender<LinkEvent>>,
    connected: bool,
    key_bundle: Option<KeyBundle>,
    handshake: Option<Handshake>,
    session_key: Option<AesCbcKey>,
    response_delay: Option<Duration>,
}

/// A mock power station: sparse register memory, readable/writable range tables,
/// and a FIFO queue of injected failures, optionally wrapped in the same
/// challenge/ECDH handshake a real encrypted device runs.
pub struct MockDevice {
    inner: Arc<Mutex<Inner>>,
    device_id: String,
    device_name: String,
}

impl MockDevice {
    pub fn new(device_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                registers: HashMap::new(),
                readable_ranges: Vec::new(),
                writable_ranges: Vec::new(),
                failures: VecDeque::new(),
                notify_tx: None,
                connected: false,
                key_bundle: None,
                handshake: None,
                session_key: None,
                response_delay: None,
            })),
            device_id: device_id.into(),
            device_name: device_name.into(),
        }
    }

    /// A mock device configured to run the handshake as initiator once notifications
    /// are subscribed, using `bundle` as its side of the key material.
    pub fn with_encryption(
        device_id: impl Into<String>,
        device_name: impl Into<String>,
        bundle: KeyBundle,
    ) -> Self {
        let device = Self::new(device_id, device_name);
        // Synchronous: no other task can be holding the lock yet, this is `new`.
        device.inner.try_lock().unwrap().key_bundle = Some(bundle);
        device
    }

    pub async fn set_readable_range(&self, start: u16, end: u16) {
        self.inner.lock().await.readable_ranges.push((start, end));
    }

    pub async fn set_writable_range(&self, start: u16, end: u16) {
        self.inner.lock().await.writable_ranges.push((start, end));
    }

    pub async fn set_register(&self, address: u16, value: [u8; 2]) {
        self.inner.lock().await.registers.insert(address, value);
    }

    pub async fn inject_timeout(&self) {
        self.push_failure(InjectedFailure {
            timeout: true,
            ..Default::default()
        })
        .await;
    }

    pub async fn inject_crc_error(&self) {
        self.push_failure(InjectedFailure {
            crc_error: true,
            ..Default::default()
        })
        .await;
    }

    pub async fn inject_connection_error(&self) {
        self.push_failure(InjectedFailure {
            connection_error: true,
            ..Default::default()
        })
        .await;
    }

    pub async fn inject_canned_response(&self, response: Vec<u8>) {
        self.push_failure(InjectedFailure {
            canned_response: Some(response),
            ..Default::default()
        })
        .await;
    }

    async fn push_failure(&self, failure: InjectedFailure) {
        self.inner.lock().await.failures.push_back(failure);
    }

    /// Adds an artificial delay before the mock answers a request, used by tests
    /// that exercise the client's single-flight rejection.
    pub async fn set_delay_before_response(&self, delay: Duration) {
        self.inner.lock().await.response_delay = Some(delay);
    }

    /// Simulates an OS-signalled loss of the GATT connection.
    pub async fn force_disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.connected = false;
        if let Some(tx) = &inner.notify_tx {
            let _ = tx.send(LinkEvent::Disconnected);
        }
        inner.notify_tx = None;
    }
}

fn in_any_range(ranges: &[(u16, u16)], address: u16, qty: u16) -> bool {
    let end = address.saturating_add(qty);
    ranges.iter().any(|&(start, range_end)| address >= start && end <= range_end)
}

fn exception_response(function: u8, code: u8) -> Vec<u8> {
    let mut response = vec![modbus::SLAVE_ADDRESS, function | 0x80, code];
    crc::append_crc(&mut response);
    response
}

/// Handles one already-validated MODBUS request frame and produces a response
/// frame, mutating `inner`'s register memory for writes. Returns `None` only for
/// function codes this mock doesn't implement.
fn handle_modbus_request(inner: &mut Inner, request: &[u8]) -> Option<Vec<u8>> {
    if request.len() < 4 {
        return None;
    }
    let function = request[1];
    match function {
        modbus::FUNC_READ_HOLDING => {
            if request.len() < 6 {
                return None;
            }
            let address = u16::from_be_bytes([request[2], request[3]]);
            let qty = u16::from_be_bytes([request[4], request[5]]);
            if !in_any_range(&inner.readable_ranges, address, qty) {
                return Some(exception_response(function, 0x02));
            }
            let mut data = Vec::with_capacity(2 * qty as usize);
            for i in 0..qty {
                let value = inner.registers.get(&(address + i)).copied().unwrap_or([0, 0]);
                data.extend_from_slice(&value);
            }
            let mut response = vec![modbus::SLAVE_ADDRESS, function, data.len() as u8];
            response.extend_from_slice(&data);
            crc::append_crc(&mut response);
            Some(response)
        }
        modbus::FUNC_WRITE_SINGLE => {
            if request.len() < 6 {
                return None;
            }
            let address = u16::from_be_bytes([request[2], request[3]]);
            if !in_any_range(&inner.writable_ranges, address, 1) {
                return Some(exception_response(function, 0x02));
            }
            inner.registers.insert(address, [request[4], request[5]]);
            let mut response = request[..6].to_vec();
            crc::append_crc(&mut response);
            Some(response)
        }
        modbus::FUNC_WRITE_MULTIPLE => {
            if request.len() < 7 {
                return None;
            }
            let address = u16::from_be_bytes([request[2], request[3]]);
            let qty = u16::from_be_bytes([request[4], request[5]]);
            let byte_count = request[6] as usize;
            if request.len() < 7 + byte_count {
                return None;
            }
            if !in_any_range(&inner.writable_ranges, address, qty) {
                return Some(exception_response(function, 0x02));
            }
            let data = &request[7..7 + byte_count];
            for i in 0..qty {
                let offset = (2 * i) as usize;
                inner.registers.insert(address + i, [data[offset], data[offset + 1]]);
            }
            let mut response = vec![modbus::SLAVE_ADDRESS, function];
            response.extend_from_slice(&address.to_be_bytes());
            response.extend_from_slice(&qty.to_be_bytes());
            crc::append_crc(&mut response);
            Some(response)
        }
        _ => None,
    }
}

#[async_trait]
impl BleLink for MockDevice {
    async fn connect(&self) -> Result<()> {
        self.inner.lock().await.connected = true;
        Ok(())
    }

    async fn disconnect(&self) {
        let mut inner = self.inner.lock().await;
        inner.connected = false;
        inner.notify_tx = None;
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if !inner.connected {
            return Err(Error::Disconnected);
        }

        // Still running the handshake: feed this frame into it instead of treating
        // it as a MODBUS command.
        if let Some(mut handshake) = inner.handshake.take() {
            let outgoing = handshake.advance(Some(data))?;
            if handshake.is_complete() {
                inner.session_key = handshake.session_aes_key().map(AesCbcKey::Aes256);
            } else {
                inner.handshake = Some(handshake);
            }
            if let Some(frame) = outgoing {
                if let Some(tx) = inner.notify_tx.clone() {
                    tokio::spawn(async move {
                        let _ = tx.send(LinkEvent::Notification(frame));
                    });
                }
            }
            return Ok(());
        }

        let plaintext = match &inner.session_key {
            Some(key) => aes_cbc::decrypt_frame(data, key, None)?,
            None => data.to_vec(),
        };

        let failure = inner.failures.pop_front().unwrap_or_default();
        if failure.connection_error {
            inner.connected = false;
            if let Some(tx) = inner.notify_tx.take() {
                let _ = tx.send(LinkEvent::Disconnected);
            }
            return Ok(());
        }

        let mut response = match failure.canned_response {
            Some(canned) => canned,
            None => match handle_modbus_request(&mut inner, &plaintext) {
                Some(r) => r,
                None => return Ok(()),
            },
        };

        if failure.crc_error && response.len() >= 2 {
            let last = response.len() - 1;
            response[last] ^= 0xFF;
        }

        if failure.timeout {
            // Swallow the response entirely; the client's own deadline fires.
            return Ok(());
        }

        let outgoing = match &inner.session_key {
            Some(key) => aes_cbc::encrypt_frame(&response, key, None)?,
            None => response,
        };
        let tx = inner.notify_tx.clone();
        let delay = inner.response_delay;
        drop(inner);
        if let Some(tx) = tx {
            tokio::spawn(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                let _ = tx.send(LinkEvent::Notification(outgoing));
            });
        }
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::UnboundedReceiver<LinkEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;
        inner.notify_tx = Some(tx.clone());

        if let Some(bundle) = inner.key_bundle.clone() {
            let mut handshake = Handshake::new(Role::Initiator, bundle);
            // Unsolicited state-1 challenge, sent shortly after subscription. Real
            // enough to exercise the client's encryption auto-detection window
            // without racing it.
            let first = handshake.advance(None)?.expect("initiator always opens");
            inner.handshake = Some(handshake);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = tx.send(LinkEvent::Notification(first));
            });
        }

        Ok(rx)
    }

    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn device_name(&self) -> String {
        self.device_name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::Client;

    #[tokio::test]
    async fn canned_response_overrides_computed_one() {
        let mock = Arc::new(MockDevice::new("dev-1", "Station"));
        mock.set_readable_range(0, 10).await;
        let mut canned = vec![0x01, 0x03, 0x02, 0xDE, 0xAD];
        crc::append_crc(&mut canned);
        mock.inject_canned_response(canned.clone()).await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        let data = client.read_registers(0, 1, None).await.unwrap();
        assert_eq!(data, vec![0xDE, 0xAD]);
    }

    #[tokio::test]
    async fn write_outside_writable_range_is_modbus_exception() {
        let mock = Arc::new(MockDevice::new("dev-1", "Station"));
        mock.set_writable_range(0, 5).await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        let err = client.write_registers(50, &[0x00, 0x01], None).await.unwrap_err();
        assert!(matches!(err, Error::ModbusException { code: 2 }));
    }

    #[tokio::test]
    async fn timeout_and_crc_error_compose_on_one_injected_failure() {
        let mock = Arc::new(MockDevice::new("dev-1", "Station"));
        mock.set_readable_range(0, 10).await;
        mock.push_failure(InjectedFailure {
            timeout: true,
            crc_error: true,
            ..Default::default()
        })
        .await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        let err = client
            .read_registers(0, 1, Some(Duration::from_millis(150)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // The queued failure is consumed exactly once; the next read succeeds.
        let data = client.read_registers(0, 1, None).await.unwrap();
        assert_eq!(data.len(), 2);
    }
}
