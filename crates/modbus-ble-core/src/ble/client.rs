//! The single-flight request/response client: GATT connect, encryption
//! auto-detection, the handshake, and the MODBUS request/response pipeline, with
//! reconnect-on-demand and deadline-carrying timeouts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};

use crate::ble::link::{BleLink, LinkEvent};
use crate::ble::{DEFAULT_RESPONSE_TIMEOUT, ENCRYPTION_DETECTION_WINDOW, MTU};
use crate::crypto::{aes_cbc, AesCbcKey, Handshake, KeyBundle, Role};
use crate::error::{Error, Result};
use crate::modbus;

/// The client's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Detached,
    Connecting,
    Idle,
    Handshaking,
    Ready,
    Busy,
}

struct State {
    phase: ClientState,
    notifications: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    session_key: Option<AesCbcKey>,
}

/// The host-facing client. `Client::new` stands in for
/// `Client.request(key_bundle?)`. Device selection (BLE scanning) is an external
/// collaborator; callers hand in an already-chosen `BleLink`.
///
/// Cheaply `Clone`: all state lives behind `Arc`s, so cloned handles share one
/// underlying connection and one in-flight slot. The single-flight guarantee is
/// enforced with `Mutex::try_lock` rather than a queue. A concurrent call on any
/// clone while one is in flight fails fast with `Concurrency` instead of waiting.
#[derive(Clone)]
pub struct Client {
    link: Arc<dyn BleLink>,
    key_bundle: Option<KeyBundle>,
    state: Arc<Mutex<State>>,
}

impl Client {
    pub fn new(link: Arc<dyn BleLink>, key_bundle: Option<KeyBundle>) -> Self {
        Self {
            link,
            key_bundle,
            state: Arc::new(Mutex::new(State {
                phase: ClientState::Detached,
                notifications: None,
                session_key: None,
            })),
        }
    }

    pub fn id(&self) -> String {
        self.link.device_id()
    }

    pub fn device_name(&self) -> String {
        self.link.device_name()
    }

    pub async fn is_connected(&self) -> bool {
        !matches!(self.state.lock().await.phase, ClientState::Detached)
    }

    pub async fn is_encrypted(&self) -> bool {
        self.state.lock().await.session_key.is_some()
    }

    /// Establishes the GATT link, subscribes to notifications, and (if a key
    /// bundle was supplied) runs the encryption auto-detection window and, if
    /// triggered, the full handshake.
    pub async fn connect(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT);
        let mut guard = self.state.try_lock().map_err(|_| Error::Concurrency)?;
        self.connect_locked(&mut guard, deadline).await
    }

    async fn connect_locked(&self, state: &mut State, deadline: Instant) -> Result<()> {
        state.phase = ClientState::Connecting;
        timeout_at(deadline, self.link.connect())
            .await
            .map_err(|_| Error::Timeout)??;
        let mut rx = timeout_at(deadline, self.link.subscribe())
            .await
            .map_err(|_| Error::Timeout)??;

        let Some(bundle) = self.key_bundle.clone() else {
            state.notifications = Some(rx);
            state.phase = ClientState::Ready;
            return Ok(());
        };

        state.phase = ClientState::Idle;
        let detect_deadline = std::cmp::min(Instant::now() + ENCRYPTION_DETECTION_WINDOW, deadline);
        match timeout_at(detect_deadline, rx.recv()).await {
            Ok(Some(LinkEvent::Notification(first_frame))) => {
                state.notifications = Some(rx);
                state.phase = ClientState::Handshaking;
                self.run_handshake(state, bundle, first_frame, deadline).await?;
                state.phase = ClientState::Ready;
                Ok(())
            }
            Ok(Some(LinkEvent::Disconnected)) | Ok(None) => {
                state.phase = ClientState::Detached;
                Err(Error::Disconnected)
            }
            // No unsolicited challenge arrived before the window closed: plaintext.
            Err(_) => {
                state.notifications = Some(rx);
                state.phase = ClientState::Ready;
                Ok(())
            }
        }
    }

    async fn run_handshake(
        &self,
        state: &mut State,
        bundle: KeyBundle,
        first_frame: Vec<u8>,
        deadline: Instant,
    ) -> Result<()> {
        let mut handshake = Handshake::new(Role::Responder, bundle);
        let mut incoming = first_frame;
        loop {
            if let Some(outgoing) = handshake.advance(Some(&incoming))? {
                timeout_at(deadline, self.link.write(&outgoing))
                    .await
                    .map_err(|_| Error::Timeout)??;
            }
            if handshake.is_complete() {
                break;
            }
            incoming = timeout_at(
                deadline,
                recv_one(state.notifications.as_mut().expect("subscribed before handshaking")),
            )
            .await
            .map_err(|_| Error::Timeout)??;
        }
        state.session_key = handshake.session_aes_key().map(AesCbcKey::Aes256);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.state.lock().await;
        self.link.disconnect().await;
        guard.phase = ClientState::Detached;
        guard.notifications = None;
        guard.session_key = None;
    }

    /// Reads `count` holding registers starting at `start`. `count` must be in
    /// `1..=MAX_REGISTERS_PER_REQUEST` and the resulting response must fit the MTU;
    /// both are checked before any I/O.
    pub async fn read_registers(
        &self,
        start: u16,
        count: u16,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        if count == 0 {
            return Err(Error::invalid_argument("count must be at least 1"));
        }
        // The MTU check subsumes the protocol's per-request register ceiling: at
        // MAX_REGISTERS_PER_REQUEST + 1 the response already overflows the MTU, so
        // `count > 7` is reported as `PacketTooLarge`, matching the boundary case
        // in spec (`read_registers(_, 8)` is a too-large packet, not a bad argument).
        let response_size = modbus::expected_read_response_size(count);
        if response_size > MTU {
            return Err(Error::PacketTooLarge {
                size: response_size,
                limit: MTU,
            });
        }

        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT);
        let mut guard = self.state.try_lock().map_err(|_| Error::Concurrency)?;
        self.ensure_connected(&mut guard, deadline).await?;

        let frame = modbus::build_read_holding(start, count);
        self.request(&mut guard, modbus::FUNC_READ_HOLDING, frame, deadline)
            .await
    }

    /// Writes `data` (an even number of bytes) starting at register `start`. Uses
    /// Write Single Register for a lone register, Write Multiple otherwise.
    pub async fn write_registers(
        &self,
        start: u16,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<()> {
        if data.is_empty() || data.len() % 2 != 0 {
            return Err(Error::invalid_argument(
                "write data must be a non-empty, even number of bytes",
            ));
        }

        let (function, frame) = if data.len() == 2 {
            let value = u16::from_be_bytes([data[0], data[1]]);
            (modbus::FUNC_WRITE_SINGLE, modbus::build_write_single(start, value))
        } else {
            (
                modbus::FUNC_WRITE_MULTIPLE,
                modbus::build_write_multiple(start, data),
            )
        };
        if frame.len() > MTU {
            return Err(Error::PacketTooLarge {
                size: frame.len(),
                limit: MTU,
            });
        }

        let deadline = Instant::now() + timeout.unwrap_or(DEFAULT_RESPONSE_TIMEOUT);
        let mut guard = self.state.try_lock().map_err(|_| Error::Concurrency)?;
        self.ensure_connected(&mut guard, deadline).await?;

        self.request(&mut guard, function, frame, deadline).await?;
        Ok(())
    }

    async fn ensure_connected(&self, state: &mut State, deadline: Instant) -> Result<()> {
        if matches!(state.phase, ClientState::Detached) {
            self.connect_locked(state, deadline).await?;
        }
        Ok(())
    }

    /// The request/response pipeline common to reads and writes: optional
    /// encryption, write, await one notification, optional decryption, validate.
    async fn request(
        &self,
        state: &mut State,
        function: u8,
        frame: Vec<u8>,
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        let outgoing = match &state.session_key {
            Some(key) => aes_cbc::encrypt_frame(&frame, key, None)?,
            None => frame,
        };

        match timeout_at(deadline, self.link.write(&outgoing)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                state.phase = ClientState::Ready;
                return Err(e);
            }
            Err(_) => {
                state.phase = ClientState::Ready;
                return Err(Error::Timeout);
            }
        }

        state.phase = ClientState::Busy;
        let rx = state
            .notifications
            .as_mut()
            .expect("connected clients always hold a notification receiver");
        let raw = match timeout_at(deadline, recv_one(rx)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(Error::Disconnected)) => {
                state.phase = ClientState::Detached;
                state.notifications = None;
                state.session_key = None;
                return Err(Error::Disconnected);
            }
            Ok(Err(other)) => {
                state.phase = ClientState::Ready;
                return Err(other);
            }
            Err(_) => {
                state.phase = ClientState::Ready;
                return Err(Error::Timeout);
            }
        };

        let plaintext = match &state.session_key {
            Some(key) => match aes_cbc::decrypt_frame(&raw, key, None) {
                Ok(p) => p,
                Err(e) => {
                    state.phase = ClientState::Ready;
                    return Err(e);
                }
            },
            None => raw,
        };

        let result = modbus::parse_response(function, &plaintext);
        state.phase = ClientState::Ready;
        result
    }
}

async fn recv_one(rx: &mut mpsc::UnboundedReceiver<LinkEvent>) -> Result<Vec<u8>> {
    match rx.recv().await {
        Some(LinkEvent::Notification(bytes)) => Ok(bytes),
        Some(LinkEvent::Disconnected) | None => Err(Error::Disconnected),
    }
}

#[cfg(all(test, feature = "mock"))]
mod tests {
    use super::*;
    use crate::mock::MockDevice;
    use crate::store::InMemoryResultStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plaintext_mock() -> Arc<MockDevice> {
        Arc::new(MockDevice::new("dev-1", "Test Station"))
    }

    #[tokio::test]
    async fn read_three_registers() {
        let mock = plaintext_mock();
        mock.set_readable_range(0, 100).await;
        mock.set_register(10, [0x00, 0x64]).await;
        mock.set_register(11, [0x00, 0xC8]).await;
        mock.set_register(12, [0x01, 0x2C]).await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        let data = client.read_registers(10, 3, None).await.unwrap();
        assert_eq!(data, vec![0x00, 0x64, 0x00, 0xC8, 0x01, 0x2C]);
    }

    #[tokio::test]
    async fn reading_past_the_per_request_ceiling_is_packet_too_large_not_invalid_argument() {
        let mock = plaintext_mock();
        mock.set_readable_range(0, 100).await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        let err = client.read_registers(0, 8, None).await.unwrap_err();
        assert!(matches!(err, Error::PacketTooLarge { size: 21, limit: 20 }));
    }

    #[tokio::test]
    async fn zero_count_is_invalid_argument() {
        let mock = plaintext_mock();
        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        let err = client.read_registers(0, 0, None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn write_odd_length_data_is_invalid_argument() {
        let mock = plaintext_mock();
        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        let err = client.write_registers(0, &[0xAB], None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn read_out_of_readable_range_is_modbus_exception() {
        let mock = plaintext_mock();
        mock.set_readable_range(0, 100).await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        let err = client.read_registers(200, 1, None).await.unwrap_err();
        assert!(matches!(err, Error::ModbusException { code: 2 }));
    }

    #[tokio::test]
    async fn timeout_then_success() {
        let mock = plaintext_mock();
        mock.set_readable_range(0, 10).await;
        mock.inject_timeout().await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        let err = client
            .read_registers(0, 1, Some(Duration::from_millis(200)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        let data = client.read_registers(0, 1, None).await.unwrap();
        assert_eq!(data.len(), 2);
    }

    #[tokio::test]
    async fn crc_corruption_is_checksum_error() {
        let mock = plaintext_mock();
        mock.set_readable_range(0, 10).await;
        mock.inject_crc_error().await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        let err = client.read_registers(0, 1, None).await.unwrap_err();
        assert!(matches!(err, Error::Checksum(_)));
    }

    #[tokio::test]
    async fn auto_reconnect_after_forced_disconnect() {
        let mock = plaintext_mock();
        mock.set_writable_range(0, 100).await;
        mock.set_readable_range(0, 100).await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();
        mock.force_disconnect().await;
        assert!(!client.is_connected().await);

        client.write_registers(50, &[0xAB, 0xCD], None).await.unwrap();
        let data = client.read_registers(50, 1, None).await.unwrap();
        assert_eq!(data, vec![0xAB, 0xCD]);
    }

    #[tokio::test]
    async fn encrypted_session_round_trip() {
        let (device_bundle, host_bundle) = crate::crypto::key_bundle::test_support::paired_bundles();
        let mock = Arc::new(MockDevice::with_encryption("dev-1", "Encrypted Station", device_bundle));
        mock.set_readable_range(0, 10).await;
        mock.set_register(0, [0x11, 0x22]).await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, Some(host_bundle));
        client.connect(None).await.unwrap();
        assert!(client.is_encrypted().await);

        let data = client.read_registers(0, 1, None).await.unwrap();
        assert_eq!(data, vec![0x11, 0x22]);
    }

    #[tokio::test]
    async fn concurrent_request_yields_concurrency_without_disturbing_the_first() {
        let mock = plaintext_mock();
        mock.set_readable_range(0, 10).await;
        mock.set_delay_before_response(Duration::from_millis(100)).await;

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();

        let first_client = client.clone();
        let first = tokio::spawn(async move { first_client.read_registers(0, 1, None).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = client.read_registers(1, 1, None).await;
        assert!(matches!(second, Err(Error::Concurrency)));

        let first_result = first.await.unwrap();
        assert!(first_result.is_ok());
    }

    #[tokio::test]
    async fn scanner_bisects_an_isolated_unreadable_register() {
        let mock = plaintext_mock();
        mock.set_readable_range(0, 3).await;
        mock.set_readable_range(4, 7).await;
        for addr in [0u16, 1, 2, 4, 5, 6] {
            mock.set_register(addr, [0x00, addr as u8]).await;
        }

        let client = Client::new(mock.clone() as Arc<dyn BleLink>, None);
        client.connect(None).await.unwrap();

        let store = Arc::new(InMemoryResultStore::new());
        let (mut scanner, mut progress) = crate::scanner::Scanner::new(
            client.clone(),
            client.id(),
            vec![crate::scanner::ScanRange { start: 0, end: 7 }],
            store.clone(),
        );
        let reads = Arc::new(AtomicUsize::new(0));
        let reads_clone = reads.clone();
        let progress_task = tokio::spawn(async move {
            while progress.recv().await.is_some() {
                reads_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        scanner.run(None).await.unwrap();
        progress_task.abort();

        let results = store.all(&client.id()).await;
        assert_eq!(results.len(), 7);
        let unreadable: Vec<_> = results.iter().filter(|(_, r)| !r.readable).collect();
        assert_eq!(unreadable.len(), 1);
        assert_eq!(unreadable[0].0, 3);
    }
}
