//! Error taxonomy for the MODBUS-over-BLE client.
//!
//! Every variant here is meant to be matched on by callers; retry policy differs
//! per variant (see the scanner, which treats `Checksum`/`Timeout` as "bisect this
//! chunk" rather than a terminal failure). No secrets (keys, session material) ever
//! appear in a message.

use thiserror::Error;

/// Crate-local result alias, over a concrete error enum instead of `anyhow::Error`.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("packet too large: {size} bytes exceeds the {limit}-byte MTU")]
    PacketTooLarge { size: usize, limit: usize },

    #[error("device disconnected")]
    Disconnected,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("a request is already in flight on this client")]
    Concurrency,

    #[error("checksum or frame validation failed: {0}")]
    Checksum(String),

    #[error("MODBUS exception: {code}")]
    ModbusException { code: u8 },

    #[error("handshake frame malformed: {0}")]
    HandshakeFormat(String),

    #[error("handshake message arrived out of sequence: {0}")]
    HandshakeSequence(String),

    #[error("handshake signature verification failed")]
    HandshakeAuth,

    #[error("peer rejected the handshake")]
    HandshakeRejected,

    #[error("cipher frame malformed: {0}")]
    CipherFormat(String),

    #[error("cipher authentication/decoding failed")]
    CipherAuth,

    /// Passthrough for the underlying BLE transport binding's own errors.
    #[error("BLE transport error: {0}")]
    Transport(String),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modbus_exception_message_contains_raw_code() {
        let err = Error::ModbusException { code: 2 };
        assert_eq!(err.to_string(), "MODBUS exception: 2");
    }

    #[test]
    fn messages_do_not_leak_secrets() {
        // Variants that touch key material never carry a payload field.
        let err = Error::HandshakeAuth;
        assert_eq!(err.to_string(), "handshake signature verification failed");
        let err = Error::CipherAuth;
        assert_eq!(err.to_string(), "cipher authentication/decoding failed");
    }
}
