//! Cryptographic building blocks: MD5 (IV derivation only), the AES-CBC transport
//! codec, the key bundle, and the handshake state machine built on top of them.

pub mod aes_cbc;
pub mod handshake;
pub mod key_bundle;
pub mod md5;

pub use aes_cbc::AesCbcKey;
pub use handshake::{Handshake, Role};
pub use key_bundle::KeyBundle;
