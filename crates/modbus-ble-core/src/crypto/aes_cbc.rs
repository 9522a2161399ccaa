//! AES-CBC transport codec: a length-prefixed, optionally IV-seeded wrapper over a
//! PKCS#7-only block cipher primitive, producing non-standard null-padded output.
//!
//! The underlying primitive only knows how to do PKCS#7. This module keeps a manual,
//! per-block loop style, chaining each block through XOR with the previous
//! ciphertext block (or the IV, for the first), rather than reaching for a
//! higher-level CBC crate.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes128, Aes256};
use rand::{rngs::OsRng, RngCore};

use crate::crypto::md5::md5;
use crate::error::{Error, Result};

const BLOCK_SIZE: usize = 16;

/// An AES-CBC key of either size this protocol uses: 16 bytes for the
/// challenge-round key, 32 bytes for the ECDH-derived session key.
#[derive(Clone)]
pub enum AesCbcKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

/// Dispatches single-block encrypt/decrypt over whichever AES variant the key holds.
enum BlockCipher {
    Aes128(Aes128),
    Aes256(Aes256),
}

impl BlockCipher {
    fn new(key: &AesCbcKey) -> Self {
        match key {
            AesCbcKey::Aes128(k) => BlockCipher::Aes128(Aes128::new(GenericArray::from_slice(k))),
            AesCbcKey::Aes256(k) => BlockCipher::Aes256(Aes256::new(GenericArray::from_slice(k))),
        }
    }

    fn encrypt_block(&self, block: &mut GenericArray<u8, aes::cipher::consts::U16>) {
        match self {
            BlockCipher::Aes128(c) => c.encrypt_block(block),
            BlockCipher::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt_block(&self, block: &mut GenericArray<u8, aes::cipher::consts::U16>) {
        match self {
            BlockCipher::Aes128(c) => c.decrypt_block(block),
            BlockCipher::Aes256(c) => c.decrypt_block(block),
        }
    }
}

/// Encrypts `plaintext` under CBC chaining with full PKCS#7 padding. Always
/// produces a multiple-of-16-byte result with at least one byte of padding.
fn pkcs7_cbc_encrypt(plaintext: &[u8], key: &AesCbcKey, iv: &[u8; 16]) -> Vec<u8> {
    let cipher = BlockCipher::new(key);
    let pad_len = BLOCK_SIZE - (plaintext.len() % BLOCK_SIZE);
    let mut padded = plaintext.to_vec();
    padded.extend(std::iter::repeat(pad_len as u8).take(pad_len));

    let mut out = Vec::with_capacity(padded.len());
    let mut prev: [u8; 16] = *iv;
    for chunk in padded.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        for i in 0..BLOCK_SIZE {
            block[i] ^= prev[i];
        }
        cipher.encrypt_block(&mut block);
        prev.copy_from_slice(&block);
        out.extend_from_slice(&block);
    }
    out
}

/// Decrypts a buffer produced by `pkcs7_cbc_encrypt` (i.e. whose final block is a
/// genuine PKCS#7 pad block), stripping the padding.
fn pkcs7_cbc_decrypt(ciphertext: &[u8], key: &AesCbcKey, iv: &[u8; 16]) -> Result<Vec<u8>> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::CipherFormat(
            "ciphertext length must be a non-zero multiple of 16".into(),
        ));
    }

    let cipher = BlockCipher::new(key);
    let mut out = Vec::with_capacity(ciphertext.len());
    let mut prev: [u8; 16] = *iv;
    for chunk in ciphertext.chunks(BLOCK_SIZE) {
        let mut block = GenericArray::clone_from_slice(chunk);
        let mut ciphertext_block = [0u8; 16];
        ciphertext_block.copy_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for i in 0..BLOCK_SIZE {
            block[i] ^= prev[i];
        }
        prev = ciphertext_block;
        out.extend_from_slice(&block);
    }

    let pad_len = *out.last().ok_or(Error::CipherAuth)? as usize;
    if pad_len == 0 || pad_len > BLOCK_SIZE || pad_len > out.len() {
        return Err(Error::CipherAuth);
    }
    if !out[out.len() - pad_len..].iter().all(|&b| b as usize == pad_len) {
        return Err(Error::CipherAuth);
    }
    out.truncate(out.len() - pad_len);
    Ok(out)
}

/// Encrypts `plaintext` under null-padding: runs the PKCS#7 primitive, then drops
/// the trailing pad block if one was genuinely added on top of the real data (i.e.
/// when `plaintext.len()` was already block-aligned). The caller records
/// `plaintext.len()` out of band (in the frame's length prefix) to recover the
/// exact boundary on decrypt.
pub fn encrypt_null_padded(plaintext: &[u8], key: &AesCbcKey, iv: &[u8; 16]) -> Vec<u8> {
    if plaintext.is_empty() {
        return Vec::new();
    }
    let full = pkcs7_cbc_encrypt(plaintext, key, iv);
    let null_len = plaintext.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    full[..null_len].to_vec()
}

/// Decrypts a null-padded ciphertext. Fabricates a full PKCS#7 pad block (0x10
/// repeated), CBC-encrypts it with the IV set to the last real ciphertext block (or
/// the frame IV, if the ciphertext is empty), appends it, runs the ordinary PKCS#7
/// decrypt over the whole thing, and slices to `plaintext_len`.
pub fn decrypt_null_padded(
    ciphertext: &[u8],
    key: &AesCbcKey,
    iv: &[u8; 16],
    plaintext_len: usize,
) -> Result<Vec<u8>> {
    if ciphertext.is_empty() {
        return if plaintext_len == 0 {
            Ok(Vec::new())
        } else {
            Err(Error::CipherFormat(
                "empty ciphertext cannot carry a non-empty plaintext".into(),
            ))
        };
    }
    if ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(Error::CipherFormat(
            "null-padded ciphertext length must be a multiple of 16".into(),
        ));
    }
    if plaintext_len > ciphertext.len() {
        return Err(Error::CipherFormat(
            "plaintext_len exceeds ciphertext length".into(),
        ));
    }

    let cipher = BlockCipher::new(key);
    let last_block_iv: [u8; 16] = {
        let mut b = [0u8; 16];
        b.copy_from_slice(&ciphertext[ciphertext.len() - BLOCK_SIZE..]);
        b
    };

    let fake_plain = [0x10u8; BLOCK_SIZE];
    let mut fake_block = GenericArray::clone_from_slice(&fake_plain);
    for i in 0..BLOCK_SIZE {
        fake_block[i] ^= last_block_iv[i];
    }
    cipher.encrypt_block(&mut fake_block);

    let mut extended = ciphertext.to_vec();
    extended.extend_from_slice(&fake_block);

    let decrypted = pkcs7_cbc_decrypt(&extended, key, iv)?;
    if plaintext_len > decrypted.len() {
        return Err(Error::CipherFormat(
            "plaintext_len exceeds recovered plaintext".into(),
        ));
    }
    Ok(decrypted[..plaintext_len].to_vec())
}

/// Builds a wire frame: `[plaintext_len_hi plaintext_len_lo] ([iv_seed:4])? [ciphertext]`.
/// If `iv` is `Some`, it is used directly and no seed is prepended. Otherwise a
/// fresh random 4-byte seed is generated, hashed with MD5 to derive the IV, and the
/// seed (not the IV) is prepended.
pub fn encrypt_frame(plaintext: &[u8], key: &AesCbcKey, iv: Option<[u8; 16]>) -> Result<Vec<u8>> {
    if plaintext.len() > u16::MAX as usize {
        return Err(Error::InvalidArgument("plaintext too large to frame".into()));
    }

    let (effective_iv, seed) = match iv {
        Some(iv) => (iv, None),
        None => {
            let mut seed = [0u8; 4];
            OsRng.fill_bytes(&mut seed);
            (md5(&seed), Some(seed))
        }
    };

    let ciphertext = encrypt_null_padded(plaintext, key, &effective_iv);

    let mut frame = Vec::with_capacity(2 + 4 + ciphertext.len());
    frame.extend_from_slice(&(plaintext.len() as u16).to_be_bytes());
    if let Some(seed) = seed {
        frame.extend_from_slice(&seed);
    }
    frame.extend_from_slice(&ciphertext);
    Ok(frame)
}

/// Parses and decrypts a wire frame produced by `encrypt_frame`. If `iv` is
/// `Some`, the frame is assumed to carry no seed prefix (the caller already knows
/// the IV out of band, as with the challenge-round key).
pub fn decrypt_frame(frame: &[u8], key: &AesCbcKey, iv: Option<[u8; 16]>) -> Result<Vec<u8>> {
    if frame.len() < 2 {
        return Err(Error::CipherFormat("frame shorter than 2 bytes".into()));
    }
    let plaintext_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let rest = &frame[2..];

    let (effective_iv, ciphertext) = match iv {
        Some(iv) => (iv, rest),
        None => {
            if rest.len() < 4 {
                return Err(Error::CipherFormat("missing IV seed".into()));
            }
            (md5(&rest[..4]), &rest[4..])
        }
    };

    decrypt_null_padded(ciphertext, key, &effective_iv, plaintext_len)
}
