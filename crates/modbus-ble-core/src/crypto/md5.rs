//! MD5 digest, used only for IV derivation (challenge-round IV and AES-CBC IV seeds).
//! Never used as a signature or integrity primitive; ECDSA-SHA256 covers that role.

use md5::{Digest, Md5};

/// Computes the 128-bit MD5 digest of `data`.
pub fn md5(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector_empty_string() {
        assert_eq!(
            hex::encode(md5(b"")),
            "d41d8cd98f00b204e9800998ecf8427e"
        );
    }

    #[test]
    fn known_vector_abc() {
        assert_eq!(
            hex::encode(md5(b"abc")),
            "900150983cd24fb0d6963f7d28e17f72"
        );
    }
}
