//! The key bundle a host supplies: a local ECDSA signing key, the peer's
//! verification key, and the shared secret seeding the challenge round.

use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePublicKey;

use crate::error::{Error, Result};

/// `{signing_key, verify_key, shared_secret}`.
#[derive(Clone)]
pub struct KeyBundle {
    pub(crate) signing_key: SigningKey,
    pub(crate) verify_key: VerifyingKey,
    pub(crate) shared_secret: [u8; 16],
}

impl KeyBundle {
    /// Builds a bundle from three hex-encoded inputs: a 32-byte raw P-256 scalar
    /// (signing key), a DER `SubjectPublicKeyInfo` (verify key), and a 16-byte
    /// shared secret.
    ///
    /// `p256::SecretKey` imports a raw scalar directly, so there is no need to
    /// hand-construct a PKCS#8 document the way an ASN.1-only crypto library
    /// would have to; see DESIGN.md for this simplification over wrapping the
    /// scalar in a PKCS#8 document first.
    pub fn from_hex(signing_key_hex: &str, verify_key_hex: &str, shared_secret_hex: &str) -> Result<Self> {
        let signing_bytes = hex::decode(signing_key_hex)
            .map_err(|e| Error::InvalidArgument(format!("signing key is not hex: {e}")))?;
        if signing_bytes.len() != 32 {
            return Err(Error::InvalidArgument(
                "signing key must decode to 32 bytes".into(),
            ));
        }
        let signing_key = SigningKey::from_slice(&signing_bytes)
            .map_err(|_| Error::InvalidArgument("signing key is not a valid P-256 scalar".into()))?;

        let verify_der = hex::decode(verify_key_hex)
            .map_err(|e| Error::InvalidArgument(format!("verify key is not hex: {e}")))?;
        let verify_key = VerifyingKey::from_public_key_der(&verify_der)
            .map_err(|_| Error::InvalidArgument("verify key is not a valid DER SubjectPublicKeyInfo".into()))?;

        let shared_bytes = hex::decode(shared_secret_hex)
            .map_err(|e| Error::InvalidArgument(format!("shared secret is not hex: {e}")))?;
        if shared_bytes.len() != 16 {
            return Err(Error::InvalidArgument(
                "shared secret must decode to 16 bytes".into(),
            ));
        }
        let mut shared_secret = [0u8; 16];
        shared_secret.copy_from_slice(&shared_bytes);

        Ok(Self {
            signing_key,
            verify_key,
            shared_secret,
        })
    }

    /// The 64-byte uncompressed `X||Y` encoding of the verify key, as used on the
    /// wire for handshake public-key bodies (never for the verify key itself,
    /// which stays DER/SPKI at the configuration boundary).
    pub(crate) fn verify_key_raw(&self) -> [u8; 64] {
        let point = self.verify_key.to_encoded_point(false);
        let mut raw = [0u8; 64];
        raw.copy_from_slice(&point.as_bytes()[1..]);
        raw
    }
}

/// A paired device/host bundle for tests: each side's signing key is the other's
/// verify key, and both share the same secret. Used by this module's own tests, the
/// handshake tests, and the mock device.
#[cfg(any(test, feature = "mock"))]
pub(crate) mod test_support {
    use super::*;
    use p256::ecdsa::SigningKey;
    use rand::rngs::OsRng;

    pub fn paired_bundles() -> (KeyBundle, KeyBundle) {
        let device_signing = SigningKey::random(&mut OsRng);
        let host_signing = SigningKey::random(&mut OsRng);
        let shared_secret = [0x5Au8; 16];

        let device_bundle = KeyBundle {
            signing_key: device_signing.clone(),
            verify_key: *host_signing.verifying_key(),
            shared_secret,
        };
        let host_bundle = KeyBundle {
            signing_key: host_signing,
            verify_key: *device_signing.verifying_key(),
            shared_secret,
        };
        (device_bundle, host_bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::SigningKey as SK;
    use rand::rngs::OsRng;

    fn sample_bundle_hex() -> (String, String, String) {
        let sk = SK::random(&mut OsRng);
        let vk = VerifyingKey::from(&sk);
        let der = p256::pkcs8::EncodePublicKey::to_public_key_der(&vk).unwrap();
        (
            hex::encode(sk.to_bytes()),
            hex::encode(der.as_bytes()),
            hex::encode([0xAAu8; 16]),
        )
    }

    #[test]
    fn from_hex_round_trips_valid_inputs() {
        let (signing, verify, shared) = sample_bundle_hex();
        let bundle = KeyBundle::from_hex(&signing, &verify, &shared).unwrap();
        assert_eq!(bundle.shared_secret, [0xAAu8; 16]);
    }

    #[test]
    fn rejects_wrong_length_shared_secret() {
        let (signing, verify, _) = sample_bundle_hex();
        let err = KeyBundle::from_hex(&signing, &verify, "aabb").unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn rejects_malformed_verify_key_der() {
        let (signing, _, shared) = sample_bundle_hex();
        let err = KeyBundle::from_hex(&signing, "deadbeef", &shared).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
