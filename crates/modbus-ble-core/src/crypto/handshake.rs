//! The six-state encryption handshake: a challenge/response round keyed by the
//! bundle's shared secret, followed by an ECDH exchange of ECDSA-signed ephemeral
//! P-256 keys.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::Signature;
use p256::ecdh::EphemeralSecret;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::PublicKey;
use rand::rngs::OsRng;

use crate::crypto::aes_cbc::{self, AesCbcKey};
use crate::crypto::key_bundle::KeyBundle;
use crate::crypto::md5::md5;
use crate::error::{Error, Result};

pub const STATE_CHALLENGE: u8 = 1;
pub const STATE_CHALLENGE_RESPONSE: u8 = 2;
pub const STATE_CHALLENGE_ACCEPTED: u8 = 3;
pub const STATE_SERVER_PUBLIC_KEY: u8 = 4;
pub const STATE_CLIENT_PUBLIC_KEY: u8 = 5;
pub const STATE_ECDH_ACCEPTED: u8 = 6;

const HANDSHAKE_PREFIX: [u8; 2] = [0x2A, 0x2A];

/// The role a party plays. The device side initiates with the unsolicited
/// challenge; the host side responds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// A parsed handshake wire message: `[0x2A 0x2A][state][body_len][body][sum_hi sum_lo]`.
#[derive(Debug, Clone)]
struct HandshakeMessage {
    state: u8,
    body: Vec<u8>,
}

impl HandshakeMessage {
    fn new(state: u8, body: Vec<u8>) -> Self {
        Self { state, body }
    }

    fn checksum(state: u8, body: &[u8]) -> u16 {
        let mut sum: u16 = state as u16;
        sum = sum.wrapping_add(body.len() as u16);
        for &b in body {
            sum = sum.wrapping_add(b as u16);
        }
        sum
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        if self.body.len() > 255 {
            return Err(Error::InvalidArgument("handshake body exceeds 255 bytes".into()));
        }
        let mut out = Vec::with_capacity(4 + self.body.len() + 2);
        out.extend_from_slice(&HANDSHAKE_PREFIX);
        out.push(self.state);
        out.push(self.body.len() as u8);
        out.extend_from_slice(&self.body);
        let sum = Self::checksum(self.state, &self.body);
        out.extend_from_slice(&sum.to_be_bytes());
        Ok(out)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 6 {
            return Err(Error::HandshakeFormat("message shorter than 6 bytes".into()));
        }
        if bytes[0..2] != HANDSHAKE_PREFIX {
            return Err(Error::HandshakeFormat("bad prefix bytes".into()));
        }
        let state = bytes[2];
        let body_len = bytes[3] as usize;
        if bytes.len() != 4 + body_len + 2 {
            return Err(Error::HandshakeFormat("body length disagrees with message size".into()));
        }
        let body = bytes[4..4 + body_len].to_vec();
        let received_sum = u16::from_be_bytes([bytes[4 + body_len], bytes[5 + body_len]]);
        if Self::checksum(state, &body) != received_sum {
            return Err(Error::HandshakeFormat("checksum mismatch".into()));
        }
        Ok(Self { state, body })
    }
}

fn verify_accept_byte(body: &[u8]) -> Result<()> {
    if body.is_empty() {
        return Err(Error::HandshakeFormat("accept body is empty".into()));
    }
    if body[0] != 0x00 {
        return Err(Error::HandshakeRejected);
    }
    Ok(())
}

fn sign_ephemeral(signing_key: &p256::ecdsa::SigningKey, pubkey_raw: &[u8; 64], aes_iv: &[u8; 16]) -> [u8; 64] {
    let mut signed_over = Vec::with_capacity(80);
    signed_over.extend_from_slice(pubkey_raw);
    signed_over.extend_from_slice(aes_iv);
    let signature: Signature = signing_key.sign(&signed_over);
    let mut out = [0u8; 64];
    out.copy_from_slice(&signature.to_bytes());
    out
}

fn verify_ephemeral(
    verify_key: &p256::ecdsa::VerifyingKey,
    pubkey_raw: &[u8; 64],
    aes_iv: &[u8; 16],
    signature_raw: &[u8; 64],
) -> Result<()> {
    let mut signed_over = Vec::with_capacity(80);
    signed_over.extend_from_slice(pubkey_raw);
    signed_over.extend_from_slice(aes_iv);
    let signature = Signature::from_slice(signature_raw).map_err(|_| Error::HandshakeAuth)?;
    verify_key
        .verify(&signed_over, &signature)
        .map_err(|_| Error::HandshakeAuth)
}

fn raw_public_key(public: &PublicKey) -> [u8; 64] {
    let point = public.to_encoded_point(false);
    let mut raw = [0u8; 64];
    raw.copy_from_slice(&point.as_bytes()[1..]);
    raw
}

fn public_key_from_raw(raw: &[u8; 64]) -> Result<PublicKey> {
    let mut sec1 = Vec::with_capacity(65);
    sec1.push(0x04);
    sec1.extend_from_slice(raw);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| Error::HandshakeFormat("invalid ephemeral public key".into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitiatorStage {
    AwaitingStart,
    AwaitingChallengeResponse,
    AwaitingPubkeyExchange,
    AwaitingPeerPublicKey,
    Complete,
    /// The challenge response didn't match; state 3's reject byte has been sent
    /// and the handshake cannot proceed any further.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponderStage {
    AwaitingChallenge,
    AwaitingAccepted,
    AwaitingPeerPubkey,
    AwaitingFinalAck,
    Complete,
}

enum Stage {
    Initiator(InitiatorStage),
    Responder(ResponderStage),
}

/// Drives one side of the six-state handshake. Call `advance(None)` to produce the
/// next unsolicited message, or `advance(Some(frame))` to react to an incoming one.
pub struct Handshake {
    role: Role,
    bundle: KeyBundle,
    stage: Stage,
    challenge: Option<[u8; 4]>,
    aes_iv: Option<[u8; 16]>,
    aes_key: Option<[u8; 16]>,
    ephemeral_secret: Option<EphemeralSecret>,
    ephemeral_public_raw: Option<[u8; 64]>,
    peer_public_raw: Option<[u8; 64]>,
    session_aes_key: Option<[u8; 32]>,
}

impl Handshake {
    pub fn new(role: Role, bundle: KeyBundle) -> Self {
        let stage = match role {
            Role::Initiator => Stage::Initiator(InitiatorStage::AwaitingStart),
            Role::Responder => Stage::Responder(ResponderStage::AwaitingChallenge),
        };
        Self {
            role,
            bundle,
            stage,
            challenge: None,
            aes_iv: None,
            aes_key: None,
            ephemeral_secret: None,
            ephemeral_public_raw: None,
            peer_public_raw: None,
            session_aes_key: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_complete(&self) -> bool {
        matches!(
            self.stage,
            Stage::Initiator(InitiatorStage::Complete) | Stage::Responder(ResponderStage::Complete)
        )
    }

    /// The 256-bit session AES key, available once `is_complete()` is true.
    pub fn session_aes_key(&self) -> Option<[u8; 32]> {
        self.session_aes_key
    }

    fn challenge_round_key(&self) -> Result<AesCbcKey> {
        let key = self.aes_key.ok_or_else(|| {
            Error::HandshakeSequence("challenge-round key requested before it was derived".into())
        })?;
        Ok(AesCbcKey::Aes128(key))
    }

    fn wrap(&self, message: &HandshakeMessage) -> Result<Vec<u8>> {
        let aes_iv = self.aes_iv.ok_or_else(|| {
            Error::HandshakeSequence("challenge-round IV requested before it was derived".into())
        })?;
        let key = self.challenge_round_key()?;
        let bytes = message.to_bytes()?;
        aes_cbc::encrypt_frame(&bytes, &key, Some(aes_iv))
    }

    fn unwrap(&self, frame: &[u8]) -> Result<HandshakeMessage> {
        let aes_iv = self.aes_iv.ok_or_else(|| {
            Error::HandshakeSequence("challenge-round IV requested before it was derived".into())
        })?;
        let key = self.challenge_round_key()?;
        let plaintext = aes_cbc::decrypt_frame(frame, &key, Some(aes_iv)).map_err(|e| match e {
            Error::CipherFormat(m) => Error::HandshakeFormat(m),
            other => other,
        })?;
        HandshakeMessage::from_bytes(&plaintext)
    }

    fn derive_challenge_keys(&mut self, challenge: [u8; 4]) {
        let mut reversed = challenge;
        reversed.reverse();
        let aes_iv = md5(&reversed);
        let mut aes_key = aes_iv;
        for i in 0..16 {
            aes_key[i] ^= self.bundle.shared_secret[i];
        }
        self.challenge = Some(challenge);
        self.aes_iv = Some(aes_iv);
        self.aes_key = Some(aes_key);
    }

    fn generate_ephemeral(&mut self) {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public = PublicKey::from(&secret);
        self.ephemeral_public_raw = Some(raw_public_key(&public));
        self.ephemeral_secret = Some(secret);
    }

    fn derive_session_key(&mut self) -> Result<()> {
        let secret = self.ephemeral_secret.take().ok_or_else(|| {
            Error::HandshakeSequence("ECDH requested before an ephemeral keypair existed".into())
        })?;
        let peer_raw = self.peer_public_raw.ok_or_else(|| {
            Error::HandshakeSequence("ECDH requested before peer's public key arrived".into())
        })?;
        let peer_public = public_key_from_raw(&peer_raw)?;
        let shared = secret.diffie_hellman(&peer_public);
        let mut session_key = [0u8; 32];
        session_key.copy_from_slice(shared.raw_secret_bytes().as_slice());
        self.session_aes_key = Some(session_key);
        Ok(())
    }

    /// Advances the handshake. Pass `None` to produce the next message this side
    /// owes regardless of input (e.g. the initial challenge, or state 4 following
    /// state 3's silent acceptance); pass `Some(frame)` to react to one received
    /// over the wire.
    pub fn advance(&mut self, incoming: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        match self.role {
            Role::Initiator => self.advance_initiator(incoming),
            Role::Responder => self.advance_responder(incoming),
        }
    }

    fn advance_initiator(&mut self, incoming: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let Stage::Initiator(stage) = self.stage else {
            unreachable!("role/stage mismatch")
        };
        match (stage, incoming) {
            (InitiatorStage::AwaitingStart, None) => {
                let mut challenge = [0u8; 4];
                rand::RngCore::fill_bytes(&mut OsRng, &mut challenge);
                self.derive_challenge_keys(challenge);
                let message = HandshakeMessage::new(STATE_CHALLENGE, challenge.to_vec());
                self.stage = Stage::Initiator(InitiatorStage::AwaitingChallengeResponse);
                Ok(Some(message.to_bytes()?))
            }
            (InitiatorStage::AwaitingChallengeResponse, Some(frame)) => {
                let message = HandshakeMessage::from_bytes(frame)?;
                if message.state != STATE_CHALLENGE_RESPONSE {
                    return Err(Error::HandshakeSequence(format!(
                        "expected state {STATE_CHALLENGE_RESPONSE}, got {}",
                        message.state
                    )));
                }
                if message.body.len() != 4 {
                    return Err(Error::HandshakeFormat("challenge response body must be 4 bytes".into()));
                }
                let aes_iv = self.aes_iv.expect("challenge keys already derived");
                let accept = message.body == aes_iv[8..12];

                if !accept {
                    // Still have to send state 3 with the reject byte, wrapped under
                    // the challenge-round cipher like any other state-3-onward frame,
                    // so the peer learns the handshake failed instead of timing out.
                    let reject_message = HandshakeMessage::new(STATE_CHALLENGE_ACCEPTED, vec![0x01]);
                    let wrapped = self.wrap(&reject_message)?;
                    self.stage = Stage::Initiator(InitiatorStage::Rejected);
                    return Ok(Some(wrapped));
                }

                self.generate_ephemeral();
                let accept_message = HandshakeMessage::new(STATE_CHALLENGE_ACCEPTED, vec![0x00]);
                let wrapped = self.wrap(&accept_message)?;
                self.stage = Stage::Initiator(InitiatorStage::AwaitingPubkeyExchange);
                Ok(Some(wrapped))
            }
            (InitiatorStage::AwaitingPubkeyExchange, None) => {
                let aes_iv = self.aes_iv.expect("challenge keys already derived");
                let pubkey_raw = self
                    .ephemeral_public_raw
                    .expect("ephemeral keypair generated before this stage");
                let signature = sign_ephemeral(&self.bundle.signing_key, &pubkey_raw, &aes_iv);
                let mut body = Vec::with_capacity(128);
                body.extend_from_slice(&pubkey_raw);
                body.extend_from_slice(&signature);
                let message = HandshakeMessage::new(STATE_SERVER_PUBLIC_KEY, body);
                let wrapped = self.wrap(&message)?;
                self.stage = Stage::Initiator(InitiatorStage::AwaitingPeerPublicKey);
                Ok(Some(wrapped))
            }
            (InitiatorStage::AwaitingPeerPublicKey, Some(frame)) => {
                let message = self.unwrap(frame)?;
                if message.state != STATE_CLIENT_PUBLIC_KEY {
                    return Err(Error::HandshakeSequence(format!(
                        "expected state {STATE_CLIENT_PUBLIC_KEY}, got {}",
                        message.state
                    )));
                }
                if message.body.len() != 128 {
                    return Err(Error::HandshakeFormat("public key body must be 128 bytes".into()));
                }
                let mut peer_raw = [0u8; 64];
                peer_raw.copy_from_slice(&message.body[..64]);
                let mut signature_raw = [0u8; 64];
                signature_raw.copy_from_slice(&message.body[64..]);
                let aes_iv = self.aes_iv.expect("challenge keys already derived");
                verify_ephemeral(&self.bundle.verify_key, &peer_raw, &aes_iv, &signature_raw)?;
                self.peer_public_raw = Some(peer_raw);
                self.derive_session_key()?;

                let ack = HandshakeMessage::new(STATE_ECDH_ACCEPTED, vec![0x00]);
                let wrapped = self.wrap(&ack)?;
                self.stage = Stage::Initiator(InitiatorStage::Complete);
                Ok(Some(wrapped))
            }
            (InitiatorStage::Rejected, _) => Err(Error::HandshakeRejected),
            (stage, incoming) => Err(Error::HandshakeSequence(format!(
                "unexpected advance({}) in initiator stage {stage:?}",
                if incoming.is_some() { "frame" } else { "None" }
            ))),
        }
    }

    fn advance_responder(&mut self, incoming: Option<&[u8]>) -> Result<Option<Vec<u8>>> {
        let Stage::Responder(stage) = self.stage else {
            unreachable!("role/stage mismatch")
        };
        let Some(frame) = incoming else {
            return Err(Error::HandshakeSequence(
                "responder never sends without reacting to an incoming frame".into(),
            ));
        };

        match stage {
            ResponderStage::AwaitingChallenge => {
                let message = HandshakeMessage::from_bytes(frame)?;
                if message.state != STATE_CHALLENGE {
                    return Err(Error::HandshakeSequence(format!(
                        "expected state {STATE_CHALLENGE}, got {}",
                        message.state
                    )));
                }
                if message.body.len() != 4 {
                    return Err(Error::HandshakeFormat("challenge body must be 4 bytes".into()));
                }
                let mut challenge = [0u8; 4];
                challenge.copy_from_slice(&message.body);
                self.derive_challenge_keys(challenge);
                let aes_iv = self.aes_iv.expect("just derived");
                let response = HandshakeMessage::new(STATE_CHALLENGE_RESPONSE, aes_iv[8..12].to_vec());
                self.stage = Stage::Responder(ResponderStage::AwaitingAccepted);
                Ok(Some(response.to_bytes()?))
            }
            ResponderStage::AwaitingAccepted => {
                let message = self.unwrap(frame)?;
                if message.state != STATE_CHALLENGE_ACCEPTED {
                    return Err(Error::HandshakeSequence(format!(
                        "expected state {STATE_CHALLENGE_ACCEPTED}, got {}",
                        message.state
                    )));
                }
                verify_accept_byte(&message.body)?;
                self.generate_ephemeral();
                self.stage = Stage::Responder(ResponderStage::AwaitingPeerPubkey);
                Ok(None)
            }
            ResponderStage::AwaitingPeerPubkey => {
                let message = self.unwrap(frame)?;
                if message.state != STATE_SERVER_PUBLIC_KEY {
                    return Err(Error::HandshakeSequence(format!(
                        "expected state {STATE_SERVER_PUBLIC_KEY}, got {}",
                        message.state
                    )));
                }
                if message.body.len() != 128 {
                    return Err(Error::HandshakeFormat("public key body must be 128 bytes".into()));
                }
                let mut peer_raw = [0u8; 64];
                peer_raw.copy_from_slice(&message.body[..64]);
                let mut signature_raw = [0u8; 64];
                signature_raw.copy_from_slice(&message.body[64..]);
                let aes_iv = self.aes_iv.expect("challenge keys already derived");
                verify_ephemeral(&self.bundle.verify_key, &peer_raw, &aes_iv, &signature_raw)?;
                self.peer_public_raw = Some(peer_raw);

                let own_pubkey_raw = self
                    .ephemeral_public_raw
                    .expect("ephemeral keypair generated at state 3");
                let signature = sign_ephemeral(&self.bundle.signing_key, &own_pubkey_raw, &aes_iv);
                let mut body = Vec::with_capacity(128);
                body.extend_from_slice(&own_pubkey_raw);
                body.extend_from_slice(&signature);
                let reply = HandshakeMessage::new(STATE_CLIENT_PUBLIC_KEY, body);
                let wrapped = self.wrap(&reply)?;
                self.stage = Stage::Responder(ResponderStage::AwaitingFinalAck);
                Ok(Some(wrapped))
            }
            ResponderStage::AwaitingFinalAck => {
                let message = self.unwrap(frame)?;
                if message.state != STATE_ECDH_ACCEPTED {
                    return Err(Error::HandshakeSequence(format!(
                        "expected state {STATE_ECDH_ACCEPTED}, got {}",
                        message.state
                    )));
                }
                verify_accept_byte(&message.body)?;
                self.derive_session_key()?;
                self.stage = Stage::Responder(ResponderStage::Complete);
                Ok(None)
            }
            ResponderStage::Complete => Err(Error::HandshakeSequence(
                "handshake already complete".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::key_bundle::test_support::paired_bundles;

    fn drive_to_completion(device: &mut Handshake, host: &mut Handshake) {
        let msg1 = device.advance(None).unwrap().unwrap();
        let msg2 = host.advance(Some(&msg1)).unwrap().unwrap();
        let msg3 = device.advance(Some(&msg2)).unwrap().unwrap();
        assert!(host.advance(Some(&msg3)).unwrap().is_none());
        let msg4 = device.advance(None).unwrap().unwrap();
        let msg5 = host.advance(Some(&msg4)).unwrap().unwrap();
        let msg6 = device.advance(Some(&msg5)).unwrap().unwrap();
        assert!(host.advance(Some(&msg6)).unwrap().is_none());
    }

    #[test]
    fn handshake_symmetry_reaches_equal_session_keys() {
        let (device_bundle, host_bundle) = paired_bundles();
        let mut device = Handshake::new(Role::Initiator, device_bundle);
        let mut host = Handshake::new(Role::Responder, host_bundle);

        drive_to_completion(&mut device, &mut host);

        assert!(device.is_complete());
        assert!(host.is_complete());
        assert_eq!(device.session_aes_key(), host.session_aes_key());
        assert!(device.session_aes_key().is_some());
    }

    #[test]
    fn challenge_response_mismatch_sends_a_reject_frame_instead_of_hanging() {
        let (device_bundle, host_bundle) = paired_bundles();
        let mut device = Handshake::new(Role::Initiator, device_bundle);
        let mut host = Handshake::new(Role::Responder, host_bundle);

        let msg1 = device.advance(None).unwrap().unwrap();
        host.advance(Some(&msg1)).unwrap();

        // A state-2 reply that doesn't match what the device computed for itself.
        let bogus_reply = HandshakeMessage::new(STATE_CHALLENGE_RESPONSE, vec![0xFF; 4])
            .to_bytes()
            .unwrap();
        let reject_frame = device.advance(Some(&bogus_reply)).unwrap().unwrap();
        assert!(!device.is_complete());

        // The reject frame reaches the responder instead of it timing out waiting
        // for state 3.
        let err = host.advance(Some(&reject_frame)).unwrap_err();
        assert!(matches!(err, Error::HandshakeRejected));

        // The initiator itself now treats the handshake as terminally rejected too.
        let err = device.advance(None).unwrap_err();
        assert!(matches!(err, Error::HandshakeRejected));
    }

    #[test]
    fn tampered_signature_fails_auth() {
        let (device_bundle, host_bundle) = paired_bundles();
        let mut device = Handshake::new(Role::Initiator, device_bundle);
        let mut host = Handshake::new(Role::Responder, host_bundle);

        let msg1 = device.advance(None).unwrap().unwrap();
        let msg2 = host.advance(Some(&msg1)).unwrap().unwrap();
        let msg3 = device.advance(Some(&msg2)).unwrap().unwrap();
        assert!(host.advance(Some(&msg3)).unwrap().is_none());
        let mut msg4 = device.advance(None).unwrap().unwrap();
        // Flip a bit deep inside the ciphertext, which (after decryption) lands in the
        // signature bytes of the inner handshake message body.
        let last = msg4.len() - 3;
        msg4[last] ^= 0xFF;

        let err = host.advance(Some(&msg4)).unwrap_err();
        assert!(matches!(err, Error::HandshakeAuth | Error::HandshakeFormat(_)));
    }

    #[test]
    fn body_length_mismatch_is_handshake_format() {
        let raw = HandshakeMessage::new(STATE_CHALLENGE, vec![1, 2, 3, 4]).to_bytes().unwrap();
        let mut tampered = raw.clone();
        tampered[3] = 5; // claim 5 body bytes but only 4 are present
        assert!(matches!(
            HandshakeMessage::from_bytes(&tampered),
            Err(Error::HandshakeFormat(_))
        ));
    }

    #[test]
    fn reject_byte_in_state_three_is_handshake_rejected() {
        assert!(matches!(verify_accept_byte(&[0x01]), Err(Error::HandshakeRejected)));
        assert!(verify_accept_byte(&[0x00]).is_ok());
        assert!(verify_accept_byte(&[0x00, 0x99]).is_ok());
    }
}
