//! Pairwise encryption between two devices.
//!
//! A sender seals a payload to a recipient device using the recipient's
//! identity key and one of its published one-time keys. The symmetric key
//! mixes two X25519 agreements:
//!
//! ```text
//! DH(ephemeral, one_time_key) || DH(sender_identity, recipient_identity)
//!        │
//!        ▼
//! HKDF-SHA256(info = label || sender_identity || recipient_identity)
//!        │
//!        ▼
//! XChaCha20-Poly1305(aad = ephemeral || one_time_key)
//! ```
//!
//! The second agreement authenticates the sender: only the holder of the
//! claimed identity key can produce a payload the recipient will open.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

/// Size of the caller-provided nonce (24 bytes)
pub const PAIRWISE_NONCE_SIZE: usize = 24;

/// HKDF info label
const PAIRWISE_INFO: &[u8] = b"keyloom pairwise v1";

/// Ephemeral, one-time key, nonce
const HEADER_SIZE: usize = 32 + 32 + PAIRWISE_NONCE_SIZE;

/// Pairwise channel failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairwiseError {
    /// Bytes could not be parsed as a pairwise message.
    #[error("malformed pairwise message: {reason}")]
    Malformed {
        /// Reason for failure
        reason: String,
    },

    /// Message targets a different one-time key than the one supplied.
    #[error("message was sealed to another one-time key")]
    MismatchedOneTimeKey,

    /// A key agreement produced the all-zero shared secret.
    #[error("key agreement was not contributory")]
    NonContributory,

    /// Authentication tag or key mismatch.
    #[error("pairwise decryption failed")]
    DecryptionFailed,
}

/// An X25519 keypair derived from a 32-byte seed.
pub struct Curve25519Keypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl Curve25519Keypair {
    /// Derive a keypair from a caller-provided seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let secret = StaticSecret::from(seed);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    fn agree(&self, their_public: &[u8; 32]) -> Result<[u8; 32], PairwiseError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*their_public));
        if !shared.was_contributory() {
            return Err(PairwiseError::NonContributory);
        }
        Ok(shared.to_bytes())
    }
}

impl std::fmt::Debug for Curve25519Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Curve25519Keypair")
            .field("public_key", &crate::encode_key(&self.public_key()))
            .finish_non_exhaustive()
    }
}

/// A sealed pairwise payload.
///
/// Wire layout: `ephemeral (32) | one_time_key (32) | nonce (24) | ciphertext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairwiseMessage {
    /// Sender's ephemeral public key
    pub ephemeral: [u8; 32],
    /// Recipient one-time key this message was sealed to
    pub one_time_key: [u8; 32],
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; PAIRWISE_NONCE_SIZE],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
}

impl PairwiseMessage {
    /// Seal `plaintext` from `sender` to the recipient device.
    ///
    /// # Errors
    ///
    /// - `NonContributory`: a recipient key is a low-order point
    pub fn seal(
        sender: &Curve25519Keypair,
        recipient_identity: &[u8; 32],
        recipient_one_time_key: &[u8; 32],
        ephemeral_seed: [u8; 32],
        nonce: [u8; PAIRWISE_NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Self, PairwiseError> {
        let ephemeral = Curve25519Keypair::from_seed(ephemeral_seed);

        let mut key = derive_key(
            &ephemeral.agree(recipient_one_time_key)?,
            &sender.agree(recipient_identity)?,
            &sender.public_key(),
            recipient_identity,
        );

        let ephemeral_public = ephemeral.public_key();
        let aad = associated_data(&ephemeral_public, recipient_one_time_key);
        let cipher = XChaCha20Poly1305::new((&key).into());
        key.zeroize();

        let Ok(ciphertext) =
            cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
        else {
            unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
        };

        Ok(Self {
            ephemeral: ephemeral_public,
            one_time_key: *recipient_one_time_key,
            nonce,
            ciphertext,
        })
    }

    /// Open a message with the recipient's identity key and the matching one-time key.
    ///
    /// # Errors
    ///
    /// - `MismatchedOneTimeKey`: `one_time_key` is not the key the message targets
    /// - `NonContributory`: a sender key is a low-order point
    /// - `DecryptionFailed`: wrong sender, wrong keys or tampering
    pub fn open(
        &self,
        recipient: &Curve25519Keypair,
        one_time_key: &Curve25519Keypair,
        sender_identity: &[u8; 32],
    ) -> Result<Vec<u8>, PairwiseError> {
        if one_time_key.public_key() != self.one_time_key {
            return Err(PairwiseError::MismatchedOneTimeKey);
        }

        let mut key = derive_key(
            &one_time_key.agree(&self.ephemeral)?,
            &recipient.agree(sender_identity)?,
            sender_identity,
            &recipient.public_key(),
        );

        let aad = associated_data(&self.ephemeral, &self.one_time_key);
        let cipher = XChaCha20Poly1305::new((&key).into());
        key.zeroize();

        cipher
            .decrypt(
                XNonce::from_slice(&self.nonce),
                Payload { msg: self.ciphertext.as_slice(), aad: &aad },
            )
            .map_err(|_| PairwiseError::DecryptionFailed)
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.ephemeral);
        out.extend_from_slice(&self.one_time_key);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PairwiseError> {
        if bytes.len() <= HEADER_SIZE {
            return Err(PairwiseError::Malformed { reason: "truncated".to_string() });
        }

        let mut ephemeral = [0u8; 32];
        ephemeral.copy_from_slice(&bytes[0..32]);
        let mut one_time_key = [0u8; 32];
        one_time_key.copy_from_slice(&bytes[32..64]);
        let mut nonce = [0u8; PAIRWISE_NONCE_SIZE];
        nonce.copy_from_slice(&bytes[64..HEADER_SIZE]);

        Ok(Self { ephemeral, one_time_key, nonce, ciphertext: bytes[HEADER_SIZE..].to_vec() })
    }
}

fn derive_key(
    ephemeral_secret: &[u8; 32],
    identity_secret: &[u8; 32],
    sender_identity: &[u8; 32],
    recipient_identity: &[u8; 32],
) -> [u8; 32] {
    let mut ikm = [0u8; 64];
    ikm[..32].copy_from_slice(ephemeral_secret);
    ikm[32..].copy_from_slice(identity_secret);

    let mut info = Vec::with_capacity(PAIRWISE_INFO.len() + 64);
    info.extend_from_slice(PAIRWISE_INFO);
    info.extend_from_slice(sender_identity);
    info.extend_from_slice(recipient_identity);

    let hk = Hkdf::<Sha256>::new(None, &ikm);
    let mut key = [0u8; 32];
    let Ok(()) = hk.expand(&info, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };
    ikm.zeroize();
    key
}

fn associated_data(ephemeral: &[u8; 32], one_time_key: &[u8; 32]) -> [u8; 64] {
    let mut aad = [0u8; 64];
    aad[..32].copy_from_slice(ephemeral);
    aad[32..].copy_from_slice(one_time_key);
    aad
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    struct Device {
        identity: Curve25519Keypair,
        one_time: Curve25519Keypair,
    }

    fn device(seed: u8) -> Device {
        Device {
            identity: Curve25519Keypair::from_seed([seed; 32]),
            one_time: Curve25519Keypair::from_seed([seed.wrapping_add(100); 32]),
        }
    }

    fn seal_to(sender: &Device, recipient: &Device, plaintext: &[u8]) -> PairwiseMessage {
        PairwiseMessage::seal(
            &sender.identity,
            &recipient.identity.public_key(),
            &recipient.one_time.public_key(),
            [42u8; 32],
            [7u8; 24],
            plaintext,
        )
        .unwrap()
    }

    #[test]
    fn seal_and_open() {
        let alice = device(1);
        let bob = device(2);

        let message = seal_to(&alice, &bob, b"room key");
        let opened = message.open(&bob.identity, &bob.one_time, &alice.identity.public_key());
        assert_eq!(opened.unwrap(), b"room key");
    }

    #[test]
    fn wrong_sender_identity_fails() {
        let alice = device(1);
        let bob = device(2);
        let mallory = device(3);

        let message = seal_to(&alice, &bob, b"room key");
        assert_eq!(
            message.open(&bob.identity, &bob.one_time, &mallory.identity.public_key()),
            Err(PairwiseError::DecryptionFailed)
        );
    }

    #[test]
    fn wrong_one_time_key_rejected() {
        let alice = device(1);
        let bob = device(2);
        let other = device(4);

        let message = seal_to(&alice, &bob, b"room key");
        assert_eq!(
            message.open(&bob.identity, &other.one_time, &alice.identity.public_key()),
            Err(PairwiseError::MismatchedOneTimeKey)
        );
    }

    #[test]
    fn low_order_key_rejected() {
        let alice = device(1);
        let result = PairwiseMessage::seal(
            &alice.identity,
            &[0u8; 32],
            &[0u8; 32],
            [42u8; 32],
            [0u8; 24],
            b"x",
        );
        assert_eq!(result, Err(PairwiseError::NonContributory));
    }

    #[test]
    fn wire_bytes_decode() {
        let message = seal_to(&device(1), &device(2), b"payload");
        assert_eq!(PairwiseMessage::from_bytes(&message.to_bytes()).unwrap(), message);
        assert!(PairwiseMessage::from_bytes(&[0u8; HEADER_SIZE]).is_err());
    }
}
