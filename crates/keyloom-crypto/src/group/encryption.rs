//! Group message encryption using `XChaCha20-Poly1305`
//!
//! All functions are pure - random bytes must be provided by the caller.

use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};

use super::{error::GroupSessionError, ratchet::MessageKey};

/// Size of the random suffix in the nonce (20 bytes)
pub const NONCE_RANDOM_SIZE: usize = 20;

/// Wire format version of [`GroupMessage`]
const MESSAGE_VERSION: u8 = 3;

/// Poly1305 tag size (16 bytes)
const POLY1305_TAG_SIZE: usize = 16;

/// Ed25519 signature size (64 bytes)
const SIGNATURE_SIZE: usize = 64;

/// Version, index, nonce
const HEADER_SIZE: usize = 1 + 4 + 24;

/// A signed, encrypted group message.
///
/// Wire layout: `version | message_index (u32 BE) | nonce (24) | ciphertext | signature (64)`.
/// The signature covers every byte that precedes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    /// Ratchet index the message key was derived at
    pub message_index: u32,
    /// The 24-byte `XChaCha20` nonce
    pub nonce: [u8; 24],
    /// The ciphertext including 16-byte Poly1305 tag
    pub ciphertext: Vec<u8>,
    /// Ed25519 signature by the session's signing key
    pub signature: [u8; SIGNATURE_SIZE],
}

impl GroupMessage {
    /// Plaintext length (ciphertext length minus authentication tag).
    pub fn plaintext_len(&self) -> usize {
        self.ciphertext.len().saturating_sub(POLY1305_TAG_SIZE)
    }

    /// Bytes covered by the signature.
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.ciphertext.len());
        out.push(MESSAGE_VERSION);
        out.extend_from_slice(&self.message_index.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Encode to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.signed_bytes();
        out.extend_from_slice(&self.signature);
        out
    }

    /// Decode from wire bytes.
    ///
    /// # Errors
    ///
    /// - `Malformed`: wrong version or too short to hold a tag and signature
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GroupSessionError> {
        let malformed = |reason: &str| GroupSessionError::Malformed {
            what: "group message",
            reason: reason.to_string(),
        };

        if bytes.len() < HEADER_SIZE + POLY1305_TAG_SIZE + SIGNATURE_SIZE {
            return Err(malformed("truncated"));
        }
        if bytes[0] != MESSAGE_VERSION {
            return Err(malformed(&format!("unsupported version {}", bytes[0])));
        }

        let mut index = [0u8; 4];
        index.copy_from_slice(&bytes[1..5]);
        let mut nonce = [0u8; 24];
        nonce.copy_from_slice(&bytes[5..HEADER_SIZE]);

        let signature_start = bytes.len() - SIGNATURE_SIZE;
        let mut signature = [0u8; SIGNATURE_SIZE];
        signature.copy_from_slice(&bytes[signature_start..]);

        Ok(Self {
            message_index: u32::from_be_bytes(index),
            nonce,
            ciphertext: bytes[HEADER_SIZE..signature_start].to_vec(),
            signature,
        })
    }
}

/// Encrypt `plaintext` under `message_key`, binding `aad`.
///
/// The returned message carries an all-zero signature; the owning session
/// signs it afterwards.
pub fn encrypt_group_message(
    plaintext: &[u8],
    message_key: &MessageKey,
    aad: &[u8],
    random_suffix: [u8; NONCE_RANDOM_SIZE],
) -> GroupMessage {
    let nonce = build_nonce(message_key.index(), random_suffix);
    let cipher = XChaCha20Poly1305::new(message_key.key().into());

    let Ok(ciphertext) =
        cipher.encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
    else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    GroupMessage {
        message_index: message_key.index(),
        nonce,
        ciphertext,
        signature: [0u8; SIGNATURE_SIZE],
    }
}

/// Decrypt a group message.
///
/// # Errors
///
/// - `DecryptionFailed`: key index mismatch, wrong key, wrong `aad` or tampering
pub fn decrypt_group_message(
    message: &GroupMessage,
    message_key: &MessageKey,
    aad: &[u8],
) -> Result<Vec<u8>, GroupSessionError> {
    if message_key.index() != message.message_index {
        return Err(GroupSessionError::DecryptionFailed {
            reason: format!(
                "index mismatch: key is {}, message is {}",
                message_key.index(),
                message.message_index
            ),
        });
    }

    let cipher = XChaCha20Poly1305::new(message_key.key().into());
    let nonce = XNonce::from_slice(&message.nonce);

    cipher
        .decrypt(nonce, Payload { msg: message.ciphertext.as_slice(), aad })
        .map_err(|_| GroupSessionError::DecryptionFailed {
            reason: "authentication failed".to_string(),
        })
}

/// Build a 24-byte nonce: 4-byte big-endian index followed by the random suffix.
fn build_nonce(index: u32, random_suffix: [u8; NONCE_RANDOM_SIZE]) -> [u8; 24] {
    let mut nonce = [0u8; 24];
    nonce[0..4].copy_from_slice(&index.to_be_bytes());
    nonce[4..24].copy_from_slice(&random_suffix);
    nonce
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::{super::ratchet::GroupRatchet, *};

    fn key_at(index: u32) -> MessageKey {
        let mut ratchet = GroupRatchet::new(&[9u8; 32]);
        ratchet.advance_to(index).unwrap()
    }

    #[test]
    fn encrypt_decrypt() {
        let key = key_at(0);
        let message = encrypt_group_message(b"hello room", &key, b"session", [1u8; 20]);

        assert_eq!(message.plaintext_len(), 10);
        let plaintext = decrypt_group_message(&message, &key, b"session").unwrap();
        assert_eq!(plaintext, b"hello room");
    }

    #[test]
    fn wrong_aad_fails() {
        let key = key_at(1);
        let message = encrypt_group_message(b"hi", &key, b"session-a", [0u8; 20]);

        assert!(matches!(
            decrypt_group_message(&message, &key, b"session-b"),
            Err(GroupSessionError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = key_at(2);
        let mut message = encrypt_group_message(b"hi there", &key, b"s", [0u8; 20]);
        message.ciphertext[0] ^= 0x01;

        assert!(decrypt_group_message(&message, &key, b"s").is_err());
    }

    #[test]
    fn index_mismatch_fails() {
        let message = encrypt_group_message(b"hi", &key_at(3), b"s", [0u8; 20]);
        assert!(decrypt_group_message(&message, &key_at(4), b"s").is_err());
    }

    #[test]
    fn nonce_carries_index() {
        let message = encrypt_group_message(b"x", &key_at(7), b"s", [0xAB; 20]);
        assert_eq!(&message.nonce[0..4], &7u32.to_be_bytes());
        assert_eq!(&message.nonce[4..], &[0xAB; 20]);
    }

    #[test]
    fn wire_bytes_decode() {
        let mut message = encrypt_group_message(b"payload", &key_at(5), b"s", [3u8; 20]);
        message.signature = [0x5A; 64];

        let decoded = GroupMessage::from_bytes(&message.to_bytes()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn truncated_bytes_rejected() {
        assert!(matches!(
            GroupMessage::from_bytes(&[MESSAGE_VERSION, 0, 0]),
            Err(GroupSessionError::Malformed { .. })
        ));
    }

    #[test]
    fn unknown_version_rejected() {
        let mut bytes = encrypt_group_message(b"p", &key_at(0), b"s", [0u8; 20]).to_bytes();
        bytes[0] = 0xFF;
        assert!(GroupMessage::from_bytes(&bytes).is_err());
    }
}
