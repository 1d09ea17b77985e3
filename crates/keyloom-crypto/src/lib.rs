//! Keyloom Cryptographic Primitives
//!
//! Cryptographic building blocks for the Keyloom reference engine. Pure
//! functions and small state machines with deterministic outputs. Callers
//! provide random bytes so that tests can replay an engine run byte for byte.
//!
//! # Key Lifecycle
//!
//! Room events are encrypted with a group session. The session owner shares a
//! [`SessionKey`] (ratchet position, chain key, signing public key) with every
//! recipient device over a pairwise channel. Each recipient builds an
//! [`InboundGroupSession`] from it and can decrypt every message from that
//! ratchet position onwards.
//!
//! ```text
//! Random seed
//!        │
//!        ▼
//! Group Ratchet (HMAC-SHA256) → Message Keys
//!        │                             │
//!        ▼                             ▼
//! SessionKey ── pairwise seal ──▶ Recipients   XChaCha20-Poly1305 + Ed25519
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - The ratchet only moves forward; chain keys are zeroized after use
//! - A session key shared at index `n` cannot decrypt messages before `n`
//!
//! Authenticity:
//! - Every group message is signed by the session's Ed25519 key
//! - The AEAD binds the ciphertext to its session id
//! - Pairwise payloads bind both identity keys through the key agreement
//!
//! Key Export:
//! - Exported keys are sealed under an Argon2id key derived from a passphrase
//!   with a caller-chosen number of rounds

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod export;
pub mod group;
pub mod pairwise;
pub mod signing;

pub use export::{
    EXPORT_FOOTER, EXPORT_HEADER, EXPORT_NONCE_SIZE, EXPORT_SALT_SIZE, KeyExportError,
    MAX_EXPORT_ROUNDS, decrypt_key_export, encrypt_key_export,
};
pub use group::{
    DecryptedGroupMessage, GroupMessage, GroupRatchet, GroupSessionError, InboundGroupSession,
    MAX_SKIP, MessageKey, NONCE_RANDOM_SIZE, OutboundGroupSession, SessionKey,
};
pub use pairwise::{Curve25519Keypair, PAIRWISE_NONCE_SIZE, PairwiseError, PairwiseMessage};
pub use signing::{Ed25519Keypair, SignatureError, verify_signature};

/// Encode bytes as unpadded standard base64, the encoding used for every key.
pub fn encode_key(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD_NO_PAD.encode(bytes)
}

/// Decode unpadded standard base64. Returns `None` for invalid input.
pub fn decode_key(encoded: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD_NO_PAD.decode(encoded).ok()
}

/// Decode unpadded base64 into a fixed-size array.
pub fn decode_key_array<const N: usize>(encoded: &str) -> Option<[u8; N]> {
    decode_key(encoded).and_then(|bytes| bytes.try_into().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_encoding_roundtrip() {
        let bytes = [7u8; 32];
        let encoded = encode_key(&bytes);
        assert!(!encoded.ends_with('='));
        assert_eq!(decode_key_array::<32>(&encoded), Some(bytes));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let encoded = encode_key(&[1u8; 16]);
        assert_eq!(decode_key_array::<32>(&encoded), None);
    }
}
