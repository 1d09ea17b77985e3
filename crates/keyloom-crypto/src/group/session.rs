//! Outbound and inbound group sessions.

use zeroize::Zeroize;

use super::{
    encryption::{GroupMessage, NONCE_RANDOM_SIZE, decrypt_group_message, encrypt_group_message},
    error::GroupSessionError,
    ratchet::GroupRatchet,
};
use crate::signing::{Ed25519Keypair, verify_signature};

/// Wire format version of [`SessionKey`]
const SESSION_KEY_VERSION: u8 = 2;

/// Version, index, chain key, signing key
const SESSION_KEY_SIZE: usize = 1 + 4 + 32 + 32;

/// Everything a recipient needs to decrypt messages from a ratchet position onwards.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey {
    /// Ratchet index the chain key belongs to
    pub index: u32,
    /// Chain key at `index`
    pub chain_key: [u8; 32],
    /// Ed25519 public key that signs every session message
    pub signing_key: [u8; 32],
}

impl SessionKey {
    /// Encode to the fixed 69-byte form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SESSION_KEY_SIZE);
        out.push(SESSION_KEY_VERSION);
        out.extend_from_slice(&self.index.to_be_bytes());
        out.extend_from_slice(&self.chain_key);
        out.extend_from_slice(&self.signing_key);
        out
    }

    /// Decode the fixed 69-byte form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GroupSessionError> {
        let malformed = |reason: String| GroupSessionError::Malformed { what: "session key", reason };

        if bytes.len() != SESSION_KEY_SIZE {
            return Err(malformed(format!("expected {SESSION_KEY_SIZE} bytes, got {}", bytes.len())));
        }
        if bytes[0] != SESSION_KEY_VERSION {
            return Err(malformed(format!("unsupported version {}", bytes[0])));
        }

        let mut index = [0u8; 4];
        index.copy_from_slice(&bytes[1..5]);
        let mut chain_key = [0u8; 32];
        chain_key.copy_from_slice(&bytes[5..37]);
        let mut signing_key = [0u8; 32];
        signing_key.copy_from_slice(&bytes[37..69]);

        Ok(Self { index: u32::from_be_bytes(index), chain_key, signing_key })
    }

    /// Unpadded base64 of [`to_bytes`](Self::to_bytes).
    pub fn to_base64(&self) -> String {
        let mut bytes = self.to_bytes();
        let encoded = crate::encode_key(&bytes);
        bytes.zeroize();
        encoded
    }

    /// Parse the unpadded base64 form.
    pub fn from_base64(encoded: &str) -> Result<Self, GroupSessionError> {
        let Some(mut bytes) = crate::decode_key(encoded) else {
            return Err(GroupSessionError::Malformed {
                what: "session key",
                reason: "invalid base64".to_string(),
            });
        };
        let key = Self::from_bytes(&bytes);
        bytes.zeroize();
        key
    }

    /// Session id this key belongs to.
    pub fn session_id(&self) -> String {
        crate::encode_key(&self.signing_key)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("index", &self.index)
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}

/// A plaintext recovered from a group message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedGroupMessage {
    /// Decrypted payload
    pub plaintext: Vec<u8>,
    /// Ratchet index of the message
    pub message_index: u32,
}

/// Sending side of a group session.
pub struct OutboundGroupSession {
    ratchet: GroupRatchet,
    signing: Ed25519Keypair,
}

impl OutboundGroupSession {
    /// Create a session from caller-provided seeds.
    pub fn new(ratchet_seed: &[u8; 32], signing_seed: &[u8; 32]) -> Self {
        Self {
            ratchet: GroupRatchet::new(ratchet_seed),
            signing: Ed25519Keypair::from_seed(signing_seed),
        }
    }

    /// Base64 of the session's signing public key.
    pub fn session_id(&self) -> String {
        crate::encode_key(&self.signing.public_key())
    }

    /// Index the next message will be encrypted at.
    pub fn message_index(&self) -> u32 {
        self.ratchet.index()
    }

    /// Session key at the current index.
    ///
    /// Recipients given this key can decrypt the next message and every one after it.
    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            index: self.ratchet.index(),
            chain_key: *self.ratchet.chain_key(),
            signing_key: self.signing.public_key(),
        }
    }

    /// Encrypt and sign `plaintext`, advancing the ratchet.
    pub fn encrypt(
        &mut self,
        plaintext: &[u8],
        random_suffix: [u8; NONCE_RANDOM_SIZE],
    ) -> Result<GroupMessage, GroupSessionError> {
        let key = self.ratchet.advance()?;
        let aad = self.signing.public_key();

        let mut message = encrypt_group_message(plaintext, &key, &aad, random_suffix);
        message.signature = self.signing.sign(&message.signed_bytes());
        Ok(message)
    }
}

impl std::fmt::Debug for OutboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundGroupSession")
            .field("session_id", &self.session_id())
            .field("message_index", &self.message_index())
            .finish_non_exhaustive()
    }
}

/// Receiving side of a group session.
///
/// Holds the ratchet at the first index it learned and forks it for every
/// decryption, so messages may arrive in any order.
pub struct InboundGroupSession {
    initial: GroupRatchet,
    signing_key: [u8; 32],
}

impl InboundGroupSession {
    /// Build a session from a shared or imported session key.
    pub fn new(session_key: &SessionKey) -> Self {
        Self {
            initial: GroupRatchet::from_parts(session_key.chain_key, session_key.index),
            signing_key: session_key.signing_key,
        }
    }

    /// Base64 of the session's signing public key.
    pub fn session_id(&self) -> String {
        crate::encode_key(&self.signing_key)
    }

    /// Earliest index this session can decrypt.
    pub fn first_known_index(&self) -> u32 {
        self.initial.index()
    }

    /// Session's Ed25519 public key.
    pub fn signing_key(&self) -> &[u8; 32] {
        &self.signing_key
    }

    /// Session key at the first known index, for export or forwarding.
    pub fn export_at_first_known(&self) -> SessionKey {
        SessionKey {
            index: self.initial.index(),
            chain_key: *self.initial.chain_key(),
            signing_key: self.signing_key,
        }
    }

    /// Verify and decrypt a group message.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature`: message was not signed by this session
    /// - `UnknownMessageIndex`: message predates the first known index
    /// - `TooFarAhead`: message index exceeds the skip window
    /// - `DecryptionFailed`: AEAD authentication failed
    pub fn decrypt(
        &self,
        message: &GroupMessage,
    ) -> Result<DecryptedGroupMessage, GroupSessionError> {
        verify_signature(&self.signing_key, &message.signed_bytes(), &message.signature)
            .map_err(|_| GroupSessionError::InvalidSignature)?;

        if message.message_index < self.initial.index() {
            return Err(GroupSessionError::UnknownMessageIndex {
                first_known: self.initial.index(),
                requested: message.message_index,
            });
        }

        let mut ratchet = self.initial.fork();
        let key = ratchet.advance_to(message.message_index)?;
        let plaintext = decrypt_group_message(message, &key, &self.signing_key)?;

        Ok(DecryptedGroupMessage { plaintext, message_index: message.message_index })
    }
}

impl std::fmt::Debug for InboundGroupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundGroupSession")
            .field("session_id", &self.session_id())
            .field("first_known_index", &self.first_known_index())
            .finish_non_exhaustive()
    }
}
