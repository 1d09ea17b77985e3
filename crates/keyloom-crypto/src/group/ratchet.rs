//! Forward-only ratchet for group message keys
//!
//! # Security Properties
//!
//! - Forward Secrecy: Old chain keys are overwritten when advancing
//! - Key Uniqueness: Each index produces a unique message key
//! - Determinism: Same chain key and index always produce the same sequence

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use super::error::GroupSessionError;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving the next chain key
const CHAIN_LABEL: &[u8] = b"chain";

/// Label for deriving a message key
const MESSAGE_LABEL: &[u8] = b"message";

/// Maximum number of indices to skip when catching up.
pub const MAX_SKIP: u32 = 10_000;

/// A message key derived from the ratchet.
///
/// Used for exactly one message, then dropped.
#[derive(Clone)]
pub struct MessageKey {
    key: [u8; 32],
    index: u32,
}

impl MessageKey {
    /// 32-byte symmetric key for XChaCha20-Poly1305 AEAD.
    pub fn key(&self) -> &[u8; 32] {
        &self.key
    }

    /// Ratchet index this key was derived at.
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for MessageKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Forward-secure HMAC ratchet.
///
/// Each [`advance()`](Self::advance) call derives the message key for the
/// current index, replaces the chain key with its successor and increments the
/// index. A ratchet can be rebuilt at any known position with
/// [`from_parts`](Self::from_parts), which is how inbound sessions decrypt
/// messages out of order without keeping every intermediate key.
pub struct GroupRatchet {
    chain_key: [u8; 32],
    index: u32,
}

impl GroupRatchet {
    /// Create a new ratchet at index 0.
    pub fn new(seed: &[u8; 32]) -> Self {
        Self { chain_key: *seed, index: 0 }
    }

    /// Rebuild a ratchet at a known position.
    pub fn from_parts(chain_key: [u8; 32], index: u32) -> Self {
        Self { chain_key, index }
    }

    /// Current index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Chain key at the current index.
    pub fn chain_key(&self) -> &[u8; 32] {
        &self.chain_key
    }

    /// Independent copy of this ratchet at the same position.
    pub fn fork(&self) -> Self {
        Self { chain_key: self.chain_key, index: self.index }
    }

    /// Derive the message key for the current index and step forward.
    pub fn advance(&mut self) -> Result<MessageKey, GroupSessionError> {
        if self.index == u32::MAX {
            return Err(GroupSessionError::IndexOverflow { current: self.index });
        }

        let message_key = self.derive(MESSAGE_LABEL);
        let next_chain_key = self.derive(CHAIN_LABEL);

        self.chain_key.zeroize();
        self.chain_key = next_chain_key;

        let current = self.index;
        self.index += 1;

        Ok(MessageKey { key: message_key, index: current })
    }

    /// Advance until the message key for `target` is produced.
    pub fn advance_to(&mut self, target: u32) -> Result<MessageKey, GroupSessionError> {
        if target < self.index {
            return Err(GroupSessionError::IndexBehind { current: self.index, requested: target });
        }

        if target - self.index > MAX_SKIP {
            return Err(GroupSessionError::TooFarAhead { current: self.index, requested: target });
        }

        loop {
            let key = self.advance()?;
            if key.index() == target {
                return Ok(key);
            }
        }
    }

    fn derive(&self, label: &[u8]) -> [u8; 32] {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.chain_key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(label);
        let result = mac.finalize().into_bytes();

        let mut key = [0u8; 32];
        key.copy_from_slice(&result);
        key
    }
}

impl Drop for GroupRatchet {
    fn drop(&mut self) {
        self.chain_key.zeroize();
    }
}
