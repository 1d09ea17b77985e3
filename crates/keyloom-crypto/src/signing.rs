//! Ed25519 signing keys.
//!
//! Used for device identity keys and for group session message signatures.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use thiserror::Error;

/// Signature verification failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Public key bytes are not a valid Ed25519 point.
    #[error("invalid ed25519 public key")]
    InvalidPublicKey,

    /// Signature does not match the message.
    #[error("signature verification failed")]
    Mismatch,
}

/// An Ed25519 keypair derived from a 32-byte seed.
pub struct Ed25519Keypair {
    signing: SigningKey,
}

impl Ed25519Keypair {
    /// Derive a keypair from a caller-provided seed.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self { signing: SigningKey::from_bytes(seed) }
    }

    /// Public key bytes.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Seed the keypair was derived from.
    pub fn seed(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// Sign `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Ed25519Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Keypair")
            .field("public_key", &crate::encode_key(&self.public_key()))
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 signature.
pub fn verify_signature(
    public_key: &[u8; 32],
    message: &[u8],
    signature: &[u8; 64],
) -> Result<(), SignatureError> {
    let key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;
    let signature = ed25519_dalek::Signature::from_bytes(signature);
    key.verify(message, &signature).map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let keypair = Ed25519Keypair::from_seed(&[4u8; 32]);
        let signature = keypair.sign(b"device keys");

        assert_eq!(verify_signature(&keypair.public_key(), b"device keys", &signature), Ok(()));
    }

    #[test]
    fn verify_rejects_other_message() {
        let keypair = Ed25519Keypair::from_seed(&[4u8; 32]);
        let signature = keypair.sign(b"device keys");

        assert_eq!(
            verify_signature(&keypair.public_key(), b"other keys", &signature),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn same_seed_same_key() {
        let a = Ed25519Keypair::from_seed(&[1u8; 32]);
        let b = Ed25519Keypair::from_seed(&[1u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_eq!(a.seed(), [1u8; 32]);
    }
}
