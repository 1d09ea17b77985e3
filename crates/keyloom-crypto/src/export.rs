//! Passphrase-protected key export armor.
//!
//! Binary layout before armoring:
//!
//! ```text
//! version (1) | salt (16) | rounds (u32 BE) | nonce (24) | ciphertext
//! ```
//!
//! The ciphertext is `XChaCha20-Poly1305` under a 32-byte Argon2id key derived
//! from the passphrase and salt, with `rounds` as the time cost. The armor
//! header is bound as associated data. The result is standard base64 wrapped
//! at 76 columns between [`EXPORT_HEADER`] and [`EXPORT_FOOTER`].

use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine;
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit, Payload},
};
use thiserror::Error;
use zeroize::Zeroize;

/// First armor line.
pub const EXPORT_HEADER: &str = "-----BEGIN MEGOLM SESSION DATA-----";

/// Last armor line.
pub const EXPORT_FOOTER: &str = "-----END MEGOLM SESSION DATA-----";

/// Salt size (16 bytes)
pub const EXPORT_SALT_SIZE: usize = 16;

/// Nonce size (24 bytes)
pub const EXPORT_NONCE_SIZE: usize = 24;

/// Highest accepted Argon2 time cost.
pub const MAX_EXPORT_ROUNDS: u32 = 64;

/// Argon2 memory cost in KiB (19 MiB)
const ARGON2_MEMORY_KIB: u32 = 19 * 1024;

const EXPORT_VERSION: u8 = 1;

const LINE_WIDTH: usize = 76;

/// Version, salt, rounds, nonce
const HEADER_SIZE: usize = 1 + EXPORT_SALT_SIZE + 4 + EXPORT_NONCE_SIZE;

/// Key export failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyExportError {
    /// Rounds outside `1..=MAX_EXPORT_ROUNDS`.
    #[error("invalid export rounds {rounds}, expected 1..={MAX_EXPORT_ROUNDS}")]
    InvalidRounds {
        /// Requested rounds
        rounds: u32,
    },

    /// Armor header or footer is missing.
    #[error("missing export armor")]
    MissingArmor,

    /// Armored body is not valid base64.
    #[error("export body is not valid base64")]
    Base64,

    /// Unknown binary format version.
    #[error("unsupported export version {0}")]
    UnsupportedVersion(u8),

    /// Body is too short to hold the header and a tag.
    #[error("export is truncated")]
    Truncated,

    /// Argon2 rejected the parameters.
    #[error("key derivation failed: {reason}")]
    KeyDerivation {
        /// Reason for failure
        reason: String,
    },

    /// Authentication failed, which in practice means the passphrase is wrong.
    #[error("wrong passphrase or corrupted export")]
    WrongPassphrase,
}

/// Seal `plaintext` under `passphrase` and armor the result.
///
/// # Errors
///
/// - `InvalidRounds`: `rounds` is zero or above [`MAX_EXPORT_ROUNDS`]
/// - `KeyDerivation`: Argon2 rejected the parameters
pub fn encrypt_key_export(
    plaintext: &[u8],
    passphrase: &str,
    rounds: u32,
    salt: [u8; EXPORT_SALT_SIZE],
    nonce: [u8; EXPORT_NONCE_SIZE],
) -> Result<String, KeyExportError> {
    check_rounds(rounds)?;

    let mut key = derive_key(passphrase, &salt, rounds)?;
    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();

    let Ok(ciphertext) = cipher.encrypt(
        XNonce::from_slice(&nonce),
        Payload { msg: plaintext, aad: EXPORT_HEADER.as_bytes() },
    ) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut body = Vec::with_capacity(HEADER_SIZE + ciphertext.len());
    body.push(EXPORT_VERSION);
    body.extend_from_slice(&salt);
    body.extend_from_slice(&rounds.to_be_bytes());
    body.extend_from_slice(&nonce);
    body.extend_from_slice(&ciphertext);

    let encoded = base64::engine::general_purpose::STANDARD.encode(&body);

    let mut armored = String::with_capacity(encoded.len() + encoded.len() / LINE_WIDTH + 80);
    armored.push_str(EXPORT_HEADER);
    armored.push('\n');
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(LINE_WIDTH));
        armored.push_str(line);
        armored.push('\n');
        rest = tail;
    }
    armored.push_str(EXPORT_FOOTER);
    armored.push('\n');

    Ok(armored)
}

/// Strip the armor and open the export with `passphrase`.
///
/// # Errors
///
/// - `MissingArmor`, `Base64`, `UnsupportedVersion`, `Truncated`: malformed input
/// - `InvalidRounds`: the embedded rounds are out of range
/// - `WrongPassphrase`: authentication failed
pub fn decrypt_key_export(armored: &str, passphrase: &str) -> Result<Vec<u8>, KeyExportError> {
    let body = strip_armor(armored)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(body)
        .map_err(|_| KeyExportError::Base64)?;

    let Some(&version) = bytes.first() else {
        return Err(KeyExportError::Truncated);
    };
    if version != EXPORT_VERSION {
        return Err(KeyExportError::UnsupportedVersion(version));
    }
    if bytes.len() < HEADER_SIZE + 16 {
        return Err(KeyExportError::Truncated);
    }

    let mut salt = [0u8; EXPORT_SALT_SIZE];
    salt.copy_from_slice(&bytes[1..1 + EXPORT_SALT_SIZE]);
    let mut rounds = [0u8; 4];
    rounds.copy_from_slice(&bytes[1 + EXPORT_SALT_SIZE..5 + EXPORT_SALT_SIZE]);
    let rounds = u32::from_be_bytes(rounds);
    check_rounds(rounds)?;
    let nonce = XNonce::from_slice(&bytes[5 + EXPORT_SALT_SIZE..HEADER_SIZE]);

    let mut key = derive_key(passphrase, &salt, rounds)?;
    let cipher = XChaCha20Poly1305::new((&key).into());
    key.zeroize();

    cipher
        .decrypt(nonce, Payload { msg: &bytes[HEADER_SIZE..], aad: EXPORT_HEADER.as_bytes() })
        .map_err(|_| KeyExportError::WrongPassphrase)
}

fn check_rounds(rounds: u32) -> Result<(), KeyExportError> {
    if rounds == 0 || rounds > MAX_EXPORT_ROUNDS {
        return Err(KeyExportError::InvalidRounds { rounds });
    }
    Ok(())
}

fn derive_key(passphrase: &str, salt: &[u8], rounds: u32) -> Result<[u8; 32], KeyExportError> {
    let params = Params::new(ARGON2_MEMORY_KIB, rounds, 1, Some(32))
        .map_err(|e| KeyExportError::KeyDerivation { reason: e.to_string() })?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, &mut key)
        .map_err(|e| KeyExportError::KeyDerivation { reason: e.to_string() })?;
    Ok(key)
}

fn strip_armor(armored: &str) -> Result<String, KeyExportError> {
    let mut lines = armored.lines().map(str::trim).skip_while(|line| line.is_empty());

    if lines.next() != Some(EXPORT_HEADER) {
        return Err(KeyExportError::MissingArmor);
    }

    let mut body = String::new();
    for line in lines {
        if line == EXPORT_FOOTER {
            return Ok(body);
        }
        body.push_str(line);
    }

    Err(KeyExportError::MissingArmor)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn export(plaintext: &[u8], passphrase: &str) -> String {
        encrypt_key_export(plaintext, passphrase, 1, [3u8; 16], [5u8; 24]).unwrap()
    }

    #[test]
    fn export_and_import() {
        let armored = export(b"[{\"room_id\":\"!a:b\"}]", "correct horse");

        assert!(armored.starts_with(EXPORT_HEADER));
        assert!(armored.trim_end().ends_with(EXPORT_FOOTER));
        assert!(armored.lines().all(|line| line.len() <= LINE_WIDTH));

        let plaintext = decrypt_key_export(&armored, "correct horse").unwrap();
        assert_eq!(plaintext, b"[{\"room_id\":\"!a:b\"}]");
    }

    #[test]
    fn long_payload_wraps() {
        let armored = export(&[0x11; 300], "pw");
        assert!(armored.lines().count() > 3);
        assert_eq!(decrypt_key_export(&armored, "pw").unwrap(), vec![0x11; 300]);
    }

    #[test]
    fn wrong_passphrase_fails() {
        let armored = export(b"keys", "correct horse");
        assert_eq!(
            decrypt_key_export(&armored, "battery staple"),
            Err(KeyExportError::WrongPassphrase)
        );
    }

    #[test]
    fn rounds_out_of_range() {
        assert_eq!(
            encrypt_key_export(b"k", "pw", 0, [0u8; 16], [0u8; 24]),
            Err(KeyExportError::InvalidRounds { rounds: 0 })
        );
        assert!(encrypt_key_export(b"k", "pw", MAX_EXPORT_ROUNDS + 1, [0u8; 16], [0u8; 24]).is_err());
    }

    #[test]
    fn missing_armor_rejected() {
        assert_eq!(decrypt_key_export("AAAA", "pw"), Err(KeyExportError::MissingArmor));

        let armored = export(b"keys", "pw");
        let without_footer: String =
            armored.lines().filter(|line| *line != EXPORT_FOOTER).collect::<Vec<_>>().join("\n");
        assert_eq!(decrypt_key_export(&without_footer, "pw"), Err(KeyExportError::MissingArmor));
    }

    #[test]
    fn bad_base64_rejected() {
        let armored = format!("{EXPORT_HEADER}\n!!!!\n{EXPORT_FOOTER}\n");
        assert_eq!(decrypt_key_export(&armored, "pw"), Err(KeyExportError::Base64));
    }

    #[test]
    fn unknown_version_rejected() {
        let body = base64::engine::general_purpose::STANDARD.encode([9u8; 80]);
        let armored = format!("{EXPORT_HEADER}\n{body}\n{EXPORT_FOOTER}\n");
        assert_eq!(decrypt_key_export(&armored, "pw"), Err(KeyExportError::UnsupportedVersion(9)));
    }

    #[test]
    fn truncated_rejected() {
        let body = base64::engine::general_purpose::STANDARD.encode([EXPORT_VERSION; 10]);
        let armored = format!("{EXPORT_HEADER}\n{body}\n{EXPORT_FOOTER}\n");
        assert_eq!(decrypt_key_export(&armored, "pw"), Err(KeyExportError::Truncated));
    }
}
