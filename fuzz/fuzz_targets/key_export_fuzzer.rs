//! Fuzz target for passphrase-protected key exports
//!
//! # Strategy
//!
//! - Random text: arbitrary input to `decrypt_key_export`
//! - Armored garbage: random payload between valid header and footer lines
//! - Truncation: a valid export cut short
//!
//! # Invariants
//!
//! - Decryption never panics on malformed input
//! - Huge claimed round counts are rejected, not computed
//! - A truncated export never decrypts

#![no_main]

use arbitrary::Arbitrary;
use keyloom_crypto::{EXPORT_FOOTER, EXPORT_HEADER, decrypt_key_export, encrypt_key_export};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum ExportAttack {
    RandomText { text: String, passphrase: String },
    ArmoredGarbage { body: String },
    Truncated { plaintext: Vec<u8>, cut: u16 },
}

fuzz_target!(|attack: ExportAttack| {
    match attack {
        ExportAttack::RandomText { text, passphrase } => {
            let _ = decrypt_key_export(&text, &passphrase);
        }

        ExportAttack::ArmoredGarbage { body } => {
            let armored = format!("{EXPORT_HEADER}\n{body}\n{EXPORT_FOOTER}");
            let _ = decrypt_key_export(&armored, "passphrase");
        }

        ExportAttack::Truncated { plaintext, cut } => {
            let exported = encrypt_key_export(&plaintext, "pass", 1, [1; 16], [2; 24]).unwrap();
            let Some(footer) = exported.find(EXPORT_FOOTER) else {
                return;
            };
            let cut = cut as usize % footer.max(1);
            if let Some(truncated) = exported.get(..cut) {
                assert!(decrypt_key_export(truncated, "pass").is_err());
            }
        }
    }
});
