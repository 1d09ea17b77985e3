//! Fuzz target for group message decoding and decryption
//!
//! # Strategy
//!
//! - Random bytes: arbitrary input to `GroupMessage::from_bytes`
//! - Bit flip: a valid message with one byte modified before decryption
//! - Index shift: a valid message re-labelled with another ratchet index
//! - Session key: arbitrary base64 text to `SessionKey::from_base64`
//!
//! # Invariants
//!
//! - Decoding never panics on malformed input
//! - A modified message never decrypts
//! - An unmodified message decrypts to its plaintext

#![no_main]

use arbitrary::Arbitrary;
use keyloom_crypto::{GroupMessage, InboundGroupSession, OutboundGroupSession, SessionKey};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
enum GroupAttack {
    RandomBytes { bytes: Vec<u8> },
    BitFlip { seed: [u8; 32], plaintext: Vec<u8>, position: u16, mask: u8 },
    IndexShift { seed: [u8; 32], plaintext: Vec<u8>, index: u32 },
    SessionKeyText { text: String },
}

fn session(seed: [u8; 32]) -> (OutboundGroupSession, InboundGroupSession) {
    let mut signing_seed = seed;
    signing_seed.reverse();
    let outbound = OutboundGroupSession::new(&seed, &signing_seed);
    let inbound = InboundGroupSession::new(&outbound.session_key());
    (outbound, inbound)
}

fuzz_target!(|attack: GroupAttack| {
    match attack {
        GroupAttack::RandomBytes { bytes } => {
            if let Ok(message) = GroupMessage::from_bytes(&bytes) {
                assert_eq!(message.to_bytes(), bytes);
            }
        }

        GroupAttack::BitFlip { seed, plaintext, position, mask } => {
            let (mut outbound, inbound) = session(seed);
            let message = outbound.encrypt(&plaintext, [7; 20]).unwrap();
            let mut bytes = message.to_bytes();

            let decrypted = inbound.decrypt(&message).unwrap();
            assert_eq!(decrypted.plaintext, plaintext);

            if mask == 0 {
                return;
            }
            let position = position as usize % bytes.len();
            bytes[position] ^= mask;

            if let Ok(tampered) = GroupMessage::from_bytes(&bytes) {
                assert!(inbound.decrypt(&tampered).is_err());
            }
        }

        GroupAttack::IndexShift { seed, plaintext, index } => {
            let (mut outbound, inbound) = session(seed);
            let mut message = outbound.encrypt(&plaintext, [9; 20]).unwrap();
            if index == message.message_index {
                return;
            }
            message.message_index = index;
            assert!(inbound.decrypt(&message).is_err());
        }

        GroupAttack::SessionKeyText { text } => {
            if let Ok(key) = SessionKey::from_base64(&text) {
                let _ = InboundGroupSession::new(&key);
            }
        }
    }
});
