//! Results returned by engine decryption and import.

use serde::{Deserialize, Serialize};

/// A decrypted room event as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedRoomEvent {
    /// Serialized JSON of the clear event (`type`, `content`, `room_id`)
    pub clear_event: String,
    /// Curve25519 identity key of the device that created the session
    pub sender_curve25519_key: String,
    /// Ed25519 key the sender claimed when sharing the session
    pub claimed_ed25519_key: Option<String>,
    /// Curve25519 keys of devices that forwarded the session, oldest first
    pub forwarding_curve25519_key_chain: Vec<String>,
}

/// Outcome of a room key import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyImportCounts {
    /// Keys found in the export
    pub total: usize,
    /// Keys that were new or better than the ones already held
    pub imported: usize,
}
