//! Outgoing requests produced by a crypto engine.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::RequestId;

/// What an outgoing request asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    /// Upload device keys and one-time keys
    KeysUpload,
    /// Download device keys of tracked users
    KeysQuery,
    /// Claim one-time keys to open pairwise sessions
    KeysClaim,
    /// Send to-device messages
    ToDevice,
    /// Upload cross-signing signatures
    SignatureUpload,
    /// Upload room keys to server-side backup
    KeysBackup,
    /// Send an event into a room
    RoomMessage,
}

impl RequestKind {
    /// Stable name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeysUpload => "keys_upload",
            Self::KeysQuery => "keys_query",
            Self::KeysClaim => "keys_claim",
            Self::ToDevice => "to_device",
            Self::SignatureUpload => "signature_upload",
            Self::KeysBackup => "keys_backup",
            Self::RoomMessage => "room_message",
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of network work the caller performs on the engine's behalf.
///
/// The caller sends `body`, then reports the server's response with the same
/// `request_id` and `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingRequest {
    /// Correlation id, unique among unresolved requests
    pub request_id: RequestId,
    /// Request kind
    pub kind: RequestKind,
    /// Serialized JSON request body
    pub body: String,
}
