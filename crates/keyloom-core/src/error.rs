//! Errors reported by crypto engines.
//!
//! Engines speak a small, typed error vocabulary so the orchestration layer
//! can route store faults, unknown requests and decryption failures without
//! parsing messages.

use thiserror::Error;

use crate::{
    ids::{DeviceId, RequestId, RoomId, UserId},
    request::RequestKind,
};

/// Group session decryption failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MegolmError {
    /// No inbound session with this id is known.
    #[error("unknown session {session_id}")]
    MissingRoomKey {
        /// Session id named by the event
        session_id: String,
    },

    /// The message predates the first index this device learned.
    #[error("message index {requested} precedes first known index {first_known}")]
    UnknownMessageIndex {
        /// Earliest decryptable index
        first_known: u32,
        /// Index of the message
        requested: u32,
    },

    /// The same message index was already decrypted for a different event.
    #[error("message index {index} was replayed")]
    Replay {
        /// Replayed index
        index: u32,
    },

    /// The message signature does not verify.
    #[error("message signature is invalid")]
    Signature,

    /// Authenticated decryption failed.
    #[error("message authentication failed: {0}")]
    Aead(String),

    /// The session belongs to another room.
    #[error("session belongs to {expected}, event is in {found}")]
    MismatchedRoom {
        /// Room the session was shared for
        expected: RoomId,
        /// Room the event claims
        found: RoomId,
    },

    /// The event is not encrypted with the group algorithm.
    #[error("unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),

    /// The event could not be parsed.
    #[error("malformed encrypted event: {0}")]
    Malformed(String),
}

/// Errors returned by [`crate::CryptoEngine`] operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine's key store failed.
    #[error("store error: {0}")]
    Store(String),

    /// No outstanding request has this id.
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),

    /// A request was resolved with a different kind than it was created with.
    #[error("request {request_id} is {expected}, resolved as {found}")]
    RequestKindMismatch {
        /// Request id
        request_id: RequestId,
        /// Kind the engine created
        expected: RequestKind,
        /// Kind the caller reported
        found: RequestKind,
    },

    /// The room has no outbound group session.
    #[error("no outbound group session for {0}")]
    MissingGroupSession(RoomId),

    /// The device is not known.
    #[error("unknown device {device_id} of {user_id}")]
    UnknownDevice {
        /// Owner
        user_id: UserId,
        /// Device
        device_id: DeviceId,
    },

    /// Group session decryption failed.
    #[error(transparent)]
    Megolm(#[from] MegolmError),

    /// Pairwise session failure.
    #[error("pairwise session error: {0}")]
    Olm(String),

    /// Key export or import failed.
    #[error("key export error: {0}")]
    KeyExport(String),

    /// JSON crossing the engine boundary was invalid.
    #[error("invalid JSON: {0}")]
    Json(String),

    /// A server response could not be applied.
    #[error("invalid {kind} response: {reason}")]
    InvalidResponse {
        /// Kind of the request the response answers
        kind: RequestKind,
        /// Reason for failure
        reason: String,
    },
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn megolm_errors_convert() {
        let err = EngineError::from(MegolmError::Signature);
        assert!(matches!(err, EngineError::Megolm(MegolmError::Signature)));
    }

    #[test]
    fn json_errors_convert() {
        let Err(json) = serde_json::from_str::<serde_json::Value>("{") else {
            unreachable!("truncated JSON");
        };
        assert!(matches!(EngineError::from(json), EngineError::Json(_)));
    }
}
