//! Error types for the orchestration layer.

use std::string::FromUtf8Error;

use keyloom_core::{EngineError, RequestId, RoomId};
use thiserror::Error;

/// Errors returned by [`crate::Machine`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// No outstanding request has this correlation id.
    #[error("unknown request {0}")]
    UnknownRequest(RequestId),

    /// Encryption was attempted before the room key was shared.
    #[error("no outbound group session for {0}; share the room key first")]
    MissingGroupSession(RoomId),

    /// A room event could not be decrypted.
    #[error("unable to decrypt: {reason}")]
    UnableToDecrypt {
        /// Underlying cause, naming the algorithm
        reason: String,
    },

    /// The engine's key store failed.
    #[error("crypto store error: {0}")]
    Store(String),

    /// Any other engine failure.
    #[error(transparent)]
    Engine(EngineError),

    /// A value could not be converted to or from its wire form.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Exported key bytes are not valid UTF-8.
    #[error("invalid key export: {0}")]
    InvalidExport(#[from] FromUtf8Error),

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The engine worker has stopped.
    #[error("crypto engine is unavailable")]
    EngineUnavailable,

    /// The engine worker could not be started.
    #[error("failed to start engine worker: {0}")]
    Worker(String),
}

impl From<EngineError> for ClientError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::UnknownRequest(request_id) => Self::UnknownRequest(request_id),
            EngineError::MissingGroupSession(room_id) => Self::MissingGroupSession(room_id),
            EngineError::Store(reason) => Self::Store(reason),
            other => Self::Engine(other),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use keyloom_core::{MegolmError, RequestKind};

    use super::*;

    #[test]
    fn engine_errors_route_to_dedicated_kinds() {
        let id = RequestId::try_from("r1").unwrap();
        let room = RoomId::try_from("!r:example.org").unwrap();

        assert!(matches!(
            ClientError::from(EngineError::UnknownRequest(id.clone())),
            ClientError::UnknownRequest(found) if found == id
        ));
        assert!(matches!(
            ClientError::from(EngineError::MissingGroupSession(room.clone())),
            ClientError::MissingGroupSession(found) if found == room
        ));
        assert!(matches!(
            ClientError::from(EngineError::Store("disk".to_string())),
            ClientError::Store(reason) if reason == "disk"
        ));
    }

    #[test]
    fn other_engine_errors_stay_wrapped() {
        let mismatch = EngineError::RequestKindMismatch {
            request_id: RequestId::try_from("r1").unwrap(),
            expected: RequestKind::KeysQuery,
            found: RequestKind::KeysClaim,
        };
        assert!(matches!(ClientError::from(mismatch), ClientError::Engine(_)));
        assert!(matches!(
            ClientError::from(EngineError::Megolm(MegolmError::Signature)),
            ClientError::Engine(_)
        ));
    }
}
