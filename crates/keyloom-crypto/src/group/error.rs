//! Group session errors.

use thiserror::Error;

/// Errors produced by group ratchets and group sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupSessionError {
    /// The ratchet index cannot advance any further.
    #[error("ratchet index overflow at {current}")]
    IndexOverflow {
        /// Index the ratchet is stuck at
        current: u32,
    },

    /// Requested index is more than [`crate::group::MAX_SKIP`] steps ahead.
    #[error("ratchet index {requested} is too far ahead of {current}")]
    TooFarAhead {
        /// Current ratchet index
        current: u32,
        /// Requested index
        requested: u32,
    },

    /// Requested index is behind the ratchet.
    #[error("ratchet index {requested} is behind current index {current}")]
    IndexBehind {
        /// Current ratchet index
        current: u32,
        /// Requested index
        requested: u32,
    },

    /// Message was encrypted before the first index this session knows.
    #[error("message index {requested} precedes first known index {first_known}")]
    UnknownMessageIndex {
        /// First ratchet index this session can decrypt
        first_known: u32,
        /// Index of the message
        requested: u32,
    },

    /// The message signature does not verify against the session key.
    #[error("message signature is invalid")]
    InvalidSignature,

    /// Authentication tag or key mismatch.
    #[error("decryption failed: {reason}")]
    DecryptionFailed {
        /// Reason for failure
        reason: String,
    },

    /// Bytes could not be parsed as a message or session key.
    #[error("malformed {what}: {reason}")]
    Malformed {
        /// What was being decoded
        what: &'static str,
        /// Reason for failure
        reason: String,
    },
}
