//! Group sessions: a forward-only ratchet shared among room participants.
//!
//! The sender holds an [`OutboundGroupSession`]. Every recipient holds an
//! [`InboundGroupSession`] built from the [`SessionKey`] the sender shared with
//! it, and can decrypt any message at or after the shared ratchet index.

mod encryption;
mod error;
mod ratchet;
mod session;

pub use encryption::{GroupMessage, NONCE_RANDOM_SIZE};
pub use error::GroupSessionError;
pub use ratchet::{GroupRatchet, MAX_SKIP, MessageKey};
pub use session::{DecryptedGroupMessage, InboundGroupSession, OutboundGroupSession, SessionKey};
