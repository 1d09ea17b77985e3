//! Room event encryption and decryption.

use keyloom_core::{CryptoEngine, EngineError, MEGOLM_V1_ALGORITHM, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{error::ClientError, machine::Machine};

/// An encrypted room event as delivered by the server.
///
/// Fields this type does not name are kept in `extra` so the event reaches the
/// engine unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    /// Event type, `m.room.encrypted` for encrypted events
    #[serde(rename = "type")]
    pub event_type: String,
    /// Server-assigned event id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    /// Sending user
    pub sender: UserId,
    /// Room the event was sent to
    pub room_id: RoomId,
    /// Encrypted content
    pub content: Value,
    /// Every other field of the event
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A successfully decrypted room event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedEvent {
    /// Type of the clear event
    pub event_type: String,
    /// Clear content
    pub content: Value,
    /// Curve25519 key of the device that created the session
    pub sender_curve25519_key: String,
    /// Ed25519 key the sender claimed when sharing the session
    pub claimed_ed25519_key: Option<String>,
    /// Curve25519 keys of the devices that forwarded the session, oldest first
    pub forwarding_curve25519_key_chain: Vec<String>,
}

#[derive(Deserialize)]
struct ClearEvent {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    content: Value,
}

/// Collapse an engine decryption failure into the single user-facing kind.
pub(crate) fn unable_to_decrypt(err: &EngineError) -> ClientError {
    ClientError::UnableToDecrypt { reason: format!("{MEGOLM_V1_ALGORITHM}: {err}") }
}

impl<E: CryptoEngine> Machine<E> {
    /// Encrypt `content` for `room_id`.
    ///
    /// # Errors
    ///
    /// `MissingGroupSession` unless [`share_room_key`](Self::share_room_key)
    /// ran for the room first.
    pub async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> Result<Value, ClientError> {
        let plaintext = serde_json::to_string(content)?;
        let (room, event_type) = (room_id.clone(), event_type.to_string());

        let encrypted = self
            .queue
            .run(move |engine| engine.encrypt(&room, &event_type, &plaintext))
            .await??;

        tracing::debug!(%room_id, "room event encrypted");
        Ok(serde_json::from_str(&encrypted)?)
    }

    /// Decrypt a room event.
    ///
    /// # Errors
    ///
    /// - `UnableToDecrypt`: the engine could not decrypt the event; the reason
    ///   names the algorithm and the cause
    /// - `Serialization`: the event or the clear payload is not valid JSON
    /// - `EngineUnavailable`: the engine worker stopped
    pub async fn decrypt_room_event(&self, event: &RoomEvent) -> Result<DecryptedEvent, ClientError> {
        let wire = serde_json::to_string(event)?;
        let room = event.room_id.clone();

        let decrypted = self
            .queue
            .run(move |engine| engine.decrypt_room_event(&wire, &room))
            .await?
            .map_err(|err| {
                tracing::warn!(
                    room_id = %event.room_id,
                    event_id = event.event_id.as_deref().unwrap_or_default(),
                    error = %err,
                    "unable to decrypt room event"
                );
                unable_to_decrypt(&err)
            })?;

        let clear: ClearEvent = serde_json::from_str(&decrypted.clear_event)?;
        Ok(DecryptedEvent {
            event_type: clear.event_type,
            content: clear.content,
            sender_curve25519_key: decrypted.sender_curve25519_key,
            claimed_ed25519_key: decrypted.claimed_ed25519_key,
            forwarding_curve25519_key_chain: decrypted.forwarding_curve25519_key_chain,
        })
    }
}
