//! The crypto engine contract.
//!
//! An engine owns every piece of key material. The orchestration layer only
//! calls these operations, always from a single thread and one call at a time,
//! so implementations need `&mut self` but no internal locking.
//!
//! JSON crosses this boundary as strings. Callers serialize before the call and
//! parse after it; engines never see caller-side types.

use std::collections::BTreeMap;

use crate::{
    device::{DeviceRecord, Identity, LocalTrust},
    error::EngineError,
    event::{DecryptedRoomEvent, KeyImportCounts},
    ids::{DeviceId, RequestId, RoomId, UserId},
    request::{OutgoingRequest, RequestKind},
    sync::DeviceListChanges,
};

/// Operations a crypto engine provides to the orchestration layer.
pub trait CryptoEngine: Send + 'static {
    /// Own user, device and identity keys.
    fn identity(&self) -> Identity;

    /// Snapshot of unresolved requests.
    ///
    /// Calling this repeatedly returns the same requests until each is
    /// resolved with [`mark_request_as_sent`](Self::mark_request_as_sent).
    fn outgoing_requests(&mut self) -> Result<Vec<OutgoingRequest>, EngineError>;

    /// Resolve an outstanding request with the server's response.
    ///
    /// # Errors
    ///
    /// - `UnknownRequest`: the id is not outstanding, including a second
    ///   resolution of the same id
    fn mark_request_as_sent(
        &mut self,
        request_id: &RequestId,
        kind: RequestKind,
        response_body: &str,
    ) -> Result<(), EngineError>;

    /// Add users to the tracked set and schedule a key query for them.
    fn update_tracked_users(&mut self, users: &[UserId]) -> Result<(), EngineError>;

    /// Currently tracked users.
    fn tracked_users(&self) -> Vec<UserId>;

    /// A key claim request if any device of `users` lacks a pairwise session.
    fn get_missing_sessions(
        &mut self,
        users: &[UserId],
    ) -> Result<Option<OutgoingRequest>, EngineError>;

    /// Create or rotate the room's outbound session and share it with `users`.
    ///
    /// Returns no requests when every recipient already holds the session.
    fn share_room_key(
        &mut self,
        room_id: &RoomId,
        users: &[UserId],
    ) -> Result<Vec<OutgoingRequest>, EngineError>;

    /// Discard the room's outbound session. Returns whether one existed.
    fn invalidate_group_session(&mut self, room_id: &RoomId) -> Result<bool, EngineError>;

    /// Encrypt serialized event content for a room.
    ///
    /// # Errors
    ///
    /// - `MissingGroupSession`: [`share_room_key`](Self::share_room_key) was
    ///   never called for the room
    fn encrypt(
        &mut self,
        room_id: &RoomId,
        event_type: &str,
        content: &str,
    ) -> Result<String, EngineError>;

    /// Decrypt a serialized encrypted room event.
    fn decrypt_room_event(
        &mut self,
        event: &str,
        room_id: &RoomId,
    ) -> Result<DecryptedRoomEvent, EngineError>;

    /// Apply one sync delta atomically.
    ///
    /// `to_device_events` is a JSON object `{"events": [...]}`. Returns the
    /// processed events in the same shape, decrypted where possible.
    fn receive_sync_changes(
        &mut self,
        to_device_events: &str,
        changes: &DeviceListChanges,
        one_time_key_counts: Option<&BTreeMap<String, u64>>,
    ) -> Result<String, EngineError>;

    /// A single device, if known.
    fn device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceRecord>, EngineError>;

    /// Every known device of a user.
    fn user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceRecord>, EngineError>;

    /// Record a local trust decision.
    fn set_local_trust(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> Result<(), EngineError>;

    /// Export every inbound group session as passphrase-protected text.
    fn export_room_keys(&mut self, passphrase: &str, rounds: u32) -> Result<String, EngineError>;

    /// Import sessions from exported text.
    ///
    /// `progress` is called with `(processed, total)` after each key.
    fn import_room_keys(
        &mut self,
        exported: &str,
        passphrase: &str,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<KeyImportCounts, EngineError>;
}
