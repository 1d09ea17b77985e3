//! In-memory reference crypto engine.
//!
//! [`MemoryEngine`] implements [`CryptoEngine`] on top of `keyloom-crypto`
//! with every piece of state held in memory. It follows the same request and
//! sync protocol a production engine would, which makes it a faithful stand-in
//! for exercising the orchestration layer:
//!
//! - Device keys and one-time keys are uploaded through keys-upload requests
//! - Tracked users are refreshed through keys-query requests
//! - Pairwise channels are opened by claiming one-time keys
//! - Room keys travel as encrypted to-device messages
//!
//! Randomness and time come from the [`Environment`], so a [`crate::SimEnv`]
//! with a fixed seed replays a run exactly.

mod account;
mod keys;
mod requests;
mod room_keys;
mod store;
mod wire;

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use keyloom_core::{
    CryptoEngine, DecryptedRoomEvent, DeviceId, DeviceListChanges, DeviceRecord, EngineError,
    Environment, Identity, KeyImportCounts, LocalTrust, OutgoingRequest, RequestId, RequestKind,
    RoomId, UserId,
};

use self::{
    account::Account,
    requests::{PendingRequests, RequestContext},
    store::Store,
};

/// Reference engine tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEngineConfig {
    /// Number of one-time keys kept published on the server
    pub one_time_key_target: usize,
    /// Messages encrypted before an outbound room session is rotated
    pub rotation_period_messages: u32,
}

impl Default for MemoryEngineConfig {
    fn default() -> Self {
        Self { one_time_key_target: 50, rotation_period_messages: 100 }
    }
}

/// Shared switch that makes the engine's store fail.
///
/// While failing, sync application, request resolution, export and import
/// return [`EngineError::Store`].
#[derive(Debug, Clone, Default)]
pub struct StoreFaults {
    failing: Arc<AtomicBool>,
}

impl StoreFaults {
    /// Start failing.
    pub fn fail(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Stop failing.
    pub fn heal(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    /// Whether store operations currently fail.
    pub fn is_failing(&self) -> bool {
        self.failing.load(Ordering::SeqCst)
    }
}

/// In-memory [`CryptoEngine`].
pub struct MemoryEngine<E: Environment> {
    env: E,
    config: MemoryEngineConfig,
    faults: StoreFaults,
    account: Account,
    store: Store,
    requests: PendingRequests,
    /// One-time keys the server reports as unclaimed. `None` until first known.
    server_one_time_keys: Option<u64>,
}

impl<E: Environment> MemoryEngine<E> {
    /// Engine for a fresh device with default tuning.
    pub fn new(env: E, user_id: UserId, device_id: DeviceId) -> Self {
        Self::with_config(env, user_id, device_id, MemoryEngineConfig::default())
    }

    /// Engine for a fresh device.
    ///
    /// The own user is tracked from the start and the own device is present
    /// in the device list, locally verified.
    pub fn with_config(
        env: E,
        user_id: UserId,
        device_id: DeviceId,
        config: MemoryEngineConfig,
    ) -> Self {
        let account = Account::new(&env, user_id, device_id);
        let mut store = Store::default();

        let own = account.own_device_record(env.wall_clock_millis());
        store.track(account.user_id());
        store
            .devices
            .entry(account.user_id().clone())
            .or_default()
            .insert(account.device_id().clone(), own);

        tracing::debug!(
            user_id = %account.user_id(),
            device_id = %account.device_id(),
            "memory engine created"
        );

        Self {
            env,
            config,
            faults: StoreFaults::default(),
            account,
            store,
            requests: PendingRequests::default(),
            server_one_time_keys: None,
        }
    }

    /// Handle to this engine's fault switch.
    pub fn faults(&self) -> StoreFaults {
        self.faults.clone()
    }

    /// Number of inbound room sessions held.
    pub fn room_key_count(&self) -> usize {
        self.store.inbound.len()
    }

    /// Whether a pairwise channel to the device with this curve25519 key exists.
    pub fn has_pairwise_session(&self, curve25519_key: &str) -> bool {
        self.store.pairwise.contains_key(curve25519_key)
    }

    fn check_store(&self) -> Result<(), EngineError> {
        if self.faults.is_failing() {
            return Err(EngineError::Store("injected store fault".to_string()));
        }
        Ok(())
    }

    fn is_own_device(&self, user_id: &UserId, device_id: &DeviceId) -> bool {
        user_id == self.account.user_id() && device_id == self.account.device_id()
    }

    fn apply_device_list_changes(&mut self, changes: &DeviceListChanges) {
        for user in &changes.changed {
            if changes.left.contains(user) {
                continue;
            }
            self.store.track(user);
            self.store.mark_outdated(user);
        }

        for user in &changes.left {
            if user == self.account.user_id() {
                continue;
            }
            self.store.untrack(user);
        }
    }
}

impl<E: Environment> CryptoEngine for MemoryEngine<E> {
    fn identity(&self) -> Identity {
        self.account.identity()
    }

    fn outgoing_requests(&mut self) -> Result<Vec<OutgoingRequest>, EngineError> {
        if !self.requests.has_pending(RequestKind::KeysUpload)
            && let Some(body) = self.keys_upload_body()
        {
            self.requests.create(
                &self.env,
                RequestKind::KeysUpload,
                body,
                RequestContext::KeysUpload,
                true,
            );
        }

        let users = self.store.take_users_to_query();
        if !users.is_empty() {
            let body = Self::keys_query_body(&users);
            self.requests.create(
                &self.env,
                RequestKind::KeysQuery,
                body,
                RequestContext::KeysQuery { users },
                true,
            );
        }

        Ok(self.requests.listed())
    }

    fn mark_request_as_sent(
        &mut self,
        request_id: &RequestId,
        kind: RequestKind,
        response_body: &str,
    ) -> Result<(), EngineError> {
        self.check_store()?;

        let context = self.requests.resolve(request_id, kind)?;
        tracing::debug!(%request_id, kind = %kind, "request resolved");

        match context {
            RequestContext::KeysUpload => self.receive_keys_upload_response(response_body),
            RequestContext::KeysQuery { users } => {
                let result = self.receive_keys_query_response(&users, response_body);
                self.store.finish_query(&users);
                if result.is_err() {
                    for user in &users {
                        self.store.mark_outdated(user);
                    }
                }
                result
            },
            RequestContext::KeysClaim => self.receive_keys_claim_response(response_body),
            RequestContext::ToDevice => Ok(()),
        }
    }

    fn update_tracked_users(&mut self, users: &[UserId]) -> Result<(), EngineError> {
        for user in users {
            if self.store.track(user) {
                tracing::debug!(user_id = %user, "tracking user");
            }
        }
        Ok(())
    }

    fn tracked_users(&self) -> Vec<UserId> {
        self.store.tracked.keys().cloned().collect()
    }

    fn get_missing_sessions(
        &mut self,
        users: &[UserId],
    ) -> Result<Option<OutgoingRequest>, EngineError> {
        Ok(self.keys_claim_body(users).map(|body| {
            self.requests.create(
                &self.env,
                RequestKind::KeysClaim,
                body,
                RequestContext::KeysClaim,
                false,
            )
        }))
    }

    fn share_room_key(
        &mut self,
        room_id: &RoomId,
        users: &[UserId],
    ) -> Result<Vec<OutgoingRequest>, EngineError> {
        self.share_room_key_with(room_id, users)
    }

    fn invalidate_group_session(&mut self, room_id: &RoomId) -> Result<bool, EngineError> {
        let existed = self.store.outbound.remove(room_id).is_some();
        if existed {
            tracing::debug!(%room_id, "outbound session invalidated");
        }
        Ok(existed)
    }

    fn encrypt(
        &mut self,
        room_id: &RoomId,
        event_type: &str,
        content: &str,
    ) -> Result<String, EngineError> {
        self.encrypt_room_event(room_id, event_type, content)
    }

    fn decrypt_room_event(
        &mut self,
        event: &str,
        room_id: &RoomId,
    ) -> Result<DecryptedRoomEvent, EngineError> {
        self.decrypt_group_event(event, room_id)
    }

    fn receive_sync_changes(
        &mut self,
        to_device_events: &str,
        changes: &DeviceListChanges,
        one_time_key_counts: Option<&BTreeMap<String, u64>>,
    ) -> Result<String, EngineError> {
        self.check_store()?;

        let batch: serde_json::Value = serde_json::from_str(to_device_events)?;
        let Some(events) = batch.get("events").and_then(serde_json::Value::as_array) else {
            return Err(EngineError::Json("to-device batch has no events array".to_string()));
        };

        let processed: Vec<serde_json::Value> =
            events.iter().map(|event| self.receive_to_device_event(event)).collect();

        self.apply_device_list_changes(changes);

        if let Some(counts) = one_time_key_counts {
            let count = counts.get(keyloom_core::SIGNED_CURVE25519).copied().unwrap_or(0);
            self.server_one_time_keys = Some(count);
        }

        tracing::debug!(
            to_device = processed.len(),
            changed = changes.changed.len(),
            left = changes.left.len(),
            "sync changes applied"
        );

        Ok(serde_json::json!({ "events": processed }).to_string())
    }

    fn device(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> Result<Option<DeviceRecord>, EngineError> {
        Ok(self.store.device(user_id, device_id).cloned())
    }

    fn user_devices(&self, user_id: &UserId) -> Result<Vec<DeviceRecord>, EngineError> {
        Ok(self.store.user_devices(user_id))
    }

    fn set_local_trust(
        &mut self,
        user_id: &UserId,
        device_id: &DeviceId,
        trust: LocalTrust,
    ) -> Result<(), EngineError> {
        let Some(record) =
            self.store.devices.get_mut(user_id).and_then(|devices| devices.get_mut(device_id))
        else {
            return Err(EngineError::UnknownDevice {
                user_id: user_id.clone(),
                device_id: device_id.clone(),
            });
        };

        record.local_trust = trust;
        tracing::debug!(%user_id, %device_id, ?trust, "local trust set");
        Ok(())
    }

    fn export_room_keys(&mut self, passphrase: &str, rounds: u32) -> Result<String, EngineError> {
        self.check_store()?;
        self.export_inbound_sessions(passphrase, rounds)
    }

    fn import_room_keys(
        &mut self,
        exported: &str,
        passphrase: &str,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<KeyImportCounts, EngineError> {
        self.check_store()?;
        self.import_inbound_sessions(exported, passphrase, progress)
    }
}

impl<E: Environment> std::fmt::Debug for MemoryEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("user_id", self.account.user_id())
            .field("device_id", self.account.device_id())
            .field("tracked_users", &self.store.tracked.len())
            .field("room_keys", &self.store.inbound.len())
            .finish_non_exhaustive()
    }
}
