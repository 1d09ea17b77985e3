//! Room key sharing, room event encryption and key export.

use std::collections::{BTreeMap, BTreeSet};

use keyloom_core::{
    DecryptedRoomEvent, DeviceRecord, EngineError, Environment, KeyImportCounts,
    MEGOLM_V1_ALGORITHM, MegolmError, OLM_V1_ALGORITHM, OutgoingRequest, RequestKind, RoomId,
    UserId,
};
use keyloom_crypto::{
    EXPORT_NONCE_SIZE, EXPORT_SALT_SIZE, GroupMessage, GroupSessionError, InboundGroupSession,
    NONCE_RANDOM_SIZE, OutboundGroupSession, PAIRWISE_NONCE_SIZE, PairwiseMessage, SessionKey,
    decode_key, decode_key_array, decrypt_key_export, encode_key, encrypt_key_export,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use super::{
    MemoryEngine,
    requests::RequestContext,
    store::{InboundRoomSession, OutboundRoomSession},
};

const ROOM_KEY_EVENT: &str = "m.room_key";
const FORWARDED_ROOM_KEY_EVENT: &str = "m.forwarded_room_key";
const ENCRYPTED_EVENT: &str = "m.room.encrypted";

/// One entry of a key export.
#[derive(Debug, Serialize, Deserialize)]
struct ExportedRoomKey {
    algorithm: String,
    room_id: RoomId,
    sender_key: String,
    session_id: String,
    session_key: String,
    #[serde(default)]
    sender_claimed_keys: BTreeMap<String, String>,
    #[serde(default)]
    forwarding_curve25519_key_chain: Vec<String>,
}

/// A pairwise payload opened by this device.
struct DecryptedToDevice {
    event_type: String,
    content: Value,
    sender_key: String,
    claimed_ed25519_key: Option<String>,
}

fn megolm_error(err: GroupSessionError) -> MegolmError {
    match err {
        GroupSessionError::InvalidSignature => MegolmError::Signature,
        GroupSessionError::UnknownMessageIndex { first_known, requested } => {
            MegolmError::UnknownMessageIndex { first_known, requested }
        },
        GroupSessionError::Malformed { reason, .. } => MegolmError::Malformed(reason),
        other => MegolmError::Aead(other.to_string()),
    }
}

fn olm_error(reason: impl Into<String>) -> EngineError {
    EngineError::Olm(reason.into())
}

impl<E: Environment> MemoryEngine<E> {
    /// Share the room's outbound session with every eligible device of `users`.
    pub(super) fn share_room_key_with(
        &mut self,
        room_id: &RoomId,
        users: &[UserId],
    ) -> Result<Vec<OutgoingRequest>, EngineError> {
        let mut eligible = BTreeSet::new();
        let mut recipients = Vec::new();

        for user in users {
            for record in self.store.user_devices(user) {
                if self.is_own_device(user, &record.device_id) || record.is_blacklisted() {
                    continue;
                }
                eligible.insert((record.user_id.clone(), record.device_id.clone()));

                if record.curve25519_key().is_some_and(|k| self.store.pairwise.contains_key(k)) {
                    recipients.push(record);
                } else {
                    tracing::warn!(
                        %room_id,
                        user_id = %record.user_id,
                        device_id = %record.device_id,
                        "no pairwise session, skipping recipient"
                    );
                }
            }
        }

        let rotate = match self.store.outbound.get(room_id) {
            None => true,
            Some(outbound) => {
                outbound.messages_encrypted >= self.config.rotation_period_messages
                    || !outbound.shared_with.is_subset(&eligible)
            },
        };
        if rotate {
            self.create_outbound_session(room_id);
        }

        let Some(outbound) = self.store.outbound.get(room_id) else {
            return Err(EngineError::MissingGroupSession(room_id.clone()));
        };
        let new_recipients: Vec<DeviceRecord> = recipients
            .into_iter()
            .filter(|r| !outbound.shared_with.contains(&(r.user_id.clone(), r.device_id.clone())))
            .collect();
        if new_recipients.is_empty() {
            return Ok(Vec::new());
        }

        let room_key = json!({
            "algorithm": MEGOLM_V1_ALGORITHM,
            "room_id": room_id,
            "session_id": outbound.session.session_id(),
            "session_key": outbound.session.session_key().to_base64(),
        });

        let mut messages: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
        for record in &new_recipients {
            let content = self.encrypt_to_device(record, ROOM_KEY_EVENT, room_key.clone())?;
            messages
                .entry(record.user_id.to_string())
                .or_default()
                .insert(record.device_id.to_string(), content);
        }

        if let Some(outbound) = self.store.outbound.get_mut(room_id) {
            outbound.shared_with.extend(
                new_recipients.iter().map(|r| (r.user_id.clone(), r.device_id.clone())),
            );
        }

        tracing::info!(%room_id, recipients = new_recipients.len(), "room key shared");

        let body = self.to_device_body(ENCRYPTED_EVENT, &messages);
        Ok(vec![self.requests.create(
            &self.env,
            RequestKind::ToDevice,
            body,
            RequestContext::ToDevice,
            false,
        )])
    }

    fn create_outbound_session(&mut self, room_id: &RoomId) {
        let session =
            OutboundGroupSession::new(&self.env.random_seed(), &self.env.random_seed());

        // Keep an inbound copy so our own messages decrypt.
        self.store.inbound.insert(
            session.session_id(),
            InboundRoomSession {
                room_id: room_id.clone(),
                session: InboundGroupSession::new(&session.session_key()),
                sender_key: self.account.curve25519_key(),
                claimed_ed25519_key: Some(self.account.ed25519_key()),
                forwarding_chain: Vec::new(),
                decrypted: BTreeMap::new(),
            },
        );

        tracing::info!(%room_id, session_id = %session.session_id(), "outbound session created");
        self.store.outbound.insert(
            room_id.clone(),
            OutboundRoomSession { session, shared_with: BTreeSet::new(), messages_encrypted: 0 },
        );
    }

    fn to_device_body(
        &self,
        event_type: &str,
        messages: &BTreeMap<String, Map<String, Value>>,
    ) -> String {
        json!({
            "event_type": event_type,
            "txn_id": format!("{:016x}", self.env.random_u64()),
            "messages": messages,
        })
        .to_string()
    }

    pub(super) fn encrypt_room_event(
        &mut self,
        room_id: &RoomId,
        event_type: &str,
        content: &str,
    ) -> Result<String, EngineError> {
        let content: Value = serde_json::from_str(content)?;

        let Some(outbound) = self.store.outbound.get_mut(room_id) else {
            return Err(EngineError::MissingGroupSession(room_id.clone()));
        };

        let plaintext = json!({ "type": event_type, "content": content, "room_id": room_id });
        let mut suffix = [0u8; NONCE_RANDOM_SIZE];
        self.env.random_bytes(&mut suffix);

        let message = outbound
            .session
            .encrypt(plaintext.to_string().as_bytes(), suffix)
            .map_err(megolm_error)?;
        outbound.messages_encrypted += 1;

        Ok(json!({
            "algorithm": MEGOLM_V1_ALGORITHM,
            "sender_key": self.account.curve25519_key(),
            "device_id": self.account.device_id(),
            "session_id": outbound.session.session_id(),
            "ciphertext": encode_key(&message.to_bytes()),
        })
        .to_string())
    }

    pub(super) fn decrypt_group_event(
        &mut self,
        event: &str,
        room_id: &RoomId,
    ) -> Result<DecryptedRoomEvent, EngineError> {
        let event: Value = serde_json::from_str(event)?;
        let malformed = |reason: &str| EngineError::Megolm(MegolmError::Malformed(reason.to_string()));

        let content = event.get("content").ok_or_else(|| malformed("missing content"))?;
        let algorithm = content.get("algorithm").and_then(Value::as_str).unwrap_or_default();
        if algorithm != MEGOLM_V1_ALGORITHM {
            return Err(MegolmError::UnsupportedAlgorithm(algorithm.to_string()).into());
        }

        let session_id = content
            .get("session_id")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("missing session_id"))?;
        let ciphertext = content
            .get("ciphertext")
            .and_then(Value::as_str)
            .and_then(decode_key)
            .ok_or_else(|| malformed("missing or invalid ciphertext"))?;
        let message =
            GroupMessage::from_bytes(&ciphertext).map_err(megolm_error)?;
        let event_id =
            event.get("event_id").and_then(Value::as_str).unwrap_or_default().to_string();

        let Some(inbound) = self.store.inbound.get_mut(session_id) else {
            return Err(MegolmError::MissingRoomKey { session_id: session_id.to_string() }.into());
        };
        if &inbound.room_id != room_id {
            return Err(MegolmError::MismatchedRoom {
                expected: inbound.room_id.clone(),
                found: room_id.clone(),
            }
            .into());
        }

        let decrypted =
            inbound.session.decrypt(&message).map_err(megolm_error)?;

        match inbound.decrypted.get(&decrypted.message_index) {
            Some(seen) if seen != &event_id => {
                tracing::warn!(%room_id, session_id, index = decrypted.message_index, "replayed message index");
                return Err(MegolmError::Replay { index: decrypted.message_index }.into());
            },
            Some(_) => {},
            None => {
                inbound.decrypted.insert(decrypted.message_index, event_id);
            },
        }

        let clear: Value = serde_json::from_slice(&decrypted.plaintext)
            .map_err(|e| EngineError::Megolm(MegolmError::Malformed(e.to_string())))?;
        let claimed_room = clear.get("room_id").and_then(Value::as_str);
        if claimed_room != Some(room_id.as_str()) {
            return Err(MegolmError::MismatchedRoom {
                expected: room_id.clone(),
                found: claimed_room
                    .and_then(|r| RoomId::try_from(r).ok())
                    .unwrap_or_else(|| inbound.room_id.clone()),
            }
            .into());
        }

        Ok(DecryptedRoomEvent {
            clear_event: clear.to_string(),
            sender_curve25519_key: inbound.sender_key.clone(),
            claimed_ed25519_key: inbound.claimed_ed25519_key.clone(),
            forwarding_curve25519_key_chain: inbound.forwarding_chain.clone(),
        })
    }

    /// Seal a to-device payload for one device.
    pub(super) fn encrypt_to_device(
        &self,
        record: &DeviceRecord,
        event_type: &str,
        content: Value,
    ) -> Result<Value, EngineError> {
        let curve = record.curve25519_key().ok_or_else(|| olm_error("device has no curve25519 key"))?;
        let their_identity =
            decode_key_array::<32>(curve).ok_or_else(|| olm_error("malformed curve25519 key"))?;
        let session =
            self.store.pairwise.get(curve).ok_or_else(|| olm_error("no pairwise session"))?;

        let payload = json!({
            "type": event_type,
            "content": content,
            "sender": self.account.user_id(),
            "sender_device": self.account.device_id(),
            "keys": { "ed25519": self.account.ed25519_key() },
            "recipient": record.user_id,
            "recipient_keys": { "ed25519": record.ed25519_key() },
        });

        let mut nonce = [0u8; PAIRWISE_NONCE_SIZE];
        self.env.random_bytes(&mut nonce);
        let message = PairwiseMessage::seal(
            self.account.identity_keypair(),
            &their_identity,
            &session.one_time_key,
            self.env.random_seed(),
            nonce,
            payload.to_string().as_bytes(),
        )
        .map_err(|e| olm_error(e.to_string()))?;

        Ok(json!({
            "algorithm": OLM_V1_ALGORITHM,
            "sender_key": self.account.curve25519_key(),
            "ciphertext": {
                curve: { "type": 0, "body": encode_key(&message.to_bytes()) },
            },
        }))
    }

    fn decrypt_to_device(&self, event: &Value) -> Result<DecryptedToDevice, EngineError> {
        let content = event.get("content").ok_or_else(|| olm_error("missing content"))?;
        if content.get("algorithm").and_then(Value::as_str) != Some(OLM_V1_ALGORITHM) {
            return Err(olm_error("unsupported algorithm"));
        }

        let sender_key = content
            .get("sender_key")
            .and_then(Value::as_str)
            .ok_or_else(|| olm_error("missing sender_key"))?;
        let sender_identity = decode_key_array::<32>(sender_key)
            .ok_or_else(|| olm_error("malformed sender_key"))?;

        let body = content
            .get("ciphertext")
            .and_then(|c| c.get(self.account.curve25519_key()))
            .and_then(|c| c.get("body"))
            .and_then(Value::as_str)
            .and_then(decode_key)
            .ok_or_else(|| olm_error("no ciphertext for this device"))?;
        let message = PairwiseMessage::from_bytes(&body).map_err(|e| olm_error(e.to_string()))?;

        let one_time_key = self
            .account
            .one_time_keypair(&message.one_time_key)
            .ok_or_else(|| olm_error("unknown one-time key"))?;
        let plaintext = message
            .open(self.account.identity_keypair(), one_time_key, &sender_identity)
            .map_err(|e| olm_error(e.to_string()))?;
        let payload: Value = serde_json::from_slice(&plaintext)?;

        if payload.get("recipient").and_then(Value::as_str) != Some(self.account.user_id().as_str())
        {
            return Err(olm_error("payload addressed to another user"));
        }
        let own_ed25519 = self.account.ed25519_key();
        if payload.get("recipient_keys").and_then(|k| k.get("ed25519")).and_then(Value::as_str)
            != Some(own_ed25519.as_str())
        {
            return Err(olm_error("payload addressed to another device"));
        }
        if let Some(sender) = event.get("sender").and_then(Value::as_str)
            && payload.get("sender").and_then(Value::as_str) != Some(sender)
        {
            return Err(olm_error("payload sender does not match event sender"));
        }

        let claimed_ed25519_key = payload
            .get("keys")
            .and_then(|k| k.get("ed25519"))
            .and_then(Value::as_str)
            .map(str::to_string);
        if let Some(known) = self.store.device_by_curve_key(sender_key)
            && known.ed25519_key() != claimed_ed25519_key.as_deref()
        {
            return Err(olm_error("claimed ed25519 key does not match sender device"));
        }

        Ok(DecryptedToDevice {
            event_type: payload.get("type").and_then(Value::as_str).unwrap_or_default().to_string(),
            content: payload.get("content").cloned().unwrap_or(Value::Null),
            sender_key: sender_key.to_string(),
            claimed_ed25519_key,
        })
    }

    /// Process one to-device event, returning it decrypted where possible.
    pub(super) fn receive_to_device_event(&mut self, event: &Value) -> Value {
        if event.get("type").and_then(Value::as_str) != Some(ENCRYPTED_EVENT) {
            return event.clone();
        }

        let decrypted = match self.decrypt_to_device(event) {
            Ok(decrypted) => decrypted,
            Err(err) => {
                tracing::warn!(error = %err, "failed to decrypt to-device event");
                return event.clone();
            },
        };

        let mut content = decrypted.content.clone();
        match decrypted.event_type.as_str() {
            ROOM_KEY_EVENT | FORWARDED_ROOM_KEY_EVENT => {
                self.receive_room_key(&decrypted);
                if let Some(content) = content.as_object_mut() {
                    content.remove("session_key");
                }
            },
            other => tracing::debug!(event_type = other, "unhandled to-device payload"),
        }

        json!({
            "type": decrypted.event_type,
            "sender": event.get("sender").cloned().unwrap_or(Value::Null),
            "content": content,
            "sender_key": decrypted.sender_key,
        })
    }

    fn receive_room_key(&mut self, decrypted: &DecryptedToDevice) {
        let content = &decrypted.content;
        let field = |name: &str| content.get(name).and_then(Value::as_str);

        if field("algorithm") != Some(MEGOLM_V1_ALGORITHM) {
            tracing::warn!("room key with unsupported algorithm");
            return;
        }
        let (Some(room_id), Some(session_id), Some(session_key)) = (
            field("room_id").and_then(|r| RoomId::try_from(r).ok()),
            field("session_id"),
            field("session_key").and_then(|k| SessionKey::from_base64(k).ok()),
        ) else {
            tracing::warn!("malformed room key");
            return;
        };
        if session_key.session_id() != session_id {
            tracing::warn!(%room_id, session_id, "room key does not match its session id");
            return;
        }

        let (sender_key, claimed, chain) = if decrypted.event_type == FORWARDED_ROOM_KEY_EVENT {
            let mut chain: Vec<String> = content
                .get("forwarding_curve25519_key_chain")
                .cloned()
                .and_then(|c| serde_json::from_value(c).ok())
                .unwrap_or_default();
            chain.push(decrypted.sender_key.clone());
            (
                field("sender_key").unwrap_or_default().to_string(),
                field("sender_claimed_ed25519_key").map(str::to_string),
                chain,
            )
        } else {
            (decrypted.sender_key.clone(), decrypted.claimed_ed25519_key.clone(), Vec::new())
        };

        if self.add_inbound_session(room_id.clone(), &session_key, sender_key, claimed, chain) {
            tracing::info!(%room_id, session_id, "room key received");
        }
    }

    /// Store an inbound session unless one with an earlier first index exists.
    fn add_inbound_session(
        &mut self,
        room_id: RoomId,
        session_key: &SessionKey,
        sender_key: String,
        claimed_ed25519_key: Option<String>,
        forwarding_chain: Vec<String>,
    ) -> bool {
        let session_id = session_key.session_id();
        if let Some(existing) = self.store.inbound.get(&session_id)
            && existing.session.first_known_index() <= session_key.index
        {
            return false;
        }

        self.store.inbound.insert(
            session_id,
            InboundRoomSession {
                room_id,
                session: InboundGroupSession::new(session_key),
                sender_key,
                claimed_ed25519_key,
                forwarding_chain,
                decrypted: BTreeMap::new(),
            },
        );
        true
    }

    pub(super) fn export_inbound_sessions(
        &self,
        passphrase: &str,
        rounds: u32,
    ) -> Result<String, EngineError> {
        let keys: Vec<ExportedRoomKey> = self
            .store
            .inbound
            .iter()
            .map(|(session_id, inbound)| ExportedRoomKey {
                algorithm: MEGOLM_V1_ALGORITHM.to_string(),
                room_id: inbound.room_id.clone(),
                sender_key: inbound.sender_key.clone(),
                session_id: session_id.clone(),
                session_key: inbound.session.export_at_first_known().to_base64(),
                sender_claimed_keys: inbound
                    .claimed_ed25519_key
                    .iter()
                    .map(|k| ("ed25519".to_string(), k.clone()))
                    .collect(),
                forwarding_curve25519_key_chain: inbound.forwarding_chain.clone(),
            })
            .collect();

        let plaintext = serde_json::to_vec(&keys)?;
        let mut salt = [0u8; EXPORT_SALT_SIZE];
        let mut nonce = [0u8; EXPORT_NONCE_SIZE];
        self.env.random_bytes(&mut salt);
        self.env.random_bytes(&mut nonce);

        let exported = encrypt_key_export(&plaintext, passphrase, rounds, salt, nonce)
            .map_err(|e| EngineError::KeyExport(e.to_string()))?;
        tracing::info!(count = keys.len(), rounds, "room keys exported");
        Ok(exported)
    }

    pub(super) fn import_inbound_sessions(
        &mut self,
        exported: &str,
        passphrase: &str,
        progress: &mut dyn FnMut(usize, usize),
    ) -> Result<KeyImportCounts, EngineError> {
        let plaintext = decrypt_key_export(exported, passphrase)
            .map_err(|e| EngineError::KeyExport(e.to_string()))?;
        let keys: Vec<ExportedRoomKey> = serde_json::from_slice(&plaintext)?;

        let total = keys.len();
        let mut imported = 0;

        for (position, key) in keys.into_iter().enumerate() {
            match SessionKey::from_base64(&key.session_key) {
                Ok(session_key)
                    if key.algorithm == MEGOLM_V1_ALGORITHM
                        && session_key.session_id() == key.session_id =>
                {
                    let claimed = key.sender_claimed_keys.get("ed25519").cloned();
                    if self.add_inbound_session(
                        key.room_id,
                        &session_key,
                        key.sender_key,
                        claimed,
                        key.forwarding_curve25519_key_chain,
                    ) {
                        imported += 1;
                    }
                },
                _ => {
                    tracing::warn!(session_id = %key.session_id, "skipping invalid exported key");
                },
            }
            progress(position + 1, total);
        }

        tracing::info!(total, imported, "room keys imported");
        Ok(KeyImportCounts { total, imported })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use keyloom_core::{CryptoEngine, DeviceId, LocalTrust};

    use super::*;
    use crate::{MemoryEngineConfig, SimEnv, SimHomeserver};

    struct Peer {
        user: UserId,
        device: DeviceId,
        engine: MemoryEngine<SimEnv>,
    }

    impl Peer {
        fn new(env: &SimEnv, name: &str) -> Self {
            let user = UserId::try_from(format!("@{name}:example.org")).unwrap();
            let device = DeviceId::try_from(name.to_uppercase()).unwrap();
            let config = MemoryEngineConfig { one_time_key_target: 5, ..Default::default() };
            let engine =
                MemoryEngine::with_config(env.clone(), user.clone(), device.clone(), config);
            Self { user, device, engine }
        }

        fn send(&mut self, server: &SimHomeserver, request: &OutgoingRequest) {
            let response = server.handle(&self.user, &self.device, request).unwrap();
            self.engine.mark_request_as_sent(&request.request_id, request.kind, &response).unwrap();
        }

        fn flush(&mut self, server: &SimHomeserver) {
            for request in self.engine.outgoing_requests().unwrap() {
                self.send(server, &request);
            }
        }

        fn sync(&mut self, server: &SimHomeserver) -> Value {
            let delta = server.sync(&self.user, &self.device);
            let batch = json!({ "events": delta.to_device_events.unwrap_or_default() });
            let processed = self
                .engine
                .receive_sync_changes(
                    &batch.to_string(),
                    &delta.device_lists.unwrap_or_default(),
                    delta.one_time_key_counts.as_ref(),
                )
                .unwrap();
            self.flush(server);
            serde_json::from_str(&processed).unwrap()
        }

        fn open_session_to(&mut self, server: &SimHomeserver, users: &[UserId]) {
            self.engine.update_tracked_users(users).unwrap();
            self.flush(server);
            if let Some(claim) = self.engine.get_missing_sessions(users).unwrap() {
                self.send(server, &claim);
            }
        }

        fn share(&mut self, server: &SimHomeserver, room: &RoomId, users: &[UserId]) -> usize {
            let requests = self.engine.share_room_key(room, users).unwrap();
            for request in &requests {
                self.send(server, request);
            }
            requests.len()
        }
    }

    fn room() -> RoomId {
        RoomId::try_from("!room:example.org").unwrap()
    }

    fn setup(names: &[&str]) -> (SimHomeserver, Vec<Peer>) {
        let env = SimEnv::with_seed(42);
        let server = SimHomeserver::new();
        let mut peers: Vec<Peer> = names.iter().map(|name| Peer::new(&env, name)).collect();
        for peer in &mut peers {
            peer.flush(&server);
        }
        (server, peers)
    }

    fn encrypted_event(peer: &mut Peer, server: &SimHomeserver, body: &str) -> String {
        let content = peer
            .engine
            .encrypt(&room(), "m.room.message", &json!({ "body": body }).to_string())
            .unwrap();
        server.room_event(&peer.user, &room(), serde_json::from_str(&content).unwrap()).to_string()
    }

    #[test]
    fn shared_room_key_decrypts_on_recipient() {
        let (server, mut peers) = setup(&["alice", "bob"]);
        let bob_user = peers[1].user.clone();

        peers[0].open_session_to(&server, &[bob_user.clone()]);
        assert_eq!(peers[0].share(&server, &room(), &[bob_user.clone()]), 1);

        let processed = peers[1].sync(&server);
        assert_eq!(processed["events"][0]["type"], ROOM_KEY_EVENT);
        assert!(processed["events"][0]["content"].get("session_key").is_none());
        assert_eq!(peers[1].engine.room_key_count(), 1);

        let event = encrypted_event(&mut peers[0], &server, "hello");
        let decrypted = peers[1].engine.decrypt_room_event(&event, &room()).unwrap();

        let clear: Value = serde_json::from_str(&decrypted.clear_event).unwrap();
        assert_eq!(clear["content"]["body"], "hello");
        assert_eq!(decrypted.sender_curve25519_key, peers[0].engine.account.curve25519_key());
        assert_eq!(decrypted.claimed_ed25519_key, Some(peers[0].engine.account.ed25519_key()));
        assert!(decrypted.forwarding_curve25519_key_chain.is_empty());
    }

    #[test]
    fn own_messages_decrypt() {
        let (server, mut peers) = setup(&["alice"]);
        assert_eq!(peers[0].share(&server, &room(), &[]), 0);

        let event = encrypted_event(&mut peers[0], &server, "note to self");
        assert!(peers[0].engine.decrypt_room_event(&event, &room()).is_ok());
    }

    #[test]
    fn second_share_is_noop() {
        let (server, mut peers) = setup(&["alice", "bob"]);
        let bob_user = peers[1].user.clone();
        peers[0].open_session_to(&server, &[bob_user.clone()]);

        assert_eq!(peers[0].share(&server, &room(), &[bob_user.clone()]), 1);
        assert_eq!(peers[0].share(&server, &room(), &[bob_user]), 0);
    }

    #[test]
    fn invalidated_session_is_reshared() {
        let (server, mut peers) = setup(&["alice", "bob"]);
        let bob_user = peers[1].user.clone();
        peers[0].open_session_to(&server, &[bob_user.clone()]);
        peers[0].share(&server, &room(), &[bob_user.clone()]);

        assert!(peers[0].engine.invalidate_group_session(&room()).unwrap());
        assert!(!peers[0].engine.invalidate_group_session(&room()).unwrap());
        assert_eq!(peers[0].share(&server, &room(), &[bob_user]), 1);
    }

    #[test]
    fn blacklisted_device_rotates_session() {
        let (server, mut peers) = setup(&["alice", "bob"]);
        let (bob_user, bob_device) = (peers[1].user.clone(), peers[1].device.clone());
        peers[0].open_session_to(&server, &[bob_user.clone()]);
        peers[0].share(&server, &room(), &[bob_user.clone()]);
        let first: Value =
            serde_json::from_str(&peers[0].engine.encrypt(&room(), "m.room.message", "{}").unwrap())
                .unwrap();

        peers[0].engine.set_local_trust(&bob_user, &bob_device, LocalTrust::BlackListed).unwrap();
        assert_eq!(peers[0].share(&server, &room(), &[bob_user]), 0);

        let second: Value =
            serde_json::from_str(&peers[0].engine.encrypt(&room(), "m.room.message", "{}").unwrap())
                .unwrap();
        assert_ne!(first["session_id"], second["session_id"]);
    }

    #[test]
    fn rotation_after_message_budget() {
        let env = SimEnv::with_seed(9);
        let user = UserId::try_from("@alice:example.org").unwrap();
        let config = MemoryEngineConfig { one_time_key_target: 1, rotation_period_messages: 2 };
        let mut engine =
            MemoryEngine::with_config(env, user, DeviceId::try_from("ALICE").unwrap(), config);

        engine.share_room_key(&room(), &[]).unwrap();
        engine.encrypt(&room(), "m.room.message", "{}").unwrap();
        engine.encrypt(&room(), "m.room.message", "{}").unwrap();
        assert_eq!(engine.room_key_count(), 1);

        engine.share_room_key(&room(), &[]).unwrap();
        assert_eq!(engine.room_key_count(), 2);
    }

    #[test]
    fn encrypt_without_session_fails() {
        let (_server, mut peers) = setup(&["alice"]);
        assert_eq!(
            peers[0].engine.encrypt(&room(), "m.room.message", "{}"),
            Err(EngineError::MissingGroupSession(room()))
        );
    }

    #[test]
    fn replay_with_other_event_id_is_rejected() {
        let (server, mut peers) = setup(&["alice"]);
        peers[0].share(&server, &room(), &[]);
        let event = encrypted_event(&mut peers[0], &server, "once");

        assert!(peers[0].engine.decrypt_room_event(&event, &room()).is_ok());
        assert!(peers[0].engine.decrypt_room_event(&event, &room()).is_ok());

        let mut replayed: Value = serde_json::from_str(&event).unwrap();
        replayed["event_id"] = json!("$other");
        assert_eq!(
            peers[0].engine.decrypt_room_event(&replayed.to_string(), &room()),
            Err(EngineError::Megolm(MegolmError::Replay { index: 0 }))
        );
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let (server, mut peers) = setup(&["alice"]);
        peers[0].share(&server, &room(), &[]);
        let event = encrypted_event(&mut peers[0], &server, "secret");

        let mut tampered: Value = serde_json::from_str(&event).unwrap();
        let ciphertext = tampered["content"]["ciphertext"].as_str().unwrap();
        let mut bytes = decode_key(ciphertext).unwrap();
        let last = bytes.len() - 70;
        bytes[last] ^= 0x01;
        tampered["content"]["ciphertext"] = json!(encode_key(&bytes));

        assert_eq!(
            peers[0].engine.decrypt_room_event(&tampered.to_string(), &room()),
            Err(EngineError::Megolm(MegolmError::Signature))
        );
    }

    #[test]
    fn wrong_room_and_unknown_session() {
        let (server, mut peers) = setup(&["alice"]);
        peers[0].share(&server, &room(), &[]);
        let event = encrypted_event(&mut peers[0], &server, "here");
        let elsewhere = RoomId::try_from("!elsewhere:example.org").unwrap();

        assert!(matches!(
            peers[0].engine.decrypt_room_event(&event, &elsewhere),
            Err(EngineError::Megolm(MegolmError::MismatchedRoom { .. }))
        ));

        let mut unknown: Value = serde_json::from_str(&event).unwrap();
        unknown["content"]["session_id"] = json!("unknown");
        assert!(matches!(
            peers[0].engine.decrypt_room_event(&unknown.to_string(), &room()),
            Err(EngineError::Megolm(MegolmError::MissingRoomKey { .. }))
        ));

        let mut olm: Value = serde_json::from_str(&event).unwrap();
        olm["content"]["algorithm"] = json!(OLM_V1_ALGORITHM);
        assert!(matches!(
            peers[0].engine.decrypt_room_event(&olm.to_string(), &room()),
            Err(EngineError::Megolm(MegolmError::UnsupportedAlgorithm(_)))
        ));
    }

    #[test]
    fn forwarded_key_records_chain() {
        let (server, mut peers) = setup(&["alice", "bob", "carol"]);
        let bob_user = peers[1].user.clone();
        let carol_user = peers[2].user.clone();

        peers[0].open_session_to(&server, &[bob_user.clone()]);
        peers[0].share(&server, &room(), &[bob_user]);
        peers[1].sync(&server);
        let event = encrypted_event(&mut peers[0], &server, "forward me");

        // Bob forwards the session he received to Carol.
        peers[1].open_session_to(&server, &[carol_user.clone()]);
        let (session_id, inbound) = peers[1].engine.store.inbound.iter().next().unwrap();
        let forwarded = json!({
            "algorithm": MEGOLM_V1_ALGORITHM,
            "room_id": room(),
            "session_id": session_id,
            "session_key": inbound.session.export_at_first_known().to_base64(),
            "sender_key": inbound.sender_key,
            "sender_claimed_ed25519_key": inbound.claimed_ed25519_key,
            "forwarding_curve25519_key_chain": [],
        });
        let carol_record = peers[1]
            .engine
            .store
            .user_devices(&carol_user)
            .into_iter()
            .next()
            .unwrap();
        let bob = &mut peers[1];
        let content =
            bob.engine.encrypt_to_device(&carol_record, FORWARDED_ROOM_KEY_EVENT, forwarded).unwrap();
        let request = bob.engine.requests.create(
            &bob.engine.env,
            RequestKind::ToDevice,
            json!({
                "event_type": ENCRYPTED_EVENT,
                "txn_id": "fwd",
                "messages": { carol_user.as_str(): { carol_record.device_id.as_str(): content } },
            })
            .to_string(),
            RequestContext::ToDevice,
            false,
        );
        bob.send(&server, &request);

        peers[2].sync(&server);
        let decrypted = peers[2].engine.decrypt_room_event(&event, &room()).unwrap();
        assert_eq!(decrypted.sender_curve25519_key, peers[0].engine.account.curve25519_key());
        assert_eq!(
            decrypted.forwarding_curve25519_key_chain,
            vec![peers[1].engine.account.curve25519_key()]
        );
    }

    #[test]
    fn export_import_restores_sessions() {
        let (server, mut peers) = setup(&["alice"]);
        for n in 0..3 {
            let room = RoomId::try_from(format!("!room{n}:example.org")).unwrap();
            peers[0].share(&server, &room, &[]);
        }
        let exported = peers[0].engine.export_room_keys("passphrase", 1).unwrap();

        let mut fresh = Peer::new(&SimEnv::with_seed(7), "alice");
        let mut seen = Vec::new();
        let counts = fresh
            .engine
            .import_room_keys(&exported, "passphrase", &mut |done, total| seen.push((done, total)))
            .unwrap();
        assert_eq!(counts, KeyImportCounts { total: 3, imported: 3 });
        assert_eq!(seen, vec![(1, 3), (2, 3), (3, 3)]);

        let again = fresh.engine.import_room_keys(&exported, "passphrase", &mut |_, _| {}).unwrap();
        assert_eq!(again, KeyImportCounts { total: 3, imported: 0 });
    }

    #[test]
    fn import_with_wrong_passphrase_fails() {
        let (server, mut peers) = setup(&["alice"]);
        peers[0].share(&server, &room(), &[]);
        let exported = peers[0].engine.export_room_keys("right", 1).unwrap();

        assert!(matches!(
            peers[0].engine.import_room_keys(&exported, "wrong", &mut |_, _| {}),
            Err(EngineError::KeyExport(_))
        ));
    }

    #[test]
    fn store_fault_fails_export() {
        let (_server, mut peers) = setup(&["alice"]);
        let faults = peers[0].engine.faults();

        faults.fail();
        assert!(matches!(peers[0].engine.export_room_keys("p", 1), Err(EngineError::Store(_))));
        faults.heal();
        assert!(peers[0].engine.export_room_keys("p", 1).is_ok());
    }
}
