//! Simulated homeserver.
//!
//! `SimHomeserver` answers the requests engines produce and hands out sync
//! deltas, standing in for the network and the server in tests. It keeps only
//! what the key protocol needs:
//!
//! - Uploaded device keys and unclaimed one-time keys per device
//! - To-device queues per recipient device
//! - Pending device-list notifications per device
//!
//! Handles are cheap clones over shared state, so each simulated device can
//! hold its own handle.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use keyloom_core::{
    DeviceId, DeviceListChanges, OutgoingRequest, RequestKind, RoomId, SIGNED_CURVE25519,
    SyncDelta, UserId,
};
use parking_lot::Mutex;
use serde_json::{Map, Value, json};

/// Errors returned by [`SimHomeserver`].
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Request body is not valid JSON
    #[error("malformed request body: {0}")]
    Json(#[from] serde_json::Error),

    /// Request body is JSON but misses a required part
    #[error("invalid {kind} request: {reason}")]
    InvalidRequest {
        /// Kind of the rejected request
        kind: RequestKind,
        /// What was wrong
        reason: String,
    },

    /// The server does not implement this endpoint
    #[error("unsupported request kind: {0}")]
    Unsupported(RequestKind),
}

type DeviceKey = (UserId, DeviceId);

#[derive(Default)]
struct ServerState {
    /// Uploaded device keys
    device_keys: BTreeMap<UserId, BTreeMap<DeviceId, Value>>,
    /// Unclaimed one-time keys by key id
    one_time_keys: BTreeMap<DeviceKey, BTreeMap<String, Value>>,
    /// Undelivered to-device events per recipient
    to_device: BTreeMap<DeviceKey, Vec<Value>>,
    /// Users whose device lists changed, per device to notify
    changed: BTreeMap<DeviceKey, BTreeSet<UserId>>,
    /// Users who left, per device to notify
    left: BTreeMap<DeviceKey, BTreeSet<UserId>>,
    next_event: u64,
    now_millis: u64,
}

impl ServerState {
    fn devices(&self) -> impl Iterator<Item = DeviceKey> + '_ {
        self.device_keys.iter().flat_map(|(user, devices)| {
            devices.keys().map(move |device| (user.clone(), device.clone()))
        })
    }

    fn notify_changed(&mut self, origin: &DeviceKey) {
        let recipients: Vec<DeviceKey> = self.devices().filter(|d| d != origin).collect();
        for recipient in recipients {
            self.changed.entry(recipient).or_default().insert(origin.0.clone());
        }
    }
}

/// Shared handle to a simulated homeserver.
#[derive(Clone, Default)]
pub struct SimHomeserver {
    state: Arc<Mutex<ServerState>>,
}

fn invalid(kind: RequestKind, reason: &str) -> SimError {
    SimError::InvalidRequest { kind, reason: reason.to_string() }
}

impl SimHomeserver {
    /// Empty server.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer a request sent by `user`'s `device`, returning the response body.
    ///
    /// # Errors
    ///
    /// - `Json`/`InvalidRequest`: the body does not parse or lacks required parts
    /// - `Unsupported`: the request kind has no simulated endpoint
    pub fn handle(
        &self,
        user: &UserId,
        device: &DeviceId,
        request: &OutgoingRequest,
    ) -> Result<String, SimError> {
        let body: Value = serde_json::from_str(&request.body)?;
        let origin = (user.clone(), device.clone());
        let mut state = self.state.lock();

        let response = match request.kind {
            RequestKind::KeysUpload => Self::keys_upload(&mut state, &origin, &body),
            RequestKind::KeysQuery => Self::keys_query(&state, &body),
            RequestKind::KeysClaim => Self::keys_claim(&mut state, &body),
            RequestKind::ToDevice => Self::send_to_device(&mut state, user, &body),
            other => Err(SimError::Unsupported(other)),
        }?;

        tracing::debug!(
            user_id = %user,
            device_id = %device,
            request_id = %request.request_id,
            kind = %request.kind,
            "request answered"
        );
        Ok(response.to_string())
    }

    fn keys_upload(
        state: &mut ServerState,
        origin: &DeviceKey,
        body: &Value,
    ) -> Result<Value, SimError> {
        if let Some(keys) = body.get("device_keys") {
            let (user, device) = origin;
            state.device_keys.entry(user.clone()).or_default().insert(device.clone(), keys.clone());
            state.notify_changed(origin);
        }

        let stored = state.one_time_keys.entry(origin.clone()).or_default();
        if let Some(keys) = body.get("one_time_keys") {
            let keys = keys
                .as_object()
                .ok_or_else(|| invalid(RequestKind::KeysUpload, "one_time_keys is not an object"))?;
            stored.extend(keys.iter().map(|(id, key)| (id.clone(), key.clone())));
        }

        Ok(json!({ "one_time_key_counts": { SIGNED_CURVE25519: stored.len() } }))
    }

    fn keys_query(state: &ServerState, body: &Value) -> Result<Value, SimError> {
        let users = body
            .get("device_keys")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid(RequestKind::KeysQuery, "missing device_keys"))?;

        let mut device_keys = Map::new();
        for user in users.keys() {
            let Ok(user_id) = UserId::try_from(user.as_str()) else {
                continue;
            };
            let devices: Map<String, Value> = state
                .device_keys
                .get(&user_id)
                .map(|devices| {
                    devices.iter().map(|(id, keys)| (id.to_string(), keys.clone())).collect()
                })
                .unwrap_or_default();
            device_keys.insert(user.clone(), Value::Object(devices));
        }

        Ok(json!({ "device_keys": device_keys, "failures": {} }))
    }

    fn keys_claim(state: &mut ServerState, body: &Value) -> Result<Value, SimError> {
        let users = body
            .get("one_time_keys")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid(RequestKind::KeysClaim, "missing one_time_keys"))?;

        let mut claimed = Map::new();
        for (user, devices) in users {
            let (Ok(user_id), Some(devices)) = (UserId::try_from(user.as_str()), devices.as_object())
            else {
                continue;
            };

            let mut per_device = Map::new();
            for device in devices.keys() {
                let Ok(device_id) = DeviceId::try_from(device.as_str()) else {
                    continue;
                };
                let key = state
                    .one_time_keys
                    .get_mut(&(user_id.clone(), device_id))
                    .and_then(BTreeMap::pop_first);
                if let Some((key_id, key)) = key {
                    per_device.insert(device.clone(), json!({ key_id: key }));
                }
            }
            if !per_device.is_empty() {
                claimed.insert(user.clone(), Value::Object(per_device));
            }
        }

        Ok(json!({ "one_time_keys": claimed, "failures": {} }))
    }

    fn send_to_device(
        state: &mut ServerState,
        sender: &UserId,
        body: &Value,
    ) -> Result<Value, SimError> {
        let event_type = body
            .get("event_type")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(RequestKind::ToDevice, "missing event_type"))?;
        let messages = body
            .get("messages")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid(RequestKind::ToDevice, "missing messages"))?;

        for (user, devices) in messages {
            let (Ok(user_id), Some(devices)) = (UserId::try_from(user.as_str()), devices.as_object())
            else {
                continue;
            };

            for (device, content) in devices {
                let targets: Vec<DeviceId> = if device == "*" {
                    state.device_keys.get(&user_id).map(|d| d.keys().cloned().collect()).unwrap_or_default()
                } else {
                    DeviceId::try_from(device.as_str()).into_iter().collect()
                };

                for target in targets {
                    let event = json!({ "type": event_type, "sender": sender, "content": content });
                    state.to_device.entry((user_id.clone(), target)).or_default().push(event);
                }
            }
        }

        Ok(json!({}))
    }

    /// Next sync delta for `user`'s `device`. Parts with nothing to report are `None`.
    pub fn sync(&self, user: &UserId, device: &DeviceId) -> SyncDelta {
        let key = (user.clone(), device.clone());
        let mut state = self.state.lock();

        let to_device_events = state.to_device.remove(&key).filter(|events| !events.is_empty());
        let changes = DeviceListChanges {
            changed: state.changed.remove(&key).unwrap_or_default().into_iter().collect(),
            left: state.left.remove(&key).unwrap_or_default().into_iter().collect(),
        };
        let one_time_key_counts = state
            .one_time_keys
            .get(&key)
            .map(|keys| BTreeMap::from([(SIGNED_CURVE25519.to_string(), keys.len() as u64)]));

        SyncDelta {
            to_device_events,
            device_lists: (!changes.is_empty()).then_some(changes),
            one_time_key_counts,
        }
    }

    /// Tell every device of `for_user` that they no longer share a room with `left_user`.
    pub fn mark_left(&self, for_user: &UserId, left_user: &UserId) {
        let mut state = self.state.lock();
        let recipients: Vec<DeviceKey> =
            state.devices().filter(|(user, _)| user == for_user).collect();
        for recipient in recipients {
            if let Some(changed) = state.changed.get_mut(&recipient) {
                changed.remove(left_user);
            }
            state.left.entry(recipient).or_default().insert(left_user.clone());
        }
    }

    /// Report a device-list change of `user` to every other device.
    pub fn mark_changed(&self, user: &UserId) {
        let mut state = self.state.lock();
        let recipients: Vec<DeviceKey> =
            state.devices().filter(|(recipient, _)| recipient != user).collect();
        for recipient in recipients {
            state.changed.entry(recipient).or_default().insert(user.clone());
        }
    }

    /// Remove a device so that later key queries no longer return it.
    pub fn delete_device(&self, user: &UserId, device: &DeviceId) {
        let mut state = self.state.lock();
        if let Some(devices) = state.device_keys.get_mut(user) {
            devices.remove(device);
        }
        let key = (user.clone(), device.clone());
        state.one_time_keys.remove(&key);
        state.to_device.remove(&key);
        state.notify_changed(&key);
    }

    /// Wrap encrypted `content` into a room event as the server would deliver it.
    pub fn room_event(&self, sender: &UserId, room_id: &RoomId, content: Value) -> Value {
        let mut state = self.state.lock();
        state.next_event += 1;
        state.now_millis += 1;
        json!({
            "type": "m.room.encrypted",
            "event_id": format!("$event{}", state.next_event),
            "sender": sender,
            "room_id": room_id,
            "origin_server_ts": state.now_millis,
            "content": content,
        })
    }

    /// Unclaimed one-time keys held for a device.
    pub fn one_time_key_count(&self, user: &UserId, device: &DeviceId) -> usize {
        self.state
            .lock()
            .one_time_keys
            .get(&(user.clone(), device.clone()))
            .map_or(0, BTreeMap::len)
    }
}

impl std::fmt::Debug for SimHomeserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimHomeserver")
            .field("users", &state.device_keys.len())
            .field("queued_to_device", &state.to_device.values().map(Vec::len).sum::<usize>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use keyloom_core::RequestId;

    use super::*;

    fn user(name: &str) -> UserId {
        UserId::try_from(format!("@{name}:example.org")).unwrap()
    }

    fn device(name: &str) -> DeviceId {
        DeviceId::try_from(name).unwrap()
    }

    fn request(kind: RequestKind, body: Value) -> OutgoingRequest {
        OutgoingRequest { request_id: RequestId::try_from("r1").unwrap(), kind, body: body.to_string() }
    }

    #[test]
    fn upload_then_claim_pops_one_key() {
        let server = SimHomeserver::new();
        let upload = request(
            RequestKind::KeysUpload,
            json!({
                "device_keys": { "user_id": "@bob:example.org", "device_id": "BOB" },
                "one_time_keys": { "signed_curve25519:a": { "key": "x" }, "signed_curve25519:b": { "key": "y" } },
            }),
        );
        let response = server.handle(&user("bob"), &device("BOB"), &upload).unwrap();
        assert_eq!(response, r#"{"one_time_key_counts":{"signed_curve25519":2}}"#);

        let claim = request(
            RequestKind::KeysClaim,
            json!({ "one_time_keys": { "@bob:example.org": { "BOB": "signed_curve25519" } } }),
        );
        let response: Value =
            serde_json::from_str(&server.handle(&user("alice"), &device("ALICE"), &claim).unwrap())
                .unwrap();
        assert_eq!(
            response["one_time_keys"]["@bob:example.org"]["BOB"]["signed_curve25519:a"]["key"],
            "x"
        );
        assert_eq!(server.one_time_key_count(&user("bob"), &device("BOB")), 1);
    }

    #[test]
    fn to_device_is_delivered_once() {
        let server = SimHomeserver::new();
        let send = request(
            RequestKind::ToDevice,
            json!({
                "event_type": "m.room.encrypted",
                "txn_id": "1",
                "messages": { "@bob:example.org": { "BOB": { "body": 1 } } },
            }),
        );
        server.handle(&user("alice"), &device("ALICE"), &send).unwrap();

        let delta = server.sync(&user("bob"), &device("BOB"));
        let events = delta.to_device_events.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["sender"], "@alice:example.org");

        assert_eq!(server.sync(&user("bob"), &device("BOB")), SyncDelta::default());
    }

    #[test]
    fn device_upload_notifies_other_devices() {
        let server = SimHomeserver::new();
        for name in ["alice", "bob"] {
            let upload = request(RequestKind::KeysUpload, json!({ "device_keys": {} }));
            server.handle(&user(name), &device(&name.to_uppercase()), &upload).unwrap();
        }

        let delta = server.sync(&user("alice"), &device("ALICE"));
        assert_eq!(delta.device_lists.unwrap().changed, vec![user("bob")]);
        assert!(server.sync(&user("bob"), &device("BOB")).device_lists.is_none());
    }

    #[test]
    fn left_replaces_pending_change() {
        let server = SimHomeserver::new();
        for name in ["alice", "bob"] {
            let upload = request(RequestKind::KeysUpload, json!({ "device_keys": {} }));
            server.handle(&user(name), &device(&name.to_uppercase()), &upload).unwrap();
        }
        server.mark_changed(&user("bob"));
        server.mark_left(&user("alice"), &user("bob"));

        let changes = server.sync(&user("alice"), &device("ALICE")).device_lists.unwrap();
        assert!(changes.changed.is_empty());
        assert_eq!(changes.left, vec![user("bob")]);
    }

    #[test]
    fn unsupported_kind_fails() {
        let server = SimHomeserver::new();
        let backup = request(RequestKind::KeysBackup, json!({}));
        assert!(matches!(
            server.handle(&user("alice"), &device("ALICE"), &backup),
            Err(SimError::Unsupported(RequestKind::KeysBackup))
        ));
    }
}
