//! Keys upload, query and claim.

use std::collections::BTreeMap;

use keyloom_core::{
    DeviceId, DeviceRecord, EngineError, Environment, LocalTrust, RequestKind, SIGNED_CURVE25519,
    UserId,
};
use keyloom_crypto::decode_key_array;
use serde_json::{Map, Value, json};

use super::{MemoryEngine, store::PairwiseSession, wire::verify_json};

const QUERY_TIMEOUT_MS: u64 = 10_000;

fn invalid(kind: RequestKind, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidResponse { kind, reason: reason.into() }
}

impl<E: Environment> MemoryEngine<E> {
    /// Body of a keys-upload request, if anything needs uploading.
    pub(super) fn keys_upload_body(&mut self) -> Option<String> {
        let target = self.config.one_time_key_target;
        let on_server = self.server_one_time_keys.unwrap_or(0) as usize;
        let unpublished = self.account.unpublished_one_time_keys().len();

        let missing = target.saturating_sub(on_server + unpublished);
        if missing > 0 {
            self.account.generate_one_time_keys(&self.env, missing);
        }

        let one_time_keys = self.account.unpublished_one_time_keys();
        if one_time_keys.is_empty() && self.account.device_keys_uploaded() {
            return None;
        }

        let mut body = Map::new();
        if !self.account.device_keys_uploaded() {
            body.insert("device_keys".to_string(), self.account.device_keys());
        }
        body.insert("one_time_keys".to_string(), Value::Object(one_time_keys));
        Some(Value::Object(body).to_string())
    }

    pub(super) fn receive_keys_upload_response(&mut self, body: &str) -> Result<(), EngineError> {
        let response: Value = serde_json::from_str(body)?;
        let count = response
            .get("one_time_key_counts")
            .and_then(|counts| counts.get(SIGNED_CURVE25519))
            .and_then(Value::as_u64)
            .ok_or_else(|| invalid(RequestKind::KeysUpload, "missing one_time_key_counts"))?;

        self.account.mark_keys_as_published();
        self.server_one_time_keys = Some(count);
        tracing::debug!(count, "one-time keys published");
        Ok(())
    }

    pub(super) fn keys_query_body(users: &[UserId]) -> String {
        let device_keys: Map<String, Value> =
            users.iter().map(|user| (user.to_string(), json!([]))).collect();
        json!({ "device_keys": device_keys, "timeout": QUERY_TIMEOUT_MS }).to_string()
    }

    /// Replace the device lists of the queried users with the response.
    ///
    /// Users no longer tracked are skipped so that a user who left while the
    /// query was in flight does not come back.
    pub(super) fn receive_keys_query_response(
        &mut self,
        users: &[UserId],
        body: &str,
    ) -> Result<(), EngineError> {
        let response: Value = serde_json::from_str(body)?;
        let empty = Map::new();
        let device_keys = match response.get("device_keys") {
            Some(Value::Object(map)) => map,
            None => &empty,
            Some(_) => return Err(invalid(RequestKind::KeysQuery, "device_keys is not an object")),
        };

        for user in users {
            if !self.store.tracked.contains_key(user) {
                continue;
            }
            let Some(Value::Object(devices)) = device_keys.get(user.as_str()) else {
                continue;
            };

            let existing = self.store.devices.remove(user).unwrap_or_default();
            let mut updated = BTreeMap::new();

            for (device_id, keys) in devices {
                let Ok(device_id) = DeviceId::try_from(device_id.as_str()) else {
                    tracing::warn!(user_id = %user, %device_id, "discarding device with invalid id");
                    continue;
                };
                if self.is_own_device(user, &device_id) {
                    continue;
                }

                let previous = existing.get(&device_id);
                match self.validate_device_keys(user, &device_id, keys, previous) {
                    Ok(record) => {
                        updated.insert(device_id, record);
                    },
                    Err(reason) => {
                        tracing::warn!(user_id = %user, %device_id, %reason, "discarding device keys");
                        if let Some(previous) = previous {
                            updated.insert(device_id, previous.clone());
                        }
                    },
                }
            }

            if user == self.account.user_id() {
                let own = existing.get(self.account.device_id()).cloned().unwrap_or_else(|| {
                    self.account.own_device_record(self.env.wall_clock_millis())
                });
                updated.insert(self.account.device_id().clone(), own);
            }

            for removed in existing.keys().filter(|id| !updated.contains_key(*id)) {
                tracing::debug!(user_id = %user, device_id = %removed, "device removed");
                if let Some(curve) = existing.get(removed).and_then(DeviceRecord::curve25519_key) {
                    self.store.pairwise.remove(curve);
                }
            }

            tracing::debug!(user_id = %user, devices = updated.len(), "device list updated");
            self.store.devices.insert(user.clone(), updated);
        }

        Ok(())
    }

    fn validate_device_keys(
        &self,
        user: &UserId,
        device_id: &DeviceId,
        keys: &Value,
        previous: Option<&DeviceRecord>,
    ) -> Result<DeviceRecord, String> {
        if keys.get("user_id").and_then(Value::as_str) != Some(user.as_str()) {
            return Err("user id mismatch".to_string());
        }
        if keys.get("device_id").and_then(Value::as_str) != Some(device_id.as_str()) {
            return Err("device id mismatch".to_string());
        }

        let key_map: BTreeMap<String, String> = keys
            .get("keys")
            .cloned()
            .and_then(|k| serde_json::from_value(k).ok())
            .ok_or("missing keys")?;

        let ed25519 = key_map.get(&format!("ed25519:{device_id}")).ok_or("missing ed25519 key")?;
        if !key_map.contains_key(&format!("curve25519:{device_id}")) {
            return Err("missing curve25519 key".to_string());
        }
        if !verify_json(keys, ed25519, user, device_id.as_str()) {
            return Err("invalid self-signature".to_string());
        }
        if previous.is_some_and(|p| p.ed25519_key() != Some(ed25519.as_str())) {
            return Err("ed25519 key changed".to_string());
        }

        let algorithms = keys
            .get("algorithms")
            .cloned()
            .and_then(|a| serde_json::from_value(a).ok())
            .unwrap_or_default();
        let signatures = keys
            .get("signatures")
            .cloned()
            .and_then(|s| serde_json::from_value(s).ok())
            .unwrap_or_default();
        let display_name = keys
            .get("unsigned")
            .and_then(|u| u.get("device_display_name"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(DeviceRecord {
            user_id: user.clone(),
            device_id: device_id.clone(),
            keys: key_map,
            algorithms,
            signatures,
            display_name,
            local_trust: previous.map_or(LocalTrust::Unset, |p| p.local_trust),
            cross_signing_trusted: previous.is_some_and(|p| p.cross_signing_trusted),
            first_time_seen_ts: previous
                .and_then(|p| p.first_time_seen_ts)
                .or_else(|| Some(self.env.wall_clock_millis())),
        })
    }

    /// Body of a keys-claim request for devices of `users` without a pairwise session.
    pub(super) fn keys_claim_body(&self, users: &[UserId]) -> Option<String> {
        let mut claims = Map::new();

        for user in users {
            let mut devices = Map::new();
            for record in self.store.user_devices(user) {
                if self.is_own_device(user, &record.device_id) {
                    continue;
                }
                let Some(curve) = record.curve25519_key() else {
                    continue;
                };
                if !self.store.pairwise.contains_key(curve) {
                    devices.insert(record.device_id.to_string(), json!(SIGNED_CURVE25519));
                }
            }
            if !devices.is_empty() {
                claims.insert(user.to_string(), Value::Object(devices));
            }
        }

        if claims.is_empty() {
            return None;
        }
        Some(json!({ "one_time_keys": claims, "timeout": QUERY_TIMEOUT_MS }).to_string())
    }

    pub(super) fn receive_keys_claim_response(&mut self, body: &str) -> Result<(), EngineError> {
        let response: Value = serde_json::from_str(body)?;
        let Some(Value::Object(users)) = response.get("one_time_keys") else {
            return Err(invalid(RequestKind::KeysClaim, "missing one_time_keys"));
        };

        for (user, devices) in users {
            let Ok(user) = UserId::try_from(user.as_str()) else {
                continue;
            };
            let Some(devices) = devices.as_object() else {
                continue;
            };

            for (device_id, keys) in devices {
                let Ok(device_id) = DeviceId::try_from(device_id.as_str()) else {
                    continue;
                };
                match self.claimed_session(&user, &device_id, keys) {
                    Ok((curve, session)) => {
                        tracing::debug!(user_id = %user, %device_id, "pairwise session created");
                        self.store.pairwise.insert(curve, session);
                    },
                    Err(reason) => {
                        tracing::warn!(user_id = %user, %device_id, %reason, "discarding claimed key");
                    },
                }
            }
        }

        Ok(())
    }

    fn claimed_session(
        &self,
        user: &UserId,
        device_id: &DeviceId,
        keys: &Value,
    ) -> Result<(String, PairwiseSession), String> {
        let record = self.store.device(user, device_id).ok_or("unknown device")?;
        let curve = record.curve25519_key().ok_or("device has no curve25519 key")?;
        let ed25519 = record.ed25519_key().ok_or("device has no ed25519 key")?;

        let (_, key) = keys
            .as_object()
            .and_then(|keys| keys.iter().find(|(id, _)| id.starts_with(SIGNED_CURVE25519)))
            .ok_or("no signed one-time key")?;

        if !verify_json(key, ed25519, user, device_id.as_str()) {
            return Err("invalid one-time key signature".to_string());
        }

        let one_time_key = key
            .get("key")
            .and_then(Value::as_str)
            .and_then(decode_key_array::<32>)
            .ok_or("malformed one-time key")?;

        Ok((curve.to_string(), PairwiseSession { one_time_key }))
    }
}
