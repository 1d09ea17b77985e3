//! Device identity and one-time keys.

use std::collections::BTreeMap;

use keyloom_core::{
    DeviceId, DeviceRecord, Environment, Identity, LocalTrust, MEGOLM_V1_ALGORITHM,
    OLM_V1_ALGORITHM, SIGNED_CURVE25519, UserId,
};
use keyloom_crypto::{Curve25519Keypair, Ed25519Keypair, encode_key};
use serde_json::{Map, Value, json};

use super::wire::sign_json;

/// A published one-time key.
struct OneTimeKey {
    key_id: String,
    keypair: Curve25519Keypair,
    published: bool,
}

/// The local device's long-term keys.
pub(crate) struct Account {
    user_id: UserId,
    device_id: DeviceId,
    identity: Curve25519Keypair,
    signing: Ed25519Keypair,
    /// Public key to one-time key. Kept after publication so that pairwise
    /// messages sealed to a claimed key can still be opened.
    one_time_keys: BTreeMap<[u8; 32], OneTimeKey>,
    next_key_id: u64,
    device_keys_uploaded: bool,
}

impl Account {
    pub(crate) fn new<E: Environment>(env: &E, user_id: UserId, device_id: DeviceId) -> Self {
        Self {
            user_id,
            device_id,
            identity: Curve25519Keypair::from_seed(env.random_seed()),
            signing: Ed25519Keypair::from_seed(&env.random_seed()),
            one_time_keys: BTreeMap::new(),
            next_key_id: 1,
            device_keys_uploaded: false,
        }
    }

    pub(crate) fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub(crate) fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub(crate) fn identity_keypair(&self) -> &Curve25519Keypair {
        &self.identity
    }

    pub(crate) fn curve25519_key(&self) -> String {
        encode_key(&self.identity.public_key())
    }

    pub(crate) fn ed25519_key(&self) -> String {
        encode_key(&self.signing.public_key())
    }

    pub(crate) fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            identity_keys: self.key_map(),
        }
    }

    fn key_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (format!("curve25519:{}", self.device_id), self.curve25519_key()),
            (format!("ed25519:{}", self.device_id), self.ed25519_key()),
        ])
    }

    /// Self-signed device keys object.
    pub(crate) fn device_keys(&self) -> Value {
        let mut object = Map::new();
        object.insert("user_id".to_string(), json!(self.user_id));
        object.insert("device_id".to_string(), json!(self.device_id));
        object.insert("algorithms".to_string(), json!([OLM_V1_ALGORITHM, MEGOLM_V1_ALGORITHM]));
        object.insert("keys".to_string(), json!(self.key_map()));
        sign_json(&mut object, &self.signing, &self.user_id, self.device_id.as_str());
        Value::Object(object)
    }

    /// Record for the own device, always locally verified.
    pub(crate) fn own_device_record(&self, first_seen: u64) -> DeviceRecord {
        let signatures = self
            .device_keys()
            .get("signatures")
            .cloned()
            .and_then(|s| serde_json::from_value(s).ok())
            .unwrap_or_default();

        DeviceRecord {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            keys: self.key_map(),
            algorithms: vec![OLM_V1_ALGORITHM.to_string(), MEGOLM_V1_ALGORITHM.to_string()],
            signatures,
            display_name: None,
            local_trust: LocalTrust::Verified,
            cross_signing_trusted: false,
            first_time_seen_ts: Some(first_seen),
        }
    }

    pub(crate) fn device_keys_uploaded(&self) -> bool {
        self.device_keys_uploaded
    }

    /// Generate `count` fresh one-time keys.
    pub(crate) fn generate_one_time_keys<E: Environment>(&mut self, env: &E, count: usize) {
        for _ in 0..count {
            let keypair = Curve25519Keypair::from_seed(env.random_seed());
            let key_id = encode_key(&self.next_key_id.to_be_bytes());
            self.next_key_id += 1;
            self.one_time_keys
                .insert(keypair.public_key(), OneTimeKey { key_id, keypair, published: false });
        }
    }

    /// Signed one-time keys not yet uploaded, keyed `signed_curve25519:<id>`.
    pub(crate) fn unpublished_one_time_keys(&self) -> Map<String, Value> {
        let mut keys = Map::new();
        for otk in self.one_time_keys.values().filter(|otk| !otk.published) {
            let mut object = Map::new();
            object.insert("key".to_string(), json!(encode_key(&otk.keypair.public_key())));
            sign_json(&mut object, &self.signing, &self.user_id, self.device_id.as_str());
            keys.insert(format!("{SIGNED_CURVE25519}:{}", otk.key_id), Value::Object(object));
        }
        keys
    }

    pub(crate) fn mark_keys_as_published(&mut self) {
        for otk in self.one_time_keys.values_mut() {
            otk.published = true;
        }
        self.device_keys_uploaded = true;
    }

    /// Keypair for a one-time key this device published.
    pub(crate) fn one_time_keypair(&self, public_key: &[u8; 32]) -> Option<&Curve25519Keypair> {
        self.one_time_keys.get(public_key).filter(|otk| otk.published).map(|otk| &otk.keypair)
    }
}
