//! Public device descriptors.

use std::collections::BTreeMap;

use keyloom_core::{DeviceId, DeviceRecord, Identity, LocalTrust, UserId};
use serde::{Deserialize, Serialize};

/// Snapshot of a device as seen by the local engine.
///
/// Descriptors are never updated in place. Fetch again to see changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Owner
    pub user_id: UserId,
    /// Device id, unique per user
    pub device_id: DeviceId,
    /// `"<algorithm>:<device_id>"` to public key
    pub keys: BTreeMap<String, String>,
    /// Encryption algorithms the device supports
    pub algorithms: Vec<String>,
    /// Signer user id to (`"<algorithm>:<key_id>"` to signature)
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
    /// Human-readable name set by the owner
    pub display_name: Option<String>,
    /// Local trust decision as stored by the engine
    pub local_trust: LocalTrust,
    /// Verified on this device. Always true for the own device.
    pub is_locally_trusted: bool,
    /// Vouched for by the owner's cross-signing identity
    pub is_cross_signing_trusted: bool,
    /// Blocked from receiving room keys
    pub is_blocked: bool,
    /// When the engine first saw the device (Unix millis)
    pub first_time_seen_ts: Option<u64>,
}

impl Device {
    /// Project an engine record. `own` identifies the local device.
    pub(crate) fn from_record(record: DeviceRecord, own: &Identity) -> Self {
        let is_own = record.user_id == own.user_id && record.device_id == own.device_id;
        let is_blocked = !is_own && record.is_blacklisted();

        Self {
            is_locally_trusted: is_own || record.local_trust == LocalTrust::Verified,
            is_cross_signing_trusted: record.cross_signing_trusted,
            is_blocked,
            user_id: record.user_id,
            device_id: record.device_id,
            keys: record.keys,
            algorithms: record.algorithms,
            signatures: record.signatures,
            display_name: record.display_name,
            local_trust: record.local_trust,
            first_time_seen_ts: record.first_time_seen_ts,
        }
    }

    /// Key for `algorithm`.
    pub fn key(&self, algorithm: &str) -> Option<&str> {
        self.keys.get(&format!("{algorithm}:{}", self.device_id)).map(String::as_str)
    }

    /// Curve25519 identity key.
    pub fn curve25519_key(&self) -> Option<&str> {
        self.key("curve25519")
    }

    /// Ed25519 signing key.
    pub fn ed25519_key(&self) -> Option<&str> {
        self.key("ed25519")
    }

    /// Trusted either locally or through cross-signing.
    pub fn is_trusted(&self) -> bool {
        self.is_locally_trusted || self.is_cross_signing_trusted
    }
}
