//! Device records as held by a crypto engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, UserId};

/// Trust a user assigned to a device on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalTrust {
    /// No decision made
    #[default]
    Unset,
    /// Verified by the user
    Verified,
    /// Blocked: never receives room keys
    BlackListed,
    /// Trust decisions are ignored for this device
    Ignored,
}

/// Engine-side record of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
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
    /// Local trust decision
    pub local_trust: LocalTrust,
    /// Whether the owner's cross-signing identity vouches for the device
    pub cross_signing_trusted: bool,
    /// When this engine first saw the device (Unix millis)
    pub first_time_seen_ts: Option<u64>,
}

impl DeviceRecord {
    /// Key for `algorithm`, looked up as `"<algorithm>:<device_id>"`.
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

    /// Whether the device is blocked.
    pub fn is_blacklisted(&self) -> bool {
        self.local_trust == LocalTrust::BlackListed
    }
}

/// The local device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Own user
    pub user_id: UserId,
    /// Own device
    pub device_id: DeviceId,
    /// `"<algorithm>:<device_id>"` to public key
    pub identity_keys: BTreeMap<String, String>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn key_lookup_uses_device_id() {
        let record = DeviceRecord {
            user_id: UserId::try_from("@a:b").unwrap(),
            device_id: DeviceId::try_from("DEV").unwrap(),
            keys: BTreeMap::from([
                ("curve25519:DEV".to_string(), "curve".to_string()),
                ("ed25519:DEV".to_string(), "ed".to_string()),
                ("ed25519:OTHER".to_string(), "wrong".to_string()),
            ]),
            algorithms: Vec::new(),
            signatures: BTreeMap::new(),
            display_name: None,
            local_trust: LocalTrust::BlackListed,
            cross_signing_trusted: false,
            first_time_seen_ts: None,
        };

        assert_eq!(record.curve25519_key(), Some("curve"));
        assert_eq!(record.ed25519_key(), Some("ed"));
        assert!(record.is_blacklisted());
    }

    #[test]
    fn local_trust_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&LocalTrust::BlackListed).unwrap(), "\"black_listed\"");
    }
}
