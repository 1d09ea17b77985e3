//! Per-cycle sync input.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Users whose device lists changed since the previous sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListChanges {
    /// Users with new, updated or removed devices
    #[serde(default)]
    pub changed: Vec<UserId>,
    /// Users we no longer share a room with
    #[serde(default)]
    pub left: Vec<UserId>,
}

impl DeviceListChanges {
    /// Whether the delta names no users.
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.left.is_empty()
    }
}

/// One batch of server-reported changes.
///
/// Every part is optional. A delta is consumed exactly once.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncDelta {
    /// To-device events, exactly as the server sent them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_device_events: Option<Vec<serde_json::Value>>,
    /// Device list changes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_lists: Option<DeviceListChanges>,
    /// Remaining one-time keys on the server per algorithm
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_time_key_counts: Option<BTreeMap<String, u64>>,
}
