//! In-memory engine state.

use std::collections::{BTreeMap, BTreeSet};

use keyloom_core::{DeviceId, DeviceRecord, RoomId, UserId};
use keyloom_crypto::{InboundGroupSession, OutboundGroupSession};

/// Key-query state of a tracked user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct TrackedUser {
    /// Device list must be re-queried
    pub outdated: bool,
    /// A keys query covering the user is unresolved
    pub in_flight: bool,
}

/// Sending half of a pairwise channel: the claimed one-time key to seal to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PairwiseSession {
    pub one_time_key: [u8; 32],
}

/// Outbound room session plus the devices it was shared with.
pub(crate) struct OutboundRoomSession {
    pub session: OutboundGroupSession,
    pub shared_with: BTreeSet<(UserId, DeviceId)>,
    pub messages_encrypted: u32,
}

/// Inbound room session plus its provenance.
pub(crate) struct InboundRoomSession {
    pub room_id: RoomId,
    pub session: InboundGroupSession,
    pub sender_key: String,
    pub claimed_ed25519_key: Option<String>,
    pub forwarding_chain: Vec<String>,
    /// Message index to the event id first decrypted at it
    pub decrypted: BTreeMap<u32, String>,
}

#[derive(Default)]
pub(crate) struct Store {
    pub tracked: BTreeMap<UserId, TrackedUser>,
    pub devices: BTreeMap<UserId, BTreeMap<DeviceId, DeviceRecord>>,
    /// Keyed by the peer's curve25519 identity key
    pub pairwise: BTreeMap<String, PairwiseSession>,
    pub outbound: BTreeMap<RoomId, OutboundRoomSession>,
    /// Keyed by session id
    pub inbound: BTreeMap<String, InboundRoomSession>,
}

impl Store {
    /// Start tracking `user`. Returns whether the user was new.
    pub(crate) fn track(&mut self, user: &UserId) -> bool {
        if self.tracked.contains_key(user) {
            return false;
        }
        self.tracked.insert(user.clone(), TrackedUser { outdated: true, in_flight: false });
        true
    }

    pub(crate) fn mark_outdated(&mut self, user: &UserId) {
        self.tracked.entry(user.clone()).or_default().outdated = true;
    }

    /// Stop tracking `user` and forget its devices.
    pub(crate) fn untrack(&mut self, user: &UserId) {
        self.tracked.remove(user);
        if let Some(devices) = self.devices.remove(user) {
            for record in devices.values() {
                if let Some(curve) = record.curve25519_key() {
                    self.pairwise.remove(curve);
                }
            }
        }
    }

    /// Outdated users without a query in flight, marked in flight.
    pub(crate) fn take_users_to_query(&mut self) -> Vec<UserId> {
        let mut users = Vec::new();
        for (user, state) in &mut self.tracked {
            if state.outdated && !state.in_flight {
                state.outdated = false;
                state.in_flight = true;
                users.push(user.clone());
            }
        }
        users
    }

    pub(crate) fn finish_query(&mut self, users: &[UserId]) {
        for user in users {
            if let Some(state) = self.tracked.get_mut(user) {
                state.in_flight = false;
            }
        }
    }

    pub(crate) fn device(&self, user: &UserId, device: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(user).and_then(|devices| devices.get(device))
    }

    pub(crate) fn device_by_curve_key(&self, curve: &str) -> Option<&DeviceRecord> {
        self.devices
            .values()
            .flat_map(BTreeMap::values)
            .find(|record| record.curve25519_key() == Some(curve))
    }

    pub(crate) fn user_devices(&self, user: &UserId) -> Vec<DeviceRecord> {
        self.devices.get(user).map(|devices| devices.values().cloned().collect()).unwrap_or_default()
    }
}
