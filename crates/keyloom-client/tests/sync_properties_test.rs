//! Tracking state after arbitrary device-list deltas.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;

use keyloom_client::{DeviceId, DeviceListChanges, Machine, SyncDelta, UserId};
use keyloom_harness::{MemoryEngine, SimEnv};
use proptest::prelude::*;

const NAMES: [&str; 4] = ["alice", "bob", "carol", "dave"];

fn user(index: usize) -> UserId {
    UserId::try_from(format!("@{}:example.org", NAMES[index])).unwrap()
}

fn delta_strategy() -> impl Strategy<Value = (Vec<usize>, Vec<usize>)> {
    (
        prop::collection::vec(0..NAMES.len(), 0..4),
        prop::collection::vec(0..NAMES.len(), 0..3),
    )
}

/// Changes mark users tracked unless the same delta reports them as left.
/// Leaving untracks everyone except the own user.
fn apply_model(tracked: &mut BTreeSet<UserId>, own: &UserId, changes: &DeviceListChanges) {
    for user in &changes.changed {
        if !changes.left.contains(user) {
            tracked.insert(user.clone());
        }
    }
    for user in &changes.left {
        if user != own {
            tracked.remove(user);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn tracking_follows_device_list_deltas(deltas in prop::collection::vec(delta_strategy(), 1..6)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let own = user(0);
            let engine = MemoryEngine::new(
                SimEnv::with_seed(17),
                own.clone(),
                DeviceId::try_from("ALICE").unwrap(),
            );
            let machine = Machine::new(engine).unwrap();
            let mut model = BTreeSet::from([own.clone()]);

            for (changed, left) in &deltas {
                let changes = DeviceListChanges {
                    changed: changed.iter().copied().map(user).collect(),
                    left: left.iter().copied().map(user).collect(),
                };
                apply_model(&mut model, &own, &changes);
                let delta = SyncDelta { device_lists: Some(changes), ..Default::default() };
                machine.receive_sync_changes(delta).await.unwrap();
            }

            let tracked: BTreeSet<UserId> =
                machine.tracked_users().await.unwrap().into_iter().collect();
            prop_assert_eq!(&tracked, &model);
            prop_assert!(machine.is_user_tracked(&own).await.unwrap());
            Ok(())
        })?;
    }
}
