//! Fuzz target for sync ingestion in the reference engine
//!
//! # Strategy
//!
//! - Arbitrary JSON-ish text as the to-device batch
//! - Arbitrary device-list changes built from a small user pool
//!
//! # Invariants
//!
//! - Malformed batches fail with an error, never a panic
//! - The own user is always tracked afterwards

#![no_main]

use arbitrary::Arbitrary;
use keyloom_core::{CryptoEngine, DeviceId, DeviceListChanges, UserId};
use keyloom_harness::{MemoryEngine, SimEnv};
use libfuzzer_sys::fuzz_target;

const USERS: [&str; 3] = ["@alice:example.org", "@bob:example.org", "@carol:example.org"];

#[derive(Debug, Arbitrary)]
struct SyncInput {
    batch: String,
    changed: Vec<u8>,
    left: Vec<u8>,
}

fn pick(indices: &[u8]) -> Vec<UserId> {
    indices
        .iter()
        .filter_map(|i| UserId::try_from(USERS[*i as usize % USERS.len()]).ok())
        .collect()
}

fuzz_target!(|input: SyncInput| {
    let own = UserId::try_from(USERS[0]).unwrap();
    let device = DeviceId::try_from("ALICE").unwrap();
    let mut engine = MemoryEngine::new(SimEnv::with_seed(0), own.clone(), device);

    let changes = DeviceListChanges { changed: pick(&input.changed), left: pick(&input.left) };
    let _ = engine.receive_sync_changes(&input.batch, &changes, None);

    assert!(engine.tracked_users().contains(&own));
});
