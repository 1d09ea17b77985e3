//! Simulated environment with a seeded RNG and a virtual clock.

use std::sync::Arc;

use keyloom_core::Environment;
use parking_lot::Mutex;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Virtual clock start: 2024-01-01T00:00:00Z in Unix millis.
const EPOCH_MILLIS: u64 = 1_704_067_200_000;

/// Deterministic environment for tests and simulations.
///
/// Clones share one RNG stream and one clock, so several engines built from
/// the same `SimEnv` still replay identically for a given seed.
#[derive(Clone)]
pub struct SimEnv {
    inner: Arc<Mutex<SimEnvState>>,
}

struct SimEnvState {
    rng: ChaCha20Rng,
    now_millis: u64,
}

impl SimEnv {
    /// Environment seeded with 0.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with an explicit seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimEnvState {
                rng: ChaCha20Rng::seed_from_u64(seed),
                now_millis: EPOCH_MILLIS,
            })),
        }
    }

    /// Move the virtual clock forward.
    pub fn advance_millis(&self, millis: u64) {
        let mut state = self.inner.lock();
        state.now_millis = state.now_millis.saturating_add(millis);
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimEnv").field("now_millis", &self.inner.lock().now_millis).finish()
    }
}

impl Environment for SimEnv {
    fn random_bytes(&self, buffer: &mut [u8]) {
        self.inner.lock().rng.fill_bytes(buffer);
    }

    fn wall_clock_millis(&self) -> u64 {
        self.inner.lock().now_millis
    }
}
