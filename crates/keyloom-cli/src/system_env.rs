//! Environment backed by the operating system.
//!
//! Randomness comes from getrandom and is not reproducible. Timestamps come
//! from the system clock.

use keyloom_core::Environment;

/// Environment using OS randomness and the system clock.
///
/// # Panics
///
/// Panics if the OS RNG fails. Key material cannot be generated without it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    #[allow(clippy::expect_used)]
    fn random_bytes(&self, buffer: &mut [u8]) {
        getrandom::fill(buffer).expect("invariant: OS RNG failure is unrecoverable");
    }

    fn wall_clock_millis(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_bytes_differ() {
        let mut first = [0u8; 32];
        let mut second = [0u8; 32];
        SystemEnv.random_bytes(&mut first);
        SystemEnv.random_bytes(&mut second);
        assert_ne!(first, second);
    }

    #[test]
    fn clock_is_after_epoch() {
        assert!(SystemEnv.wall_clock_millis() > 1_600_000_000_000);
    }
}
