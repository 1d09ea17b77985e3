//! Environment abstraction for deterministic testing.
//!
//! Decouples engine logic from system resources (wall clock, randomness).
//! Enables deterministic simulation with a seeded RNG and a virtual clock, and
//! production use with real system resources.

/// Abstract environment providing time and randomness.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `random_bytes()` uses cryptographically secure entropy in production
/// - `wall_clock_millis()` never goes backwards within one environment
pub trait Environment: Clone + Send + Sync + 'static {
    /// Fills the provided buffer with random bytes.
    ///
    /// # Invariants
    ///
    /// - Given the same RNG seed, this produces the same sequence of bytes
    /// - Uses cryptographically secure RNG
    fn random_bytes(&self, buffer: &mut [u8]);

    /// Milliseconds since the Unix epoch.
    ///
    /// Used for first-seen timestamps, never for protocol decisions.
    fn wall_clock_millis(&self) -> u64;

    /// Generates a random `u64`.
    fn random_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        self.random_bytes(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    /// Generates a random `u128`.
    ///
    /// Useful for request ids.
    fn random_u128(&self) -> u128 {
        let mut bytes = [0u8; 16];
        self.random_bytes(&mut bytes);
        u128::from_be_bytes(bytes)
    }

    /// Generates a random 32-byte seed.
    fn random_seed(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        self.random_bytes(&mut seed);
        seed
    }
}
