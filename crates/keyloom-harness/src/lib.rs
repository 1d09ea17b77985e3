//! Deterministic simulation harness for Keyloom.
//!
//! Everything the orchestration layer needs to run without a network or a
//! real crypto store:
//!
//! - [`SimEnv`]: seeded RNG and a virtual wall clock
//! - [`MemoryEngine`]: an in-memory [`CryptoEngine`](keyloom_core::CryptoEngine)
//!   built on `keyloom-crypto`
//! - [`SimHomeserver`]: answers outgoing requests for several devices and
//!   produces their sync deltas
//!
//! Given the same seed, a run produces byte-identical requests, ciphertexts
//! and exports.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod engine;
pub mod server;
pub mod sim_env;

pub use engine::{MemoryEngine, MemoryEngineConfig, StoreFaults};
pub use server::{SimError, SimHomeserver};
pub use sim_env::SimEnv;
