//! Keyloom Core
//!
//! Sans-IO vocabulary shared by the orchestration layer and every crypto
//! engine: identifiers, device records, outgoing requests, sync deltas and the
//! [`CryptoEngine`] contract.
//!
//! Nothing in this crate performs I/O, spawns threads or reads clocks. Time and
//! randomness come from an [`Environment`] so engines can be driven
//! deterministically in tests.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod device;
pub mod engine;
pub mod env;
pub mod error;
pub mod event;
pub mod ids;
pub mod request;
pub mod sync;

pub use device::{DeviceRecord, Identity, LocalTrust};
pub use engine::CryptoEngine;
pub use env::Environment;
pub use error::{EngineError, MegolmError};
pub use event::{DecryptedRoomEvent, KeyImportCounts};
pub use ids::{DeviceId, IdError, RequestId, RoomId, UserId};
pub use request::{OutgoingRequest, RequestKind};
pub use sync::{DeviceListChanges, SyncDelta};

/// Group session algorithm name.
pub const MEGOLM_V1_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Pairwise session algorithm name.
pub const OLM_V1_ALGORITHM: &str = "m.olm.v1.curve25519-aes-sha2";

/// One-time key algorithm name used in key counts and claims.
pub const SIGNED_CURVE25519: &str = "signed_curve25519";
