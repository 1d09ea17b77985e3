//! Keyloom Client
//!
//! Client-side session orchestration for end-to-end encrypted messaging. The
//! [`Machine`] sits between a messaging client and a [`CryptoEngine`]: it turns
//! protocol needs into outgoing requests, applies sync deltas, encrypts and
//! decrypts room events, and moves room keys in and out of passphrase-protected
//! exports.
//!
//! # Architecture
//!
//! ```text
//! Messaging client ──▶ Machine ──▶ EngineQueue ──▶ CryptoEngine (worker thread)
//!        ▲                │
//!        │                └──▶ ObserverRegistry ──▶ LiveDevices / DeviceObserver
//!        └── OutgoingRequest, processed events, DecryptedEvent
//! ```
//!
//! The machine never performs network I/O. The caller sends every
//! [`OutgoingRequest`] and reports the response through
//! [`Machine::mark_request_as_sent`].
//!
//! # Components
//!
//! - [`Machine`]: public entry point, cheap to clone
//! - [`Device`]: device descriptor projected from engine records
//! - [`LiveDevices`]/[`DeviceObserver`]: device lists pushed after key queries
//! - [`RoomEvent`]/[`DecryptedEvent`]: the encryption boundary
//! - [`MachineConfig`]: queue and export tuning

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod backup;
mod config;
mod device;
mod directory;
mod encryption;
mod error;
mod machine;
mod observer;
mod queue;
mod requests;
mod sync;

pub use config::MachineConfig;
pub use device::Device;
pub use encryption::{DecryptedEvent, RoomEvent};
pub use error::ClientError;
pub use keyloom_core::{
    CryptoEngine, DeviceId, DeviceListChanges, EngineError, KeyImportCounts, LocalTrust,
    MegolmError, OutgoingRequest, RequestId, RequestKind, RoomId, SyncDelta, UserId,
};
pub use machine::Machine;
pub use observer::{DeviceObserver, LiveDevices};
