//! The orchestration entry point.

use std::{collections::BTreeMap, sync::Arc};

use keyloom_core::{CryptoEngine, DeviceId, Identity, UserId};

use crate::{
    config::MachineConfig, error::ClientError, observer::ObserverRegistry, queue::EngineQueue,
};

/// Client-side session orchestration over a [`CryptoEngine`].
///
/// The engine is moved onto a dedicated worker thread at construction; every
/// operation is queued there and runs one at a time in arrival order. The
/// machine never performs network I/O: it hands out [`OutgoingRequest`]s and
/// takes responses and sync deltas back.
///
/// Clones share the engine, the worker and the observer registry. The worker
/// stops when the last clone is dropped.
///
/// [`OutgoingRequest`]: keyloom_core::OutgoingRequest
pub struct Machine<E: CryptoEngine> {
    pub(crate) queue: EngineQueue<E>,
    pub(crate) identity: Arc<Identity>,
    pub(crate) observers: ObserverRegistry,
    pub(crate) config: Arc<MachineConfig>,
}

impl<E: CryptoEngine> Clone for Machine<E> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            identity: Arc::clone(&self.identity),
            observers: self.observers.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<E: CryptoEngine> Machine<E> {
    /// Start a machine with default configuration.
    ///
    /// # Errors
    ///
    /// `Worker` if the engine thread cannot be spawned.
    pub fn new(engine: E) -> Result<Self, ClientError> {
        Self::with_config(engine, MachineConfig::default())
    }

    /// Start a machine.
    ///
    /// # Errors
    ///
    /// - `Config`: the configuration is invalid
    /// - `Worker`: the engine thread cannot be spawned
    pub fn with_config(engine: E, config: MachineConfig) -> Result<Self, ClientError> {
        config.validate()?;

        let identity = engine.identity();
        let queue = EngineQueue::spawn(engine, config.queue_capacity, &config.worker_thread_name)?;

        tracing::info!(
            user_id = %identity.user_id,
            device_id = %identity.device_id,
            "machine started"
        );

        Ok(Self {
            queue,
            identity: Arc::new(identity),
            observers: ObserverRegistry::default(),
            config: Arc::new(config),
        })
    }

    /// Identity of the local device, read once at construction.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Own user.
    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    /// Own device.
    pub fn device_id(&self) -> &DeviceId {
        &self.identity.device_id
    }

    /// Public identity keys of the local device.
    pub fn identity_keys(&self) -> &BTreeMap<String, String> {
        &self.identity.identity_keys
    }

    /// Configuration the machine was started with.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Add users to the tracked set. Their device lists are queried through
    /// the next [`outgoing_requests`](Self::outgoing_requests).
    pub async fn update_tracked_users(&self, users: &[UserId]) -> Result<(), ClientError> {
        let users = users.to_vec();
        self.queue.run(move |engine| engine.update_tracked_users(&users)).await??;
        Ok(())
    }

    /// Users whose device lists the engine maintains.
    pub async fn tracked_users(&self) -> Result<Vec<UserId>, ClientError> {
        self.queue.run(|engine| engine.tracked_users()).await
    }

    /// Whether `user` is tracked.
    pub async fn is_user_tracked(&self, user: &UserId) -> Result<bool, ClientError> {
        let user = user.clone();
        self.queue.run(move |engine| engine.tracked_users().contains(&user)).await
    }
}

impl<E: CryptoEngine> std::fmt::Debug for Machine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("user_id", &self.identity.user_id)
            .field("device_id", &self.identity.device_id)
            .field("subscriptions", &self.observers.len())
            .finish_non_exhaustive()
    }
}
