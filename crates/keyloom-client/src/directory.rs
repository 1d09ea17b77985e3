//! Device directory and live device subscriptions.
//!
//! Every lookup re-derives descriptors from engine state. Nothing is cached
//! here: a device list can change between two calls and a stale answer would
//! be a trust bug.

use keyloom_core::{CryptoEngine, DeviceId, EngineError, Identity, LocalTrust, UserId};

use crate::{
    device::Device,
    error::ClientError,
    machine::Machine,
    observer::{LiveDevices, ObserverRegistry},
};

/// Descriptor of one device.
pub(crate) fn device_of<E: CryptoEngine>(
    engine: &E,
    own: &Identity,
    user: &UserId,
    device: &DeviceId,
) -> Result<Option<Device>, EngineError> {
    Ok(engine.device(user, device)?.map(|record| Device::from_record(record, own)))
}

/// Descriptors of every device of `user`.
pub(crate) fn devices_of<E: CryptoEngine>(
    engine: &E,
    own: &Identity,
    user: &UserId,
) -> Result<Vec<Device>, EngineError> {
    Ok(engine
        .user_devices(user)?
        .into_iter()
        .map(|record| Device::from_record(record, own))
        .collect())
}

/// Devices of `users`, flattened in input order.
pub(crate) fn devices_of_users<E: CryptoEngine>(
    engine: &E,
    own: &Identity,
    users: &[UserId],
) -> Result<Vec<Device>, EngineError> {
    let mut devices = Vec::new();
    for user in users {
        devices.extend(devices_of(engine, own, user)?);
    }
    Ok(devices)
}

impl<E: CryptoEngine> Machine<E> {
    /// One device of `user`, if known.
    pub async fn device(
        &self,
        user: &UserId,
        device: &DeviceId,
    ) -> Result<Option<Device>, ClientError> {
        let (user, device, own) = (user.clone(), device.clone(), self.identity.clone());
        Ok(self.queue.run(move |engine| device_of(engine, &own, &user, &device)).await??)
    }

    /// Every known device of `user`.
    pub async fn devices_of(&self, user: &UserId) -> Result<Vec<Device>, ClientError> {
        let (user, own) = (user.clone(), self.identity.clone());
        Ok(self.queue.run(move |engine| devices_of(engine, &own, &user)).await??)
    }

    /// Every known device of `users`, the devices of earlier users first.
    pub async fn devices_of_users(&self, users: &[UserId]) -> Result<Vec<Device>, ClientError> {
        let (users, own) = (users.to_vec(), self.identity.clone());
        Ok(self.queue.run(move |engine| devices_of_users(engine, &own, &users)).await??)
    }

    /// Subscribe to the device lists of `users`.
    ///
    /// The initial list is computed before this returns. The subscription
    /// receives updates only while an observer is attached.
    pub async fn live_devices(&self, users: &[UserId]) -> Result<LiveDevices, ClientError> {
        let (own, observers) = (self.identity.clone(), self.observers.clone());
        let users = users.to_vec();
        Ok(self
            .queue
            .run(move |engine| {
                let initial = devices_of_users(engine, &own, &users)?;
                Ok::<_, EngineError>(observers.subscribe(users, initial))
            })
            .await??)
    }

    /// Record a local trust decision and refresh subscriptions watching `user`.
    pub async fn set_local_trust(
        &self,
        user: &UserId,
        device: &DeviceId,
        trust: LocalTrust,
    ) -> Result<(), ClientError> {
        let (owner, device_id) = (user.clone(), device.clone());
        let (own, observers) = (self.identity.clone(), self.observers.clone());

        let delivered = self
            .queue
            .run(move |engine| {
                engine.set_local_trust(&owner, &device_id, trust)?;
                refresh_subscriptions(engine, &own, &observers, Some(&[owner]))
            })
            .await??;

        tracing::info!(
            user_id = %user,
            device_id = %device,
            ?trust,
            delivered,
            "local trust updated"
        );
        Ok(())
    }
}

/// Recompute and push device lists to registered subscriptions.
///
/// Runs on the engine worker so that lists are pushed in the order the
/// engine state changed. With `watching`, only subscriptions watching one of
/// those users are refreshed. Returns the number of pushes delivered.
pub(crate) fn refresh_subscriptions<E: CryptoEngine>(
    engine: &E,
    own: &Identity,
    observers: &ObserverRegistry,
    watching: Option<&[UserId]>,
) -> Result<usize, EngineError> {
    let mut delivered = 0;
    for (id, users) in observers.targets(watching) {
        if observers.push(id, devices_of_users(engine, own, &users)?) {
            delivered += 1;
        }
    }
    if delivered > 0 {
        tracing::debug!(delivered, "device subscriptions refreshed");
    }
    Ok(delivered)
}
