//! Live device-list subscriptions.
//!
//! A [`LiveDevices`] subscription watches a fixed set of users. It is
//! registered with the machine's [`ObserverRegistry`] only while at least one
//! [`DeviceObserver`] is attached:
//!
//! - The first observer to attach registers the subscription
//! - The last observer to detach deregisters it immediately
//! - Registered subscriptions receive a fresh device list after every
//!   device-key query, in registration order. Local trust changes and users
//!   reported as left push only to subscriptions watching those users.
//!
//! Pushes are made from the engine worker, in the job that changed the state.
//!
//! Attaching to a subscription replays its last value without recomputing it.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use keyloom_core::UserId;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::{device::Device, error::ClientError};

struct Subscription {
    id: u64,
    users: Vec<UserId>,
    sender: watch::Sender<Vec<Device>>,
    observers: Mutex<usize>,
    generation: AtomicU64,
    registry: ObserverRegistry,
}

impl Subscription {
    fn attach(self: &Arc<Self>) {
        let mut observers = self.observers.lock();
        *observers += 1;
        if *observers == 1 {
            self.registry.register(Arc::clone(self));
        }
    }

    fn detach(&self) {
        let mut observers = self.observers.lock();
        *observers = observers.saturating_sub(1);
        if *observers == 0 {
            self.registry.unregister(self.id);
        }
    }
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    /// Registered subscriptions in registration order
    registered: Vec<Arc<Subscription>>,
}

/// Registry of subscriptions with at least one observer.
///
/// Synchronized independently of the engine queue.
#[derive(Clone, Default)]
pub(crate) struct ObserverRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl ObserverRegistry {
    /// Create an unregistered subscription holding `initial`.
    pub(crate) fn subscribe(&self, users: Vec<UserId>, initial: Vec<Device>) -> LiveDevices {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            state.next_id
        };
        let (sender, _) = watch::channel(initial);

        LiveDevices {
            subscription: Arc::new(Subscription {
                id,
                users,
                sender,
                observers: Mutex::new(0),
                generation: AtomicU64::new(0),
                registry: self.clone(),
            }),
        }
    }

    fn register(&self, subscription: Arc<Subscription>) {
        tracing::debug!(subscription = subscription.id, "device subscription registered");
        self.state.lock().registered.push(subscription);
    }

    fn unregister(&self, id: u64) {
        self.state.lock().registered.retain(|s| s.id != id);
        tracing::debug!(subscription = id, "device subscription unregistered");
    }

    /// Watched users of every registered subscription, in registration order.
    ///
    /// With `watching`, only subscriptions watching at least one of those users
    /// are returned.
    pub(crate) fn targets(&self, watching: Option<&[UserId]>) -> Vec<(u64, Vec<UserId>)> {
        self.state
            .lock()
            .registered
            .iter()
            .filter(|s| watching.is_none_or(|users| users.iter().any(|u| s.users.contains(u))))
            .map(|s| (s.id, s.users.clone()))
            .collect()
    }

    /// Deliver `devices` to subscription `id` if it is still registered.
    ///
    /// Returns whether the push was delivered.
    pub(crate) fn push(&self, id: u64, devices: Vec<Device>) -> bool {
        let state = self.state.lock();
        let Some(subscription) = state.registered.iter().find(|s| s.id == id) else {
            return false;
        };
        subscription.sender.send_replace(devices);
        subscription.generation.fetch_add(1, Ordering::SeqCst);
        true
    }

    /// Number of registered subscriptions.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().registered.len()
    }
}

/// A subscription to the device lists of a fixed set of users.
///
/// Cloning shares the subscription.
#[derive(Clone)]
pub struct LiveDevices {
    subscription: Arc<Subscription>,
}

impl LiveDevices {
    /// Attach an observer, registering the subscription if it had none.
    pub fn observe(&self) -> DeviceObserver {
        let receiver = self.subscription.sender.subscribe();
        self.subscription.attach();
        DeviceObserver { subscription: Arc::clone(&self.subscription), receiver }
    }

    /// Users this subscription watches.
    pub fn users(&self) -> &[UserId] {
        &self.subscription.users
    }

    /// Last device list computed or pushed.
    pub fn current(&self) -> Vec<Device> {
        self.subscription.sender.borrow().clone()
    }

    /// Number of pushes delivered so far.
    pub fn generation(&self) -> u64 {
        self.subscription.generation.load(Ordering::SeqCst)
    }

    /// Number of attached observers.
    pub fn observer_count(&self) -> usize {
        *self.subscription.observers.lock()
    }
}

impl std::fmt::Debug for LiveDevices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveDevices")
            .field("id", &self.subscription.id)
            .field("users", &self.subscription.users)
            .field("observers", &self.observer_count())
            .field("generation", &self.generation())
            .finish()
    }
}

/// An attached observer. Dropping it detaches.
pub struct DeviceObserver {
    subscription: Arc<Subscription>,
    receiver: watch::Receiver<Vec<Device>>,
}

impl DeviceObserver {
    /// Last known device list, without waiting.
    pub fn current(&self) -> Vec<Device> {
        self.receiver.borrow().clone()
    }

    /// Wait for the next push and return it.
    ///
    /// # Errors
    ///
    /// `EngineUnavailable` if the subscription can no longer be pushed to.
    pub async fn changed(&mut self) -> Result<Vec<Device>, ClientError> {
        self.receiver.changed().await.map_err(|_| ClientError::EngineUnavailable)?;
        Ok(self.receiver.borrow_and_update().clone())
    }
}

impl Drop for DeviceObserver {
    fn drop(&mut self) {
        self.subscription.detach();
    }
}

impl std::fmt::Debug for DeviceObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceObserver").field("subscription", &self.subscription.id).finish()
    }
}
