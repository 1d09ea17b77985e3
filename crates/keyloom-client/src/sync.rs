//! Sync ingestion.

use std::collections::BTreeMap;

use keyloom_core::{CryptoEngine, DeviceListChanges, EngineError, SyncDelta};
use serde_json::{Value, json};

use crate::{directory::refresh_subscriptions, error::ClientError, machine::Machine};

/// A sync delta in the shape the engine applies.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct NormalizedSync {
    /// `{"events": [...]}`, empty when the delta had no to-device part
    pub(crate) to_device: String,
    /// Empty when the delta had no device-list part
    pub(crate) changes: DeviceListChanges,
    /// Left out entirely when absent, never zero-filled
    pub(crate) one_time_key_counts: Option<BTreeMap<String, u64>>,
}

impl NormalizedSync {
    pub(crate) fn from_delta(delta: SyncDelta) -> Self {
        let events = delta.to_device_events.unwrap_or_default();
        Self {
            to_device: json!({ "events": events }).to_string(),
            changes: delta.device_lists.unwrap_or_default(),
            one_time_key_counts: delta.one_time_key_counts,
        }
    }
}

impl<E: CryptoEngine> Machine<E> {
    /// Apply one sync delta.
    ///
    /// Returns the processed to-device events, decrypted where the engine
    /// could. Any engine failure fails the whole delta.
    ///
    /// Subscriptions watching a user reported as left receive their new device
    /// list before this returns. Changed users are only marked outdated; their
    /// subscriptions update once the resulting keys query resolves.
    pub async fn receive_sync_changes(&self, delta: SyncDelta) -> Result<Vec<Value>, ClientError> {
        let sync = NormalizedSync::from_delta(delta);
        let changed = sync.changes.changed.len();
        let left = sync.changes.left.len();

        let (own, observers) = (self.identity.clone(), self.observers.clone());

        let processed = self
            .queue
            .run(move |engine| {
                let processed = engine.receive_sync_changes(
                    &sync.to_device,
                    &sync.changes,
                    sync.one_time_key_counts.as_ref(),
                )?;
                if !sync.changes.left.is_empty() {
                    refresh_subscriptions(engine, &own, &observers, Some(&sync.changes.left))?;
                }
                Ok::<_, EngineError>(processed)
            })
            .await??;

        let mut batch: Value = serde_json::from_str(&processed)?;
        let events = match batch.get_mut("events").map(Value::take) {
            Some(Value::Array(events)) => events,
            _ => Vec::new(),
        };

        tracing::debug!(to_device = events.len(), changed, left, "sync changes received");
        Ok(events)
    }
}
