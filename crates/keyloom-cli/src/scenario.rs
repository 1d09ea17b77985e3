//! Demo scenarios driven against the simulated homeserver.

use std::path::Path;

use keyloom_client::{ClientError, DeviceId, KeyImportCounts, Machine, RoomEvent, RoomId, UserId};
use keyloom_core::{Environment, IdError, OutgoingRequest};
use keyloom_harness::{MemoryEngine, SimError, SimHomeserver};
use serde_json::json;

/// Scenario failures.
#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    /// The machine rejected an operation
    #[error(transparent)]
    Client(#[from] ClientError),

    /// The simulated homeserver rejected a request
    #[error(transparent)]
    Server(#[from] SimError),

    /// A generated identifier was invalid
    #[error(transparent)]
    Id(#[from] IdError),

    /// A server event could not be decoded
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Writing the export failed
    #[error("failed to write export: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of [`simulate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationReport {
    /// Messages alice encrypted
    pub sent: usize,
    /// Messages bob decrypted to the original body
    pub decrypted: usize,
}

struct SimDevice<E: Environment> {
    user: UserId,
    device: DeviceId,
    machine: Machine<MemoryEngine<E>>,
}

impl<E: Environment> SimDevice<E> {
    fn new(env: &E, name: &str) -> Result<Self, ScenarioError> {
        let user = UserId::try_from(format!("@{name}:keyloom.local"))?;
        let device = DeviceId::try_from(name.to_uppercase())?;
        let engine = MemoryEngine::new(env.clone(), user.clone(), device.clone());
        Ok(Self { user, device, machine: Machine::new(engine)? })
    }

    async fn send(
        &self,
        server: &SimHomeserver,
        request: &OutgoingRequest,
    ) -> Result<(), ScenarioError> {
        let response = server.handle(&self.user, &self.device, request)?;
        self.machine.mark_request_as_sent(&request.request_id, request.kind, &response).await?;
        Ok(())
    }

    async fn flush(&self, server: &SimHomeserver) -> Result<(), ScenarioError> {
        for request in self.machine.outgoing_requests().await? {
            self.send(server, &request).await?;
        }
        Ok(())
    }

    async fn sync(&self, server: &SimHomeserver) -> Result<usize, ScenarioError> {
        let events =
            self.machine.receive_sync_changes(server.sync(&self.user, &self.device)).await?;
        self.flush(server).await?;
        Ok(events.len())
    }
}

/// Alice shares a room key with bob and sends `messages` messages that bob
/// decrypts.
pub async fn simulate<E: Environment>(
    env: &E,
    messages: usize,
) -> Result<SimulationReport, ScenarioError> {
    let server = SimHomeserver::new();
    let alice = SimDevice::new(env, "alice")?;
    let bob = SimDevice::new(env, "bob")?;
    alice.flush(&server).await?;
    bob.flush(&server).await?;

    let room = RoomId::try_from("!demo:keyloom.local")?;
    let members = [bob.user.clone()];
    alice.machine.update_tracked_users(&members).await?;
    alice.flush(&server).await?;
    if let Some(claim) = alice.machine.get_missing_sessions(&members).await? {
        alice.send(&server, &claim).await?;
    }
    for request in alice.machine.share_room_key(&room, &members).await? {
        alice.send(&server, &request).await?;
    }

    let received = bob.sync(&server).await?;
    tracing::info!(events = received, "bob received to-device events");

    let mut report = SimulationReport { sent: 0, decrypted: 0 };
    for n in 0..messages {
        let body = format!("message {n}");
        let content = alice
            .machine
            .encrypt(&room, "m.room.message", &json!({ "msgtype": "m.text", "body": body }))
            .await?;
        report.sent += 1;

        let event: RoomEvent =
            serde_json::from_value(server.room_event(&alice.user, &room, content))?;
        match bob.machine.decrypt_room_event(&event).await {
            Ok(decrypted) if decrypted.content["body"] == body.as_str() => {
                report.decrypted += 1;
                tracing::debug!(
                    event_id = event.event_id.as_deref().unwrap_or_default(),
                    "message decrypted"
                );
            },
            Ok(_) => tracing::warn!(n, "decrypted body does not match"),
            Err(err) => tracing::warn!(n, error = %err, "bob could not decrypt"),
        }
    }

    Ok(report)
}

/// Create `rooms` room sessions, export them, and import the export into a
/// fresh device.
///
/// With `out`, the export is also written to that file.
pub async fn export_roundtrip<E: Environment>(
    env: &E,
    rooms: usize,
    passphrase: &str,
    rounds: u32,
    out: Option<&Path>,
) -> Result<KeyImportCounts, ScenarioError> {
    let source = SimDevice::new(env, "alice")?;
    for n in 0..rooms {
        let room = RoomId::try_from(format!("!room{n}:keyloom.local"))?;
        source.machine.share_room_key(&room, &[]).await?;
    }

    let exported = source.machine.export_room_keys(passphrase, rounds).await?;
    if let Some(path) = out {
        tokio::fs::write(path, &exported).await?;
        tracing::info!(path = %path.display(), bytes = exported.len(), "export written");
    }

    let target = SimDevice::new(env, "restored")?;
    let counts = target
        .machine
        .import_room_keys_with_progress(&exported, passphrase, |done, total| {
            tracing::debug!(done, total, "import progress");
        })
        .await?;
    Ok(counts)
}
