//! End-to-end tests for `Machine` over the reference engine.
//!
//! Machines for alice, bob and carol talk through one `SimHomeserver`. The
//! tests drive requests, syncs, room key sharing and decryption the way a
//! messaging client would.

#![allow(clippy::unwrap_used)]

use keyloom_client::{
    ClientError, DeviceId, LocalTrust, Machine, MachineConfig, RequestId, RequestKind, RoomEvent,
    RoomId, SyncDelta, UserId,
};
use keyloom_harness::{MemoryEngine, MemoryEngineConfig, SimEnv, SimHomeserver, StoreFaults};
use serde_json::{Value, json};

struct Client {
    user: UserId,
    device: DeviceId,
    machine: Machine<MemoryEngine<SimEnv>>,
    faults: StoreFaults,
}

impl Client {
    fn new(env: &SimEnv, name: &str) -> Self {
        let user = UserId::try_from(format!("@{name}:example.org")).unwrap();
        let device = DeviceId::try_from(name.to_uppercase()).unwrap();
        let config = MemoryEngineConfig { one_time_key_target: 4, ..Default::default() };
        let engine = MemoryEngine::with_config(env.clone(), user.clone(), device.clone(), config);
        let faults = engine.faults();
        let machine = Machine::new(engine).unwrap();
        Self { user, device, machine, faults }
    }

    async fn send(&self, server: &SimHomeserver, request: &keyloom_client::OutgoingRequest) {
        let response = server.handle(&self.user, &self.device, request).unwrap();
        self.machine.mark_request_as_sent(&request.request_id, request.kind, &response).await.unwrap();
    }

    async fn flush(&self, server: &SimHomeserver) -> Vec<RequestKind> {
        let requests = self.machine.outgoing_requests().await.unwrap();
        for request in &requests {
            self.send(server, request).await;
        }
        requests.iter().map(|r| r.kind).collect()
    }

    async fn sync(&self, server: &SimHomeserver) -> Result<Vec<Value>, ClientError> {
        let events = self.machine.receive_sync_changes(server.sync(&self.user, &self.device)).await?;
        self.flush(server).await;
        Ok(events)
    }

    async fn connect(&self, server: &SimHomeserver, users: &[UserId]) {
        self.machine.update_tracked_users(users).await.unwrap();
        self.flush(server).await;
        if let Some(claim) = self.machine.get_missing_sessions(users).await.unwrap() {
            self.send(server, &claim).await;
        }
    }

    async fn share(&self, server: &SimHomeserver, room: &RoomId, users: &[UserId]) -> usize {
        let requests = self.machine.share_room_key(room, users).await.unwrap();
        for request in &requests {
            self.send(server, request).await;
        }
        requests.len()
    }

    async fn send_message(&self, server: &SimHomeserver, room: &RoomId, body: &str) -> RoomEvent {
        let content = self
            .machine
            .encrypt(room, "m.room.message", &json!({ "msgtype": "m.text", "body": body }))
            .await
            .unwrap();
        serde_json::from_value(server.room_event(&self.user, room, content)).unwrap()
    }
}

async fn start(names: &[&str]) -> (SimHomeserver, Vec<Client>) {
    let env = SimEnv::with_seed(21);
    let server = SimHomeserver::new();
    let clients: Vec<Client> = names.iter().map(|name| Client::new(&env, name)).collect();
    for client in &clients {
        client.flush(&server).await;
    }
    (server, clients)
}

fn room() -> RoomId {
    RoomId::try_from("!lounge:example.org").unwrap()
}

fn reason(err: ClientError) -> String {
    match err {
        ClientError::UnableToDecrypt { reason } => reason,
        other => format!("unexpected error kind: {other}"),
    }
}

#[tokio::test]
async fn identity_is_cached() {
    let (_server, clients) = start(&["alice"]).await;
    let alice = &clients[0];

    assert_eq!(alice.machine.user_id(), &alice.user);
    assert_eq!(alice.machine.device_id(), &alice.device);
    assert!(alice.machine.identity_keys().contains_key("ed25519:ALICE"));
    assert!(alice.machine.identity_keys().contains_key("curve25519:ALICE"));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let env = SimEnv::new();
    let engine = MemoryEngine::new(
        env,
        UserId::try_from("@alice:example.org").unwrap(),
        DeviceId::try_from("ALICE").unwrap(),
    );
    let config = MachineConfig { queue_capacity: 0, ..Default::default() };
    assert!(matches!(Machine::with_config(engine, config), Err(ClientError::Config(_))));
}

#[tokio::test]
async fn unresolved_requests_reappear() {
    let env = SimEnv::new();
    let alice = Client::new(&env, "alice");

    let first = alice.machine.outgoing_requests().await.unwrap();
    let second = alice.machine.outgoing_requests().await.unwrap();
    assert_eq!(first, second);
    assert!(!first.is_empty());
}

#[tokio::test]
async fn request_resolves_exactly_once() {
    let server = SimHomeserver::new();
    let alice = Client::new(&SimEnv::new(), "alice");
    let request = alice.machine.outgoing_requests().await.unwrap().remove(0);
    let response = server.handle(&alice.user, &alice.device, &request).unwrap();

    alice.machine.mark_request_as_sent(&request.request_id, request.kind, &response).await.unwrap();
    let again = alice.machine.mark_request_as_sent(&request.request_id, request.kind, &response).await;
    assert!(matches!(again, Err(ClientError::UnknownRequest(id)) if id == request.request_id));

    let never = RequestId::try_from("never-issued").unwrap();
    let unknown = alice.machine.mark_request_as_sent(&never, RequestKind::KeysQuery, "{}").await;
    assert!(matches!(unknown, Err(ClientError::UnknownRequest(_))));
}

#[tokio::test]
async fn tracking_is_visible() {
    let (_server, clients) = start(&["alice", "bob"]).await;
    let (alice, bob) = (&clients[0], &clients[1]);

    assert!(!alice.machine.is_user_tracked(&bob.user).await.unwrap());
    alice.machine.update_tracked_users(&[bob.user.clone()]).await.unwrap();
    assert!(alice.machine.is_user_tracked(&bob.user).await.unwrap());
    assert!(alice.machine.tracked_users().await.unwrap().contains(&alice.user));
}

#[tokio::test]
async fn encrypt_requires_shared_session() {
    let (server, clients) = start(&["alice", "bob"]).await;
    let (alice, bob) = (&clients[0], &clients[1]);

    let before = alice.machine.encrypt(&room(), "m.room.message", &json!({ "body": "hi" })).await;
    assert!(matches!(before, Err(ClientError::MissingGroupSession(r)) if r == room()));

    alice.connect(&server, &[bob.user.clone()]).await;
    alice.share(&server, &room(), &[bob.user.clone()]).await;

    let after = alice.machine.encrypt(&room(), "m.room.message", &json!({ "body": "hi" })).await;
    assert_eq!(after.unwrap()["algorithm"], "m.megolm.v1.aes-sha2");
}

#[tokio::test]
async fn message_reaches_recipient_with_provenance() {
    let (server, clients) = start(&["alice", "bob"]).await;
    let (alice, bob) = (&clients[0], &clients[1]);

    alice.connect(&server, &[bob.user.clone()]).await;
    assert_eq!(alice.share(&server, &room(), &[bob.user.clone()]).await, 1);

    let processed = bob.sync(&server).await.unwrap();
    assert_eq!(processed.len(), 1);
    assert_eq!(processed[0]["type"], "m.room_key");

    let event = alice.send_message(&server, &room(), "hello bob").await;
    let decrypted = bob.machine.decrypt_room_event(&event).await.unwrap();

    assert_eq!(decrypted.event_type, "m.room.message");
    assert_eq!(decrypted.content["body"], "hello bob");
    assert_eq!(
        Some(decrypted.sender_curve25519_key.as_str()),
        alice.machine.identity_keys().get("curve25519:ALICE").map(String::as_str)
    );
    assert_eq!(
        decrypted.claimed_ed25519_key.as_deref(),
        alice.machine.identity_keys().get("ed25519:ALICE").map(String::as_str)
    );
    assert!(decrypted.forwarding_curve25519_key_chain.is_empty());
}

#[tokio::test]
async fn tampered_event_is_unable_to_decrypt() {
    let (server, clients) = start(&["alice"]).await;
    let alice = &clients[0];
    alice.share(&server, &room(), &[]).await;

    let mut event = alice.send_message(&server, &room(), "original").await;
    let ciphertext = event.content["ciphertext"].as_str().unwrap().to_string();
    let flipped = if ciphertext.ends_with('A') { 'B' } else { 'A' };
    let tampered = format!("{}{flipped}", &ciphertext[..ciphertext.len() - 1]);
    event.content["ciphertext"] = json!(tampered);

    let err = alice.machine.decrypt_room_event(&event).await.unwrap_err();
    assert!(reason(err).contains("m.megolm.v1.aes-sha2"));
}

#[tokio::test]
async fn replayed_event_is_unable_to_decrypt() {
    let (server, clients) = start(&["alice"]).await;
    let alice = &clients[0];
    alice.share(&server, &room(), &[]).await;

    let event = alice.send_message(&server, &room(), "once").await;
    alice.machine.decrypt_room_event(&event).await.unwrap();

    let mut replayed = event.clone();
    replayed.event_id = Some("$replayed".to_string());
    let err = alice.machine.decrypt_room_event(&replayed).await.unwrap_err();
    let reason = reason(err);
    assert!(reason.contains("m.megolm.v1.aes-sha2"));
    assert!(reason.contains("replayed"));
}

#[tokio::test]
async fn missing_room_key_is_unable_to_decrypt() {
    let (server, clients) = start(&["alice", "bob"]).await;
    let (alice, bob) = (&clients[0], &clients[1]);
    alice.share(&server, &room(), &[]).await;

    let event = alice.send_message(&server, &room(), "not for bob").await;
    let err = bob.machine.decrypt_room_event(&event).await.unwrap_err();
    assert!(matches!(&err, ClientError::UnableToDecrypt { .. }));
    assert!(reason(err).contains("unknown session"));
}

#[tokio::test]
async fn rotation_reaches_new_device() {
    let (server, clients) = start(&["alice", "bob", "carol"]).await;
    let (alice, bob, carol) = (&clients[0], &clients[1], &clients[2]);

    alice.connect(&server, &[bob.user.clone()]).await;
    assert_eq!(alice.share(&server, &room(), &[bob.user.clone()]).await, 1);
    assert_eq!(alice.share(&server, &room(), &[bob.user.clone()]).await, 0);

    alice.connect(&server, &[carol.user.clone()]).await;
    assert_eq!(alice.share(&server, &room(), &[bob.user.clone(), carol.user.clone()]).await, 1);

    carol.sync(&server).await.unwrap();
    let event = alice.send_message(&server, &room(), "welcome carol").await;
    assert!(carol.machine.decrypt_room_event(&event).await.is_ok());
}

#[tokio::test]
async fn invalidated_session_rotates() {
    let (server, clients) = start(&["alice", "bob"]).await;
    let (alice, bob) = (&clients[0], &clients[1]);
    alice.connect(&server, &[bob.user.clone()]).await;
    alice.share(&server, &room(), &[bob.user.clone()]).await;
    let before = alice.send_message(&server, &room(), "a").await;

    assert!(alice.machine.invalidate_group_session(&room()).await.unwrap());
    assert_eq!(alice.share(&server, &room(), &[bob.user.clone()]).await, 1);
    let after = alice.send_message(&server, &room(), "b").await;

    assert_ne!(before.content["session_id"], after.content["session_id"]);
}

#[tokio::test]
async fn blocked_device_gets_no_room_key() {
    let (server, clients) = start(&["alice", "bob"]).await;
    let (alice, bob) = (&clients[0], &clients[1]);
    alice.connect(&server, &[bob.user.clone()]).await;

    alice.machine.set_local_trust(&bob.user, &bob.device, LocalTrust::BlackListed).await.unwrap();
    let device = alice.machine.device(&bob.user, &bob.device).await.unwrap().unwrap();
    assert!(device.is_blocked);

    assert_eq!(alice.share(&server, &room(), &[bob.user.clone()]).await, 0);
}

#[tokio::test]
async fn sync_with_absent_parts_is_accepted() {
    let (_server, clients) = start(&["alice"]).await;
    let events = clients[0].machine.receive_sync_changes(SyncDelta::default()).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn store_fault_fails_sync_and_propagates() {
    let (server, clients) = start(&["alice"]).await;
    let alice = &clients[0];

    alice.faults.fail();
    assert!(matches!(alice.sync(&server).await, Err(ClientError::Store(_))));
    alice.faults.heal();
    assert!(alice.sync(&server).await.is_ok());
}

#[tokio::test]
async fn device_directory_reflects_queries() {
    let (server, clients) = start(&["alice", "bob", "carol"]).await;
    let (alice, bob, carol) = (&clients[0], &clients[1], &clients[2]);
    alice.machine.update_tracked_users(&[bob.user.clone(), carol.user.clone()]).await.unwrap();
    alice.flush(&server).await;

    let devices = alice
        .machine
        .devices_of_users(&[carol.user.clone(), bob.user.clone(), alice.user.clone()])
        .await
        .unwrap();
    let owners: Vec<&UserId> = devices.iter().map(|d| &d.user_id).collect();
    assert_eq!(owners, vec![&carol.user, &bob.user, &alice.user]);

    let own = alice.machine.device(&alice.user, &alice.device).await.unwrap().unwrap();
    assert!(own.is_locally_trusted);
    let remote = alice.machine.device(&bob.user, &bob.device).await.unwrap().unwrap();
    assert!(!remote.is_locally_trusted);
    assert!(remote.first_time_seen_ts.is_some());
}

#[tokio::test]
async fn clones_share_one_engine() {
    let (_server, clients) = start(&["alice", "bob"]).await;
    let (alice, bob) = (&clients[0], &clients[1]);

    let clone = alice.machine.clone();
    clone.update_tracked_users(&[bob.user.clone()]).await.unwrap();
    assert!(alice.machine.is_user_tracked(&bob.user).await.unwrap());
}

#[tokio::test]
async fn concurrent_calls_are_serialized() {
    let (_server, clients) = start(&["alice"]).await;
    let alice = &clients[0];

    let users: Vec<UserId> =
        (0..16).map(|n| UserId::try_from(format!("@user{n}:example.org")).unwrap()).collect();
    let handles: Vec<_> = users
        .iter()
        .cloned()
        .map(|user| {
            let machine = alice.machine.clone();
            tokio::spawn(async move { machine.update_tracked_users(&[user]).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let tracked = alice.machine.tracked_users().await.unwrap();
    assert!(users.iter().all(|user| tracked.contains(user)));
}
