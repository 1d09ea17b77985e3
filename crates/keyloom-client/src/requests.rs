//! Outgoing request pipeline.
//!
//! The engine queues protocol work as [`OutgoingRequest`]s. The caller sends
//! each one and reports the response with the same correlation id; until then
//! the request keeps reappearing in [`Machine::outgoing_requests`].

use keyloom_core::{
    CryptoEngine, EngineError, OutgoingRequest, RequestId, RequestKind, RoomId, UserId,
};

use crate::{directory::refresh_subscriptions, error::ClientError, machine::Machine};

/// Whether resolving a request of `kind` may have changed device lists.
pub(crate) fn refreshes_devices(kind: RequestKind) -> bool {
    kind == RequestKind::KeysQuery
}

impl<E: CryptoEngine> Machine<E> {
    /// Snapshot of the requests waiting to be sent.
    ///
    /// Nothing is marked in flight; calling again before resolving returns the
    /// same requests.
    pub async fn outgoing_requests(&self) -> Result<Vec<OutgoingRequest>, ClientError> {
        let requests = self.queue.run(|engine| engine.outgoing_requests()).await??;
        tracing::debug!(count = requests.len(), "outgoing requests");
        Ok(requests)
    }

    /// Report the server's response to a request.
    ///
    /// Resolving a keys query pushes fresh device lists to every registered
    /// subscription before this returns.
    ///
    /// # Errors
    ///
    /// - `UnknownRequest`: the id is not outstanding, including when it was
    ///   already resolved
    /// - `Store`: the engine store failed
    pub async fn mark_request_as_sent(
        &self,
        request_id: &RequestId,
        kind: RequestKind,
        response_body: &str,
    ) -> Result<(), ClientError> {
        let (id, body) = (request_id.clone(), response_body.to_string());
        let (own, observers) = (self.identity.clone(), self.observers.clone());
        self.queue
            .run(move |engine| {
                engine.mark_request_as_sent(&id, kind, &body)?;
                if refreshes_devices(kind) {
                    refresh_subscriptions(engine, &own, &observers, None)?;
                }
                Ok::<_, EngineError>(())
            })
            .await??;

        tracing::debug!(%request_id, %kind, "request marked as sent");
        Ok(())
    }

    /// A keys-claim request for devices of `users` without a pairwise session.
    pub async fn get_missing_sessions(
        &self,
        users: &[UserId],
    ) -> Result<Option<OutgoingRequest>, ClientError> {
        let users = users.to_vec();
        Ok(self.queue.run(move |engine| engine.get_missing_sessions(&users)).await??)
    }

    /// Establish or rotate the room's group session so `users` can decrypt it.
    ///
    /// Returns the to-device requests carrying the room key; empty when every
    /// device already has the current session.
    pub async fn share_room_key(
        &self,
        room_id: &RoomId,
        users: &[UserId],
    ) -> Result<Vec<OutgoingRequest>, ClientError> {
        let (room, users) = (room_id.clone(), users.to_vec());
        let requests = self.queue.run(move |engine| engine.share_room_key(&room, &users)).await??;

        tracing::info!(%room_id, requests = requests.len(), "room key shared");
        Ok(requests)
    }

    /// Discard the room's outbound session so the next share rotates it.
    ///
    /// Returns whether a session existed.
    pub async fn invalidate_group_session(&self, room_id: &RoomId) -> Result<bool, ClientError> {
        let room = room_id.clone();
        let existed = self.queue.run(move |engine| engine.invalidate_group_session(&room)).await??;

        if existed {
            tracing::info!(%room_id, "group session invalidated");
        }
        Ok(existed)
    }
}
