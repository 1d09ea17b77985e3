//! Outstanding request bookkeeping.

use keyloom_core::{EngineError, Environment, OutgoingRequest, RequestId, RequestKind, UserId};

/// Engine-side context kept with an outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestContext {
    KeysUpload,
    KeysQuery { users: Vec<UserId> },
    KeysClaim,
    ToDevice,
}

struct Pending {
    request: OutgoingRequest,
    context: RequestContext,
    /// Listed by `outgoing_requests()`. Requests handed out directly by
    /// `share_room_key` and `get_missing_sessions` are not.
    listed: bool,
}

/// Unresolved requests in creation order.
#[derive(Default)]
pub(crate) struct PendingRequests {
    pending: Vec<Pending>,
}

impl PendingRequests {
    /// Create a request with a fresh correlation id.
    pub(crate) fn create<E: Environment>(
        &mut self,
        env: &E,
        kind: RequestKind,
        body: String,
        context: RequestContext,
        listed: bool,
    ) -> OutgoingRequest {
        let request_id = loop {
            let Ok(id) = RequestId::try_from(format!("{:032x}", env.random_u128())) else {
                unreachable!("hex ids are non-empty and contain no whitespace");
            };
            if !self.contains(&id) {
                break id;
            }
        };

        let request = OutgoingRequest { request_id, kind, body };
        tracing::debug!(request_id = %request.request_id, kind = %kind, "request created");
        self.pending.push(Pending { request: request.clone(), context, listed });
        request
    }

    pub(crate) fn contains(&self, request_id: &RequestId) -> bool {
        self.pending.iter().any(|p| &p.request.request_id == request_id)
    }

    pub(crate) fn has_pending(&self, kind: RequestKind) -> bool {
        self.pending.iter().any(|p| p.request.kind == kind)
    }

    /// Requests returned by `outgoing_requests()`.
    pub(crate) fn listed(&self) -> Vec<OutgoingRequest> {
        self.pending.iter().filter(|p| p.listed).map(|p| p.request.clone()).collect()
    }

    /// Remove a request, checking its kind.
    ///
    /// # Errors
    ///
    /// - `UnknownRequest`: not outstanding
    /// - `RequestKindMismatch`: resolved with another kind; the request stays
    ///   outstanding
    pub(crate) fn resolve(
        &mut self,
        request_id: &RequestId,
        kind: RequestKind,
    ) -> Result<RequestContext, EngineError> {
        let Some(position) = self.pending.iter().position(|p| &p.request.request_id == request_id)
        else {
            return Err(EngineError::UnknownRequest(request_id.clone()));
        };

        let expected = self.pending[position].request.kind;
        if expected != kind {
            return Err(EngineError::RequestKindMismatch {
                request_id: request_id.clone(),
                expected,
                found: kind,
            });
        }

        Ok(self.pending.remove(position).context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimEnv;

    #[test]
    fn resolve_once() {
        let env = SimEnv::new();
        let mut pending = PendingRequests::default();
        let request = pending.create(
            &env,
            RequestKind::KeysUpload,
            "{}".to_string(),
            RequestContext::KeysUpload,
            true,
        );

        assert_eq!(pending.listed(), vec![request.clone()]);
        assert_eq!(
            pending.resolve(&request.request_id, RequestKind::KeysUpload),
            Ok(RequestContext::KeysUpload)
        );
        assert_eq!(
            pending.resolve(&request.request_id, RequestKind::KeysUpload),
            Err(EngineError::UnknownRequest(request.request_id))
        );
    }

    #[test]
    fn kind_mismatch_keeps_request() {
        let env = SimEnv::new();
        let mut pending = PendingRequests::default();
        let request =
            pending.create(&env, RequestKind::ToDevice, "{}".to_string(), RequestContext::ToDevice, false);

        assert!(matches!(
            pending.resolve(&request.request_id, RequestKind::KeysQuery),
            Err(EngineError::RequestKindMismatch { .. })
        ));
        assert!(pending.contains(&request.request_id));
        assert!(pending.listed().is_empty());
    }
}
