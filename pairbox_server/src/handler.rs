//! Per-connection request dispatch
//!
//! A [`Dispatcher`] owns one registered endpoint. Each text frame is checked
//! against the endpoint's current status, then either answered, handed to the
//! pairing engine, or forwarded verbatim to the partner. Every recognized
//! request is followed by a count broadcast.

use crate::error::ClientRequestError;
use crate::pairing::{PairOutcome, Pairing, PairingError};
use crate::state::{Endpoint, RelayState, Status};
use pairbox_protocol::{ClientRequest, Role, ServerEvent};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The `paired` notice for one side, checked against its status at delivery time
fn paired_notice(role: Role, status: Status) -> ServerEvent {
    match (role, status) {
        (Role::Offer, Status::Offer) | (Role::Answer, Status::Answer) => {
            ServerEvent::Paired { role }
        }
        _ => ServerEvent::error("unnormal status"),
    }
}

/// Request handling for one connected endpoint
pub struct Dispatcher {
    state: RelayState,
    endpoint: Arc<Endpoint>,
}

impl Dispatcher {
    /// Register `endpoint` as `Ready` and start dispatching for it
    pub fn open(state: RelayState, endpoint: Arc<Endpoint>) -> Self {
        if !state.registry.register(Arc::clone(&endpoint)) {
            warn!(peer = %endpoint.id, "endpoint registered twice");
        }
        let _ = state.broadcast.publish();
        Self { state, endpoint }
    }

    /// The endpoint this dispatcher serves
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Handle one text frame.
    ///
    /// Returns the recognized request, or `None` if the frame was ignored.
    pub async fn handle_text(&self, text: &str) -> Option<ClientRequest> {
        let request = match text.parse::<ClientRequest>() {
            Ok(request) => request,
            Err(e) => {
                debug!(peer = %self.endpoint.id, error = %e, "ignoring frame");
                return None;
            }
        };
        debug!(peer = %self.endpoint.id, %request, "request");

        if let Err(e) = self.handle(request, text).await {
            debug!(peer = %self.endpoint.id, %request, error = %e, "rejected");
            self.reply(&ServerEvent::error(e)).await;
        }
        let _ = self.state.broadcast.publish();
        Some(request)
    }

    async fn handle(&self, request: ClientRequest, raw: &str) -> Result<(), ClientRequestError> {
        match request {
            ClientRequest::Connect => self.reply(&ServerEvent::Ok).await,
            ClientRequest::Pair => {
                self.pair().await?;
                self.reply(&ServerEvent::Ok).await;
            }
            ClientRequest::StopPair => {
                let _ = self.state.pairing.unpair(self.endpoint.id);
                self.reply(&ServerEvent::Ok).await;
            }
            ClientRequest::Offer | ClientRequest::Answer | ClientRequest::Candidate => {
                self.forward(request, raw).await?;
            }
        }
        Ok(())
    }

    async fn pair(&self) -> Result<(), ClientRequestError> {
        let action = ClientRequest::Pair.kind();
        let status = self.state.registry.status(self.endpoint.id);
        if status != Status::Ready {
            return Err(ClientRequestError::InvalidState { action, status });
        }
        match self.state.pairing.attempt_pair(self.endpoint.id) {
            Ok(PairOutcome::Paired(pairing)) => self.notify_paired(&pairing).await,
            Ok(PairOutcome::NoPartner) => {}
            Err(PairingError::InvalidState(status)) => {
                return Err(ClientRequestError::InvalidState { action, status });
            }
        }
        Ok(())
    }

    async fn notify_paired(&self, pairing: &Pairing) {
        for (endpoint, role) in pairing.sides() {
            let notice = paired_notice(role, self.state.registry.status(endpoint.id));
            if let Err(e) = endpoint.push_event(&notice).await {
                warn!(peer = %endpoint.id, error = %e, "evicting endpoint, paired notice undeliverable");
                endpoint.evict();
            }
        }
    }

    async fn forward(&self, request: ClientRequest, raw: &str) -> Result<(), ClientRequestError> {
        let action = request.kind();
        let view = self.state.registry.view(self.endpoint.id);
        let allowed = match request {
            ClientRequest::Offer => view.status == Status::Offer,
            ClientRequest::Answer => view.status == Status::Answer,
            _ => matches!(view.status, Status::Offer | Status::Answer),
        };
        if !allowed {
            return Err(ClientRequestError::InvalidState {
                action,
                status: view.status,
            });
        }
        let Some(partner) = view.partner else {
            return Err(ClientRequestError::NoPartner { action });
        };
        if let Err(e) = partner.push(raw.into()).await {
            warn!(peer = %partner.id, %request, error = %e, "evicting endpoint, payload undeliverable");
            partner.evict();
        }
        Ok(())
    }

    async fn reply(&self, event: &ServerEvent) {
        if let Err(e) = self.endpoint.push_event(event).await {
            debug!(peer = %self.endpoint.id, error = %e, "reply undeliverable, closing");
            self.endpoint.evict();
        }
    }

    /// Tear down after the transport closed.
    ///
    /// The partner is returned to `Ready` in the same step that removes this
    /// endpoint, so it is never left paired to a closed endpoint.
    pub fn close(self) {
        let id = self.endpoint.id;
        let _ = self.state.pairing.disconnect(id);
        self.endpoint.evict();
        info!(
            peer = %id,
            dropped_updates = self.endpoint.dropped_updates(),
            "closed"
        );
        let _ = self.state.broadcast.publish();
    }
}
