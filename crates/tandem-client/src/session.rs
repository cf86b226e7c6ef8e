use tandem_common::SessionConfig;
use tandem_core::{NegotiationState, Negotiator};
use uuid::Uuid;

/// One call between the local and the remote peer.
///
/// Owned by the orchestrator for its whole lifetime; nothing else holds a
/// reference to the negotiation state.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    local_peer_id: String,
    remote_peer_id: String,
    relay_address: String,
    negotiator: Negotiator,
}

impl Session {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_peer_id: config.local_peer_id.clone(),
            remote_peer_id: config.remote_peer_id.clone(),
            relay_address: config.relay_address.clone(),
            negotiator: Negotiator::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    pub fn relay_address(&self) -> &str {
        &self.relay_address
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    pub(crate) fn negotiator_mut(&mut self) -> &mut Negotiator {
        &mut self.negotiator
    }
}
