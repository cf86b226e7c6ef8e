//! Offer/answer negotiation state machine.
//!
//! The machine never talks to the media engine or the relay itself. Each
//! [`NegotiationEvent`] moves it to a new [`NegotiationState`] and yields the
//! [`NegotiationAction`]s the owner has to perform, in order.
//!
//! Remote candidates that arrive before a remote description has been applied
//! are held in a FIFO queue and released, in arrival order, by
//! [`NegotiationEvent::RemoteDescriptionApplied`].

use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, info, warn};

use crate::message::{IceCandidateDescriptor, MessageKind, SdpKind, SignalingMessage};
use crate::CodecError;

/// How many times the engine is asked for an answer before the remote offer
/// is abandoned.
pub const MAX_ANSWER_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// No description exchanged yet.
    Idle,
    /// Local offer requested or sent; waiting for the remote answer.
    HaveLocalOffer,
    /// Remote offer received; local answer pending.
    HaveRemoteOffer,
    /// Local answer produced. Part of the state vocabulary shared with engines;
    /// this machine moves straight to `Connected` once the answer is sent.
    HaveLocalAnswer,
    /// Both descriptions exchanged; connectivity checks run in the engine.
    Connected,
    /// Terminal.
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::HaveLocalOffer => "have-local-offer",
            NegotiationState::HaveRemoteOffer => "have-remote-offer",
            NegotiationState::HaveLocalAnswer => "have-local-answer",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// The local user asked to start a call.
    CreateOffer,
    /// An offer arrived from the remote peer.
    RemoteOffer(String),
    /// An answer arrived from the remote peer.
    RemoteAnswer(String),
    /// A candidate arrived from the remote peer.
    RemoteCandidate(IceCandidateDescriptor),
    /// The engine finished producing a local description.
    LocalDescription { kind: SdpKind, sdp: String },
    /// The engine could not produce the requested local description.
    LocalDescriptionFailed { kind: SdpKind, reason: String },
    /// The engine gathered a local candidate.
    LocalCandidate(IceCandidateDescriptor),
    /// The engine accepted the last requested remote description.
    RemoteDescriptionApplied,
    /// The engine refused the last requested remote description.
    RemoteDescriptionRejected(String),
    /// The engine reported ICE or connection failure.
    ConnectionFailed,
    /// Explicit close or suspend.
    Close,
}

impl NegotiationEvent {
    /// Convert an inbound relay message into an event.
    pub fn from_remote(message: SignalingMessage) -> Result<Self, CodecError> {
        match message.kind {
            MessageKind::Offer => Ok(NegotiationEvent::RemoteOffer(message.payload)),
            MessageKind::Answer => Ok(NegotiationEvent::RemoteAnswer(message.payload)),
            MessageKind::IceCandidate => {
                Ok(NegotiationEvent::RemoteCandidate(message.to_candidate()?))
            }
        }
    }
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationAction {
    CreateOffer,
    CreateAnswer,
    SetRemoteDescription { kind: SdpKind, sdp: String },
    AddIceCandidate(IceCandidateDescriptor),
    Send(SignalingMessage),
    ReleaseEngine,
    StopTransport,
}

/// A remote description handed to the engine and not yet confirmed.
#[derive(Debug, Clone, Copy)]
struct PendingRemote {
    kind: SdpKind,
    revert_to: NegotiationState,
}

#[derive(Debug)]
pub struct Negotiator {
    state: NegotiationState,
    remote_description_set: bool,
    pending_remote: Option<PendingRemote>,
    pending_candidates: VecDeque<IceCandidateDescriptor>,
    answer_attempts: u32,
}

impl Default for Negotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator {
    pub fn new() -> Self {
        Self {
            state: NegotiationState::Idle,
            remote_description_set: false,
            pending_remote: None,
            pending_candidates: VecDeque::new(),
            answer_attempts: 0,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    /// Number of remote candidates waiting for a remote description.
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    /// Apply one event and return the actions to perform, in order.
    pub fn handle(&mut self, event: NegotiationEvent) -> Vec<NegotiationAction> {
        let before = self.state;
        let actions = self.transition(event);
        if self.state != before {
            info!("negotiation {} -> {}", before, self.state);
        }
        actions
    }

    fn transition(&mut self, event: NegotiationEvent) -> Vec<NegotiationAction> {
        use NegotiationAction as A;
        use NegotiationState as S;

        match (self.state, event) {
            (S::Closed, NegotiationEvent::Close) => Vec::new(),
            (_, NegotiationEvent::Close) => {
                self.state = S::Closed;
                self.pending_remote = None;
                let dropped = self.pending_candidates.len();
                self.pending_candidates.clear();
                if dropped > 0 {
                    debug!("discarding {} queued remote candidates on close", dropped);
                }
                vec![A::ReleaseEngine, A::StopTransport]
            }
            (S::Closed, event) => {
                debug!("ignoring {} after close", event_name(&event));
                Vec::new()
            }

            (S::Idle, NegotiationEvent::CreateOffer) => {
                self.state = S::HaveLocalOffer;
                vec![A::CreateOffer]
            }
            (S::Idle, NegotiationEvent::RemoteOffer(sdp)) => {
                self.state = S::HaveRemoteOffer;
                self.answer_attempts = 0;
                self.pending_remote = Some(PendingRemote {
                    kind: SdpKind::Offer,
                    revert_to: S::Idle,
                });
                vec![A::SetRemoteDescription {
                    kind: SdpKind::Offer,
                    sdp,
                }]
            }
            (S::HaveLocalOffer, NegotiationEvent::RemoteAnswer(sdp)) => {
                self.state = S::Connected;
                self.pending_remote = Some(PendingRemote {
                    kind: SdpKind::Answer,
                    revert_to: S::HaveLocalOffer,
                });
                vec![A::SetRemoteDescription {
                    kind: SdpKind::Answer,
                    sdp,
                }]
            }
            (
                S::HaveLocalOffer,
                NegotiationEvent::LocalDescription {
                    kind: SdpKind::Offer,
                    sdp,
                },
            ) => vec![A::Send(SignalingMessage::description(SdpKind::Offer, sdp))],
            (
                S::HaveRemoteOffer,
                NegotiationEvent::LocalDescription {
                    kind: SdpKind::Answer,
                    sdp,
                },
            ) => {
                self.state = S::Connected;
                vec![A::Send(SignalingMessage::description(SdpKind::Answer, sdp))]
            }

            (
                S::HaveLocalOffer,
                NegotiationEvent::LocalDescriptionFailed {
                    kind: SdpKind::Offer,
                    reason,
                },
            ) => {
                warn!("engine could not create an offer: {}", reason);
                self.state = S::Idle;
                Vec::new()
            }
            (
                S::HaveRemoteOffer,
                NegotiationEvent::LocalDescriptionFailed {
                    kind: SdpKind::Answer,
                    reason,
                },
            ) => self.on_answer_failed(reason),

            (_, NegotiationEvent::RemoteCandidate(candidate)) => {
                if self.remote_description_set {
                    vec![A::AddIceCandidate(candidate)]
                } else {
                    self.pending_candidates.push_back(candidate);
                    debug!(
                        "queued remote candidate until remote description is applied ({} pending)",
                        self.pending_candidates.len()
                    );
                    Vec::new()
                }
            }
            (_, NegotiationEvent::LocalCandidate(candidate)) => {
                match SignalingMessage::ice_candidate(&candidate) {
                    Ok(message) => vec![A::Send(message)],
                    Err(e) => {
                        warn!("dropping local candidate that cannot be encoded: {}", e);
                        Vec::new()
                    }
                }
            }

            (_, NegotiationEvent::RemoteDescriptionApplied) => self.on_remote_applied(),
            (_, NegotiationEvent::RemoteDescriptionRejected(reason)) => {
                match self.pending_remote.take() {
                    Some(pending) => {
                        warn!(
                            "engine rejected remote {}: {}; staying negotiable",
                            pending.kind, reason
                        );
                        self.state = pending.revert_to;
                    }
                    None => warn!(
                        "engine rejected a remote description nobody asked for: {}",
                        reason
                    ),
                }
                Vec::new()
            }

            (S::Connected, NegotiationEvent::ConnectionFailed) => {
                warn!("connection failed");
                self.state = S::Closed;
                Vec::new()
            }

            (state, event) => {
                warn!("ignoring {} in state {}", event_name(&event), state);
                Vec::new()
            }
        }
    }

    fn on_answer_failed(&mut self, reason: String) -> Vec<NegotiationAction> {
        self.answer_attempts += 1;
        if self.answer_attempts < MAX_ANSWER_ATTEMPTS {
            warn!(
                "engine could not create an answer (attempt {}/{}): {}",
                self.answer_attempts, MAX_ANSWER_ATTEMPTS, reason
            );
            return vec![NegotiationAction::CreateAnswer];
        }
        warn!(
            "giving up on the remote offer after {} answer attempts: {}",
            self.answer_attempts, reason
        );
        self.answer_attempts = 0;
        self.state = NegotiationState::Idle;
        Vec::new()
    }

    fn on_remote_applied(&mut self) -> Vec<NegotiationAction> {
        let Some(pending) = self.pending_remote.take() else {
            warn!("remote description applied without a pending request");
            return Vec::new();
        };

        self.remote_description_set = true;
        let mut actions: Vec<NegotiationAction> = self
            .pending_candidates
            .drain(..)
            .map(NegotiationAction::AddIceCandidate)
            .collect();
        if !actions.is_empty() {
            debug!("flushing {} queued remote candidates", actions.len());
        }

        if pending.kind == SdpKind::Offer && self.state == NegotiationState::HaveRemoteOffer {
            actions.push(NegotiationAction::CreateAnswer);
        }
        actions
    }
}

fn event_name(event: &NegotiationEvent) -> &'static str {
    match event {
        NegotiationEvent::CreateOffer => "create-offer",
        NegotiationEvent::RemoteOffer(_) => "remote offer",
        NegotiationEvent::RemoteAnswer(_) => "remote answer",
        NegotiationEvent::RemoteCandidate(_) => "remote candidate",
        NegotiationEvent::LocalDescription {
            kind: SdpKind::Offer,
            ..
        } => "local offer",
        NegotiationEvent::LocalDescription {
            kind: SdpKind::Answer,
            ..
        } => "local answer",
        NegotiationEvent::LocalDescriptionFailed {
            kind: SdpKind::Offer,
            ..
        } => "local offer failure",
        NegotiationEvent::LocalDescriptionFailed {
            kind: SdpKind::Answer,
            ..
        } => "local answer failure",
        NegotiationEvent::LocalCandidate(_) => "local candidate",
        NegotiationEvent::RemoteDescriptionApplied => "remote-description-applied",
        NegotiationEvent::RemoteDescriptionRejected(_) => "remote-description-rejected",
        NegotiationEvent::ConnectionFailed => "connection-failed",
        NegotiationEvent::Close => "close",
    }
}
