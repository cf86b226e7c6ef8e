//! Tandem peer.
//!
//! Polls a node-dss relay for signaling messages, drives the offer/answer
//! negotiation against a [`tandem_media::MediaEngine`] and hands decoded
//! streams to a [`tandem_media::PipelineHost`].

#![forbid(unsafe_code)]

pub mod orchestrator;
pub mod session;
pub mod signaling;

pub use orchestrator::{Command, Orchestrator, OrchestratorHandle};
pub use session::Session;
pub use signaling::{NodeDssSignaler, Poller, SignalingTransport, TransportError};
