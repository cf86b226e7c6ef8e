//! Seam between Tandem and the media engine that owns the actual peer connection.
//!
//! The engine is driven through [`MediaEngine`] from the orchestrator and
//! reports back through [`EngineCallbacks`], which may be cloned into any
//! number of engine threads. Control events travel over a channel to the
//! orchestrator; frames go straight into the bridges.

use std::fmt;
use std::sync::Arc;

use tandem_core::{IceCandidateDescriptor, SdpKind};
use tokio::sync::mpsc;
use tracing::debug;

use crate::bridge::FrameBridge;
use crate::{Frame, Resolution, StreamKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("engine rejected request: {0}")]
    Rejected(String),
    #[error("operation not valid in current engine state: {0}")]
    InvalidState(String),
    #[error("engine is closed")]
    Closed,
    #[error("engine failure: {0}")]
    Internal(String),
}

/// Peer connection state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the session cannot carry media any more.
    pub fn is_failure(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Closed)
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Completed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::New => "new",
            ConnectionState::Checking => "checking",
            ConnectionState::Connected => "connected",
            ConnectionState::Completed => "completed",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Parameters handed to an engine at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub ice_servers: Vec<String>,
    pub framerate: u32,
}

/// Operations the orchestrator performs on the engine.
///
/// Calls only start work; results arrive asynchronously through
/// [`EngineCallbacks`]. `set_remote_description` is the exception: its result
/// tells the caller whether the description was accepted.
pub trait MediaEngine: Send {
    fn create_offer(&mut self) -> Result<(), EngineError>;
    fn create_answer(&mut self) -> Result<(), EngineError>;
    fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), EngineError>;
    fn add_ice_candidate(&mut self, candidate: &IceCandidateDescriptor) -> Result<(), EngineError>;
    /// Release the peer connection and stop all engine threads. Must be idempotent.
    fn close(&mut self);
}

impl<E: MediaEngine + ?Sized> MediaEngine for Box<E> {
    fn create_offer(&mut self) -> Result<(), EngineError> {
        (**self).create_offer()
    }

    fn create_answer(&mut self) -> Result<(), EngineError> {
        (**self).create_answer()
    }

    fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), EngineError> {
        (**self).set_remote_description(kind, sdp)
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidateDescriptor) -> Result<(), EngineError> {
        (**self).add_ice_candidate(candidate)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Control events forwarded from engine threads to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    LocalDescription { kind: SdpKind, sdp: String },
    LocalCandidate(IceCandidateDescriptor),
    ConnectionStateChanged(ConnectionState),
    /// First frame accepted by a bridge.
    FirstFrame {
        stream: StreamKind,
        resolution: Resolution,
    },
}

/// Callback surface given to the engine. Every method is safe to call from any thread.
#[derive(Debug, Clone)]
pub struct EngineCallbacks {
    tx: mpsc::UnboundedSender<EngineEvent>,
    local: Arc<FrameBridge>,
    remote: Arc<FrameBridge>,
}

impl EngineCallbacks {
    pub fn new(
        tx: mpsc::UnboundedSender<EngineEvent>,
        local: Arc<FrameBridge>,
        remote: Arc<FrameBridge>,
    ) -> Self {
        Self { tx, local, remote }
    }

    fn emit(&self, event: EngineEvent) {
        // The receiver goes away with the session; late callbacks are expected.
        if self.tx.send(event).is_err() {
            debug!("engine event dropped, session is gone");
        }
    }

    pub fn local_sdp_ready(&self, kind: SdpKind, sdp: impl Into<String>) {
        self.emit(EngineEvent::LocalDescription {
            kind,
            sdp: sdp.into(),
        });
    }

    pub fn local_ice_ready(&self, candidate: &str, sdp_mline_index: u32, sdp_mid: &str) {
        self.emit(EngineEvent::LocalCandidate(IceCandidateDescriptor::new(
            candidate,
            sdp_mline_index,
            sdp_mid,
        )));
    }

    pub fn local_frame_ready(&self, frame: Frame) {
        self.push(&self.local, frame);
    }

    pub fn remote_frame_ready(&self, frame: Frame) {
        self.push(&self.remote, frame);
    }

    pub fn connection_state_changed(&self, state: ConnectionState) {
        self.emit(EngineEvent::ConnectionStateChanged(state));
    }

    fn push(&self, bridge: &FrameBridge, frame: Frame) {
        if let Some(resolution) = bridge.push(frame).first_frame {
            self.emit(EngineEvent::FirstFrame {
                stream: bridge.kind(),
                resolution,
            });
        }
    }
}
