//! Session driver.
//!
//! A single task owns the [`Session`], the engine and the pipeline host. Relay
//! messages, engine events and local commands all arrive on channels and are
//! handled one at a time, so the negotiation state is never shared. Only the
//! frame bridges are touched from other threads.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use tandem_common::SessionConfig;
use tandem_core::{
    NegotiationAction, NegotiationEvent, NegotiationState, SdpKind, SignalingMessage,
};
use tandem_media::{
    ConnectionState, EngineCallbacks, EngineConfig, EngineError, EngineEvent, FrameBridge,
    MediaEngine, PipelineHost, Resolution, StreamFormat, StreamKind,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::session::Session;
use crate::signaling::{spawn_outbound, Poller, SignalingTransport, SEND_RETRY_DELAY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    CreateOffer,
    Close,
}

/// Control surface for a running orchestrator. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<NegotiationState>,
}

impl OrchestratorHandle {
    /// Ask the session to start a call. Returns false if the session is gone.
    pub fn create_offer(&self) -> bool {
        self.commands.send(Command::CreateOffer).is_ok()
    }

    /// Close the session. Safe to call any number of times, also after the
    /// session has ended on its own.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`, or return the state it ended in.
    pub async fn wait_for_state(&mut self, target: NegotiationState) -> NegotiationState {
        match self
            .state
            .wait_for(|s| *s == target || *s == NegotiationState::Closed)
            .await
        {
            Ok(state) => *state,
            Err(_) => NegotiationState::Closed,
        }
    }
}

pub struct Orchestrator<E: MediaEngine, H: PipelineHost> {
    config: SessionConfig,
    session: Option<Session>,
    engine: Option<E>,
    host: H,
    transport: Arc<dyn SignalingTransport>,
    local_bridge: Arc<FrameBridge>,
    remote_bridge: Arc<FrameBridge>,
    poller: Option<Poller>,
    outbound: Option<mpsc::UnboundedSender<SignalingMessage>>,
    commands: mpsc::UnboundedReceiver<Command>,
    engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    signal_tx: mpsc::UnboundedSender<SignalingMessage>,
    signal_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    state_tx: watch::Sender<NegotiationState>,
    announced_connected: bool,
}

impl<E: MediaEngine, H: PipelineHost> Orchestrator<E, H> {
    /// Validate `config`, build the engine through `make_engine` and prepare a
    /// session. Nothing touches the relay until [`Orchestrator::run`].
    pub fn new<F>(
        config: SessionConfig,
        transport: Arc<dyn SignalingTransport>,
        make_engine: F,
        host: H,
    ) -> Result<(Self, OrchestratorHandle)>
    where
        F: FnOnce(EngineCallbacks, EngineConfig) -> Result<E, EngineError>,
    {
        let config = config.validate().context("invalid session config")?;

        let local_bridge = Arc::new(FrameBridge::new(StreamKind::Local));
        let remote_bridge = Arc::new(FrameBridge::new(StreamKind::Remote));
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let callbacks =
            EngineCallbacks::new(engine_tx, local_bridge.clone(), remote_bridge.clone());
        let engine = make_engine(
            callbacks,
            EngineConfig {
                ice_servers: config.ice_servers.clone(),
                framerate: config.framerate,
            },
        )
        .context("failed to start media engine")?;

        let session = Session::new(&config);
        info!(
            "session {} created: {} -> {} via {}",
            session.id(),
            session.local_peer_id(),
            session.remote_peer_id(),
            session.relay_address()
        );

        let (command_tx, commands) = mpsc::unbounded_channel();
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(session.state());

        let orchestrator = Self {
            config,
            session: Some(session),
            engine: Some(engine),
            host,
            transport,
            local_bridge,
            remote_bridge,
            poller: None,
            outbound: None,
            commands,
            engine_rx,
            signal_tx,
            signal_rx,
            state_tx,
            announced_connected: false,
        };
        let handle = OrchestratorHandle {
            commands: command_tx,
            state: state_rx,
        };
        Ok((orchestrator, handle))
    }

    pub fn state(&self) -> NegotiationState {
        self.session
            .as_ref()
            .map_or(NegotiationState::Closed, Session::state)
    }

    pub fn local_bridge(&self) -> &Arc<FrameBridge> {
        &self.local_bridge
    }

    pub fn remote_bridge(&self) -> &Arc<FrameBridge> {
        &self.remote_bridge
    }

    /// Drive the session until it closes, then tear everything down.
    pub async fn run(mut self) {
        self.start_signaling();

        while !self.is_closed() {
            tokio::select! {
                Some(command) = self.commands.recv() => self.on_command(command),
                Some(event) = self.engine_rx.recv() => self.on_engine_event(event),
                Some(message) = self.signal_rx.recv() => self.on_signal(message),
                else => break,
            }
        }

        self.shutdown();
    }

    fn is_closed(&self) -> bool {
        self.session.as_ref().map_or(true, |s| s.state() == NegotiationState::Closed)
    }

    fn start_signaling(&mut self) {
        if self.poller.is_some() || self.session.is_none() {
            return;
        }
        let (outbound, _sender_task) = spawn_outbound(
            self.transport.clone(),
            self.config.send_retry_limit,
            SEND_RETRY_DELAY,
        );
        self.outbound = Some(outbound);
        self.poller = Some(Poller::spawn(
            self.transport.clone(),
            self.config.poll_interval,
            self.signal_tx.clone(),
        ));
        debug!("polling relay every {:?}", self.config.poll_interval);
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::CreateOffer => self.dispatch(NegotiationEvent::CreateOffer),
            Command::Close => self.close(),
        }
    }

    fn on_signal(&mut self, message: SignalingMessage) {
        let kind = message.kind;
        match NegotiationEvent::from_remote(message) {
            Ok(event) => self.dispatch(event),
            Err(err) => warn!("dropping malformed {} message: {}", kind, err),
        }
    }

    fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalDescription { kind, sdp } => {
                self.dispatch(NegotiationEvent::LocalDescription { kind, sdp })
            }
            EngineEvent::LocalCandidate(candidate) => {
                self.dispatch(NegotiationEvent::LocalCandidate(candidate))
            }
            EngineEvent::ConnectionStateChanged(state) => self.on_connection_state(state),
            EngineEvent::FirstFrame { stream, resolution } => {
                self.on_first_frame(stream, resolution)
            }
        }
    }

    fn on_connection_state(&mut self, state: ConnectionState) {
        if self.is_closed() {
            debug!("engine state {} after close", state);
            return;
        }
        if state.is_connected() {
            if !self.announced_connected {
                self.announced_connected = true;
                info!("peer connection established");
            }
            return;
        }
        info!("peer connection state: {}", state);
        if state.is_failure() {
            self.dispatch(NegotiationEvent::ConnectionFailed);
        }
    }

    fn on_first_frame(&mut self, stream: StreamKind, resolution: Resolution) {
        if self.is_closed() {
            return;
        }
        let format = match StreamFormat::from_resolution(resolution, self.config.framerate) {
            Ok(format) => format,
            Err(err) => {
                warn!("cannot configure {} stream: {}", stream, err);
                return;
            }
        };
        info!(
            "first {} frame: {} at {} fps, {} bps",
            stream, resolution, format.framerate, format.bitrate
        );
        let bridge = match stream {
            StreamKind::Local => self.local_bridge.clone(),
            StreamKind::Remote => self.remote_bridge.clone(),
        };
        self.host.stream_ready(stream, format, bridge);
    }

    /// Feed one event through the state machine and carry out every action,
    /// including the follow-up events produced by the engine's answers.
    fn dispatch(&mut self, event: NegotiationEvent) {
        let mut events = VecDeque::from([event]);
        while let Some(event) = events.pop_front() {
            let Some(session) = self.session.as_mut() else {
                debug!("no session, ignoring {:?}", event);
                return;
            };
            let actions = session.negotiator_mut().handle(event);
            for action in actions {
                if let Some(follow_up) = self.execute(action) {
                    events.push_back(follow_up);
                }
            }
        }
        self.publish_state();
    }

    fn execute(&mut self, action: NegotiationAction) -> Option<NegotiationEvent> {
        match action {
            NegotiationAction::CreateOffer => {
                let engine = self.engine.as_mut()?;
                let err = engine.create_offer().err()?;
                error!("engine failed to create offer: {}", err);
                Some(NegotiationEvent::LocalDescriptionFailed {
                    kind: SdpKind::Offer,
                    reason: err.to_string(),
                })
            }
            NegotiationAction::CreateAnswer => {
                let engine = self.engine.as_mut()?;
                let err = engine.create_answer().err()?;
                error!("engine failed to create answer: {}", err);
                Some(NegotiationEvent::LocalDescriptionFailed {
                    kind: SdpKind::Answer,
                    reason: err.to_string(),
                })
            }
            NegotiationAction::SetRemoteDescription { kind, sdp } => {
                let engine = self.engine.as_mut()?;
                match engine.set_remote_description(kind, &sdp) {
                    Ok(()) => Some(NegotiationEvent::RemoteDescriptionApplied),
                    Err(err) => {
                        warn!("engine rejected remote {}: {}", kind, err);
                        Some(NegotiationEvent::RemoteDescriptionRejected(err.to_string()))
                    }
                }
            }
            NegotiationAction::AddIceCandidate(candidate) => {
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(err) = engine.add_ice_candidate(&candidate) {
                        warn!(
                            "engine rejected remote candidate {:?}: {}",
                            candidate.candidate(),
                            err
                        );
                    }
                }
                None
            }
            NegotiationAction::Send(message) => {
                match self.outbound.as_ref() {
                    Some(outbound) if outbound.send(message.clone()).is_ok() => {}
                    _ => warn!("signaling is not running, dropping outbound {}", message.kind),
                }
                None
            }
            NegotiationAction::ReleaseEngine => {
                self.release_engine();
                None
            }
            NegotiationAction::StopTransport => {
                self.stop_signaling();
                None
            }
        }
    }

    fn publish_state(&self) {
        let state = self.state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    fn stop_signaling(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }
        // Dropping the sender lets the outbound task finish what is queued.
        self.outbound = None;
    }

    fn release_engine(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.close();
        }
    }

    /// Explicit close or suspend.
    pub fn close(&mut self) {
        if self.session.is_none() {
            return;
        }
        self.dispatch(NegotiationEvent::Close);
        self.shutdown();
    }

    /// Stop polling, release the engine, detach both render consumers and drop
    /// the session. Every step is skipped if it already happened.
    fn shutdown(&mut self) {
        self.stop_signaling();
        self.release_engine();

        for bridge in [&self.local_bridge, &self.remote_bridge] {
            if bridge.is_detached() {
                continue;
            }
            bridge.detach();
            let stats = bridge.stats();
            info!(
                stream = %bridge.kind(),
                pushed = stats.pushed,
                pulled = stats.pulled,
                dropped = stats.dropped,
                "bridge detached"
            );
            self.host.stream_detached(bridge.kind());
        }

        if let Some(session) = self.session.take() {
            info!("session {} closed", session.id());
        }
        let _ = self.state_tx.send(NegotiationState::Closed);
    }
}

impl<E: MediaEngine, H: PipelineHost> Drop for Orchestrator<E, H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
