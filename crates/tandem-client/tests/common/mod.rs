#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tandem_client::{SignalingTransport, TransportError};
use tandem_core::{IceCandidateDescriptor, SdpKind, SignalingMessage};
use tandem_media::{
    EngineCallbacks, EngineError, FrameBridge, MediaEngine, PipelineHost, StreamFormat,
    StreamKind,
};

/// In-process stand-in for a node-dss relay. Stores JSON frames, like the real one.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    mailboxes: Arc<Mutex<HashMap<String, VecDeque<String>>>>,
}

impl MemoryRelay {
    pub fn post_raw(&self, peer_id: &str, body: impl Into<String>) {
        self.mailboxes
            .lock()
            .unwrap()
            .entry(peer_id.to_string())
            .or_default()
            .push_back(body.into());
    }

    pub fn post(&self, peer_id: &str, message: &SignalingMessage) {
        self.post_raw(peer_id, message.to_json().unwrap());
    }

    pub fn take_all(&self, peer_id: &str) -> Vec<SignalingMessage> {
        self.mailboxes
            .lock()
            .unwrap()
            .remove(peer_id)
            .unwrap_or_default()
            .into_iter()
            .map(|body| SignalingMessage::from_json(&body).unwrap())
            .collect()
    }

    pub fn transport(&self, local: &str, remote: &str) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            relay: self.clone(),
            local: local.to_string(),
            remote: remote.to_string(),
        })
    }
}

pub struct MemoryTransport {
    relay: MemoryRelay,
    local: String,
    remote: String,
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    async fn poll(&self) -> Result<Vec<SignalingMessage>, TransportError> {
        let bodies: Vec<String> = self
            .relay
            .mailboxes
            .lock()
            .unwrap()
            .remove(&self.local)
            .map(Vec::from)
            .unwrap_or_default();
        Ok(bodies
            .iter()
            .filter_map(|body| SignalingMessage::from_json(body).ok())
            .collect())
    }

    async fn send(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        self.relay.post_raw(&self.remote, message.to_json()?);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    Close,
}

/// Engine that records every call and answers with canned descriptions.
#[derive(Clone)]
pub struct RecordingEngine {
    pub calls: Arc<Mutex<Vec<EngineCall>>>,
    callbacks: EngineCallbacks,
    offer_failures: Arc<AtomicU32>,
}

impl RecordingEngine {
    pub fn new(callbacks: EngineCallbacks, calls: Arc<Mutex<Vec<EngineCall>>>) -> Self {
        Self {
            calls,
            callbacks,
            offer_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `count` offer requests fail.
    pub fn failing_offers(self, count: u32) -> Self {
        self.offer_failures.store(count, Ordering::SeqCst);
        self
    }

    fn record(&self, call: EngineCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn has_remote(&self) -> bool {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| matches!(c, EngineCall::SetRemote(_)))
    }
}

impl MediaEngine for RecordingEngine {
    fn create_offer(&mut self) -> Result<(), EngineError> {
        self.record(EngineCall::CreateOffer);
        if self
            .offer_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::InvalidState("encoder not ready".into()));
        }
        self.callbacks.local_sdp_ready(SdpKind::Offer, "v=0 recorded offer");
        Ok(())
    }

    fn create_answer(&mut self) -> Result<(), EngineError> {
        self.record(EngineCall::CreateAnswer);
        self.callbacks.local_sdp_ready(SdpKind::Answer, "v=0 recorded answer");
        Ok(())
    }

    fn set_remote_description(&mut self, kind: SdpKind, _sdp: &str) -> Result<(), EngineError> {
        self.record(EngineCall::SetRemote(kind));
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidateDescriptor) -> Result<(), EngineError> {
        if !self.has_remote() {
            return Err(EngineError::Rejected("no remote description".into()));
        }
        self.record(EngineCall::AddCandidate(candidate.candidate().to_string()));
        Ok(())
    }

    fn close(&mut self) {
        self.record(EngineCall::Close);
    }
}

/// Pipeline host that only remembers what it was told.
#[derive(Clone, Default)]
pub struct RecordingHost {
    pub ready: Arc<Mutex<Vec<(StreamKind, StreamFormat)>>>,
    pub detached: Arc<Mutex<Vec<StreamKind>>>,
}

impl RecordingHost {
    pub fn is_ready(&self, kind: StreamKind) -> bool {
        self.ready.lock().unwrap().iter().any(|(k, _)| *k == kind)
    }
}

impl PipelineHost for RecordingHost {
    fn stream_ready(&mut self, kind: StreamKind, format: StreamFormat, _bridge: Arc<FrameBridge>) {
        self.ready.lock().unwrap().push((kind, format));
    }

    fn stream_detached(&mut self, kind: StreamKind) {
        self.detached.lock().unwrap().push(kind);
    }
}

pub fn candidate_message(name: &str) -> SignalingMessage {
    SignalingMessage::ice_candidate(&IceCandidateDescriptor::new(
        format!("candidate:{name} 1 udp 2122260223 192.168.1.2 5000 typ host"),
        0,
        "0",
    ))
    .unwrap()
}

pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
