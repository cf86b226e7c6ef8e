//! Stand-in media engine producing synthetic descriptions, host candidates and
//! I420 test-pattern frames. Lets the client run end to end without a native
//! engine and gives tests an engine that enforces description ordering.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tandem_core::{IceCandidateDescriptor, SdpKind};
use tracing::{debug, info, warn};

use crate::engine::{ConnectionState, EngineCallbacks, EngineConfig, EngineError, MediaEngine};
use crate::{i420_len, Frame, Resolution, StreamKind};

pub const DEFAULT_SYNTHETIC_RESOLUTION: Resolution = Resolution {
    width: 320,
    height: 240,
};

const HOST_CANDIDATES: usize = 2;

pub struct SyntheticEngine {
    callbacks: EngineCallbacks,
    config: EngineConfig,
    resolution: Resolution,
    session_id: u64,
    local_description: Option<SdpKind>,
    remote_description: Option<SdpKind>,
    remote_resolution: Option<Resolution>,
    remote_candidates: usize,
    connected: bool,
    closed: bool,
    capture: Option<Generator>,
    playback: Option<Generator>,
}

impl SyntheticEngine {
    /// Create the engine and start local capture.
    pub fn new(callbacks: EngineCallbacks, config: EngineConfig) -> Result<Self, EngineError> {
        Self::with_resolution(callbacks, config, DEFAULT_SYNTHETIC_RESOLUTION)
    }

    pub fn with_resolution(
        callbacks: EngineCallbacks,
        config: EngineConfig,
        resolution: Resolution,
    ) -> Result<Self, EngineError> {
        if resolution.width == 0 || resolution.height == 0 {
            return Err(EngineError::InvalidState(format!(
                "capture resolution {resolution} is empty"
            )));
        }
        let capture = Generator::spawn(
            StreamKind::Local,
            resolution,
            config.framerate,
            callbacks.clone(),
        )?;
        info!(
            "synthetic engine capturing {} at {} fps, ice servers: {:?}",
            resolution, config.framerate, config.ice_servers
        );
        Ok(Self {
            callbacks,
            config,
            resolution,
            session_id: rand::thread_rng().gen(),
            local_description: None,
            remote_description: None,
            remote_resolution: None,
            remote_candidates: 0,
            connected: false,
            closed: false,
            capture: Some(capture),
            playback: None,
        })
    }

    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn describe(&self) -> String {
        let mut lines = vec![
            "v=0".to_string(),
            format!("o=- {} 2 IN IP4 127.0.0.1", self.session_id),
            "s=tandem".to_string(),
            "t=0 0".to_string(),
            "a=group:BUNDLE 0".to_string(),
            "m=video 9 UDP/TLS/RTP/SAVPF 96".to_string(),
            "c=IN IP4 0.0.0.0".to_string(),
            "a=mid:0".to_string(),
            "a=sendrecv".to_string(),
            "a=rtpmap:96 raw/90000".to_string(),
            format!(
                "a=fmtp:96 width={};height={};framerate={}",
                self.resolution.width, self.resolution.height, self.config.framerate
            ),
        ];
        lines.extend(self.config.ice_servers.iter().map(|s| format!("a=x-ice-server:{s}")));
        lines.push(String::new());
        lines.join("\r\n")
    }

    fn set_local(&mut self, kind: SdpKind) {
        let sdp = self.describe();
        self.local_description = Some(kind);
        self.callbacks.local_sdp_ready(kind, sdp);
        self.gather_candidates();
        self.maybe_connect();
    }

    fn gather_candidates(&self) {
        let mut rng = rand::thread_rng();
        for foundation in 1..=HOST_CANDIDATES {
            let port: u16 = rng.gen_range(49152..=65535);
            let priority = 2_122_260_223u32 - foundation as u32;
            let candidate =
                format!("candidate:{foundation} 1 udp {priority} 127.0.0.1 {port} typ host");
            self.callbacks.local_ice_ready(&candidate, 0, "0");
        }
    }

    fn maybe_connect(&mut self) {
        if self.connected
            || self.local_description.is_none()
            || self.remote_description.is_none()
            || self.remote_candidates == 0
        {
            return;
        }
        self.connected = true;
        self.callbacks.connection_state_changed(ConnectionState::Checking);
        self.callbacks.connection_state_changed(ConnectionState::Connected);

        let resolution = self.remote_resolution.unwrap_or(self.resolution);
        match Generator::spawn(
            StreamKind::Remote,
            resolution,
            self.config.framerate,
            self.callbacks.clone(),
        ) {
            Ok(playback) => self.playback = Some(playback),
            Err(err) => {
                warn!("synthetic playback failed to start: {}", err);
                self.callbacks.connection_state_changed(ConnectionState::Failed);
            }
        }
    }
}

impl MediaEngine for SyntheticEngine {
    fn create_offer(&mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.local_description.is_some() || self.remote_description.is_some() {
            return Err(EngineError::InvalidState(
                "offer requested after descriptions were exchanged".into(),
            ));
        }
        self.set_local(SdpKind::Offer);
        Ok(())
    }

    fn create_answer(&mut self) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.remote_description != Some(SdpKind::Offer) || self.local_description.is_some() {
            return Err(EngineError::InvalidState("answer requires a remote offer".into()));
        }
        self.set_local(SdpKind::Answer);
        Ok(())
    }

    fn set_remote_description(&mut self, kind: SdpKind, sdp: &str) -> Result<(), EngineError> {
        self.ensure_open()?;
        if !sdp.starts_with("v=0") {
            return Err(EngineError::Rejected("description is not SDP".into()));
        }
        if self.remote_description.is_some() {
            return Err(EngineError::InvalidState("remote description already set".into()));
        }
        match kind {
            SdpKind::Offer if self.local_description.is_some() => {
                return Err(EngineError::InvalidState("offer collides with local offer".into()));
            }
            SdpKind::Answer if self.local_description != Some(SdpKind::Offer) => {
                return Err(EngineError::InvalidState("answer without local offer".into()));
            }
            _ => {}
        }
        self.remote_description = Some(kind);
        self.remote_resolution = parse_resolution(sdp);
        debug!("synthetic engine applied remote {}", kind);
        self.maybe_connect();
        Ok(())
    }

    fn add_ice_candidate(&mut self, candidate: &IceCandidateDescriptor) -> Result<(), EngineError> {
        self.ensure_open()?;
        if self.remote_description.is_none() {
            return Err(EngineError::Rejected("candidate added before remote description".into()));
        }
        if !candidate.candidate().starts_with("candidate:") {
            return Err(EngineError::Rejected(format!(
                "unparseable candidate {:?}",
                candidate.candidate()
            )));
        }
        self.remote_candidates += 1;
        self.maybe_connect();
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(capture) = self.capture.take() {
            capture.stop();
        }
        if let Some(playback) = self.playback.take() {
            playback.stop();
        }
        self.callbacks.connection_state_changed(ConnectionState::Closed);
        info!("synthetic engine closed");
    }
}

impl Drop for SyntheticEngine {
    fn drop(&mut self) {
        self.close();
    }
}

/// Width and height advertised in a synthetic description.
fn parse_resolution(sdp: &str) -> Option<Resolution> {
    let params = sdp
        .lines()
        .find_map(|line| line.trim().strip_prefix("a=fmtp:96 "))?;
    let mut width = None;
    let mut height = None;
    for pair in params.split(';') {
        match pair.split_once('=') {
            Some(("width", v)) => width = v.trim().parse().ok(),
            Some(("height", v)) => height = v.trim().parse().ok(),
            _ => {}
        }
    }
    match (width, height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => {
            Some(Resolution { width, height })
        }
        _ => None,
    }
}

/// Test-pattern producer thread feeding one side of the callbacks. The thread
/// is detached; it notices the stop flag before its next frame.
struct Generator {
    stop: Arc<AtomicBool>,
}

impl Generator {
    fn spawn(
        kind: StreamKind,
        resolution: Resolution,
        framerate: u32,
        callbacks: EngineCallbacks,
    ) -> Result<Self, EngineError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let interval_ns = 1_000_000_000 / u64::from(framerate.max(1));

        thread::Builder::new()
            .name(format!("tandem-synthetic-{kind}"))
            .spawn(move || {
                let start = Instant::now();
                let mut seq: u64 = 0;
                while !stop_flag.load(Ordering::Acquire) {
                    let target = start + Duration::from_nanos(interval_ns.saturating_mul(seq));
                    if let Some(wait) = target.checked_duration_since(Instant::now()) {
                        thread::sleep(wait);
                    }
                    let frame = test_pattern(resolution, seq)
                        .with_timestamp(start.elapsed().as_micros() as u64);
                    match kind {
                        StreamKind::Local => callbacks.local_frame_ready(frame),
                        StreamKind::Remote => callbacks.remote_frame_ready(frame),
                    }
                    seq += 1;
                }
                debug!("synthetic {} generator stopped after {} frames", kind, seq);
            })
            .map_err(|e| EngineError::Internal(format!("spawn {kind} generator: {e}")))?;

        Ok(Self { stop })
    }

    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }
}

impl Drop for Generator {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Diagonal luma ramp scrolling one pixel per frame over flat chroma.
fn test_pattern(resolution: Resolution, seq: u64) -> Frame {
    let (w, h) = (resolution.width as usize, resolution.height as usize);
    let mut data = vec![128u8; i420_len(resolution.width, resolution.height)];
    let shift = seq as usize;
    for (y, row) in data[..w * h].chunks_exact_mut(w).enumerate() {
        for (x, px) in row.iter_mut().enumerate() {
            *px = ((x + y + shift) & 0xff) as u8;
        }
    }
    Frame::i420(resolution.width, resolution.height, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FrameBridge;
    use crate::engine::EngineEvent;
    use tokio::sync::mpsc;

    fn engine() -> (SyntheticEngine, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let callbacks = EngineCallbacks::new(
            tx,
            Arc::new(FrameBridge::new(StreamKind::Local)),
            Arc::new(FrameBridge::new(StreamKind::Remote)),
        );
        let config = EngineConfig {
            ice_servers: vec!["stun:stun.example.org:3478".into()],
            framerate: 30,
        };
        (SyntheticEngine::new(callbacks, config).unwrap(), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn remote_candidate() -> IceCandidateDescriptor {
        IceCandidateDescriptor::new("candidate:9 1 udp 100 10.0.0.2 6000 typ host", 0, "0")
    }

    #[test]
    fn test_offer_emits_description_then_candidates() {
        let (mut engine, mut rx) = engine();
        engine.create_offer().unwrap();
        let events: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|e| !matches!(e, EngineEvent::FirstFrame { .. }))
            .collect();
        match &events[0] {
            EngineEvent::LocalDescription { kind, sdp } => {
                assert_eq!(*kind, SdpKind::Offer);
                assert!(sdp.starts_with("v=0\r\n"));
                assert!(sdp.contains("a=x-ice-server:stun:stun.example.org:3478"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events.len(), 1 + HOST_CANDIDATES);
        for event in &events[1..] {
            match event {
                EngineEvent::LocalCandidate(desc) => {
                    assert!(desc.encode_payload().is_ok());
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_candidate_before_remote_description_is_rejected() {
        let (mut engine, _rx) = engine();
        assert!(matches!(
            engine.add_ice_candidate(&remote_candidate()),
            Err(EngineError::Rejected(_))
        ));
    }

    #[test]
    fn test_answerer_connects_after_candidate() {
        let (mut engine, mut rx) = engine();
        let offer = "v=0\r\na=fmtp:96 width=64;height=48;framerate=30\r\n";
        engine
            .set_remote_description(SdpKind::Offer, offer)
            .unwrap();
        engine.create_answer().unwrap();
        engine.add_ice_candidate(&remote_candidate()).unwrap();

        let mut events = drain(&mut rx);
        let states: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::ConnectionStateChanged(s) => Some(*s),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![ConnectionState::Checking, ConnectionState::Connected]
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        let resolution = loop {
            let remote_first = events.iter().find_map(|e| match e {
                EngineEvent::FirstFrame {
                    stream: StreamKind::Remote,
                    resolution,
                } => Some(*resolution),
                _ => None,
            });
            if let Some(resolution) = remote_first {
                break resolution;
            }
            assert!(Instant::now() < deadline, "no remote frame");
            thread::sleep(Duration::from_millis(10));
            events.extend(drain(&mut rx));
        };
        assert_eq!(
            resolution,
            Resolution {
                width: 64,
                height: 48
            }
        );
    }

    #[test]
    fn test_rejects_garbage_and_out_of_order_descriptions() {
        let (mut engine, _rx) = engine();
        assert!(matches!(
            engine.set_remote_description(SdpKind::Offer, "hello"),
            Err(EngineError::Rejected(_))
        ));
        assert!(engine
            .set_remote_description(SdpKind::Answer, "v=0\r\n")
            .is_err());
        assert!(engine.create_answer().is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut engine, mut rx) = engine();
        engine.close();
        engine.close();
        assert_eq!(engine.create_offer(), Err(EngineError::Closed));
        let closed = drain(&mut rx)
            .into_iter()
            .filter(|e| *e == EngineEvent::ConnectionStateChanged(ConnectionState::Closed))
            .count();
        assert_eq!(closed, 1);
    }

    #[test]
    fn test_close_does_not_wait_for_generators() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let local = Arc::new(FrameBridge::new(StreamKind::Local));
        let callbacks =
            EngineCallbacks::new(tx, local.clone(), Arc::new(FrameBridge::new(StreamKind::Remote)));
        let config = EngineConfig {
            ice_servers: Vec::new(),
            framerate: 1,
        };
        let mut engine = SyntheticEngine::new(callbacks, config).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while local.is_empty() {
            assert!(Instant::now() < deadline, "no local frame");
            thread::sleep(Duration::from_millis(5));
        }

        // The capture thread is now sleeping until its next one-second frame.
        let started = Instant::now();
        engine.close();
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn test_parse_resolution() {
        let sdp = "v=0\r\na=fmtp:96 width=1280;height=720;framerate=30\r\n";
        assert_eq!(
            parse_resolution(sdp),
            Some(Resolution {
                width: 1280,
                height: 720
            })
        );
        assert_eq!(parse_resolution("v=0\r\n"), None);
        assert_eq!(parse_resolution("a=fmtp:96 width=0;height=10"), None);
    }

    #[test]
    fn test_pattern_has_i420_size() {
        let frame = test_pattern(Resolution { width: 6, height: 4 }, 3);
        assert_eq!(frame.data.len(), i420_len(6, 4));
        assert_eq!(frame.data[0], 3);
        assert_eq!(frame.data[6 * 4], 128);
    }
}
