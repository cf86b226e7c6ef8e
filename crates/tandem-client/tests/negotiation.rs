//! End-to-end negotiation through the orchestrator over an in-memory relay.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{
    candidate_message, eventually, EngineCall, MemoryRelay, RecordingEngine, RecordingHost,
};
use tandem_client::Orchestrator;
use tandem_common::SessionConfig;
use tandem_core::{MessageKind, NegotiationState, SdpKind, SignalingMessage};
use tandem_media::{StreamKind, SyntheticEngine};
use tokio::time::timeout;

fn config(local: &str, remote: &str) -> SessionConfig {
    let mut config = SessionConfig::new("http://127.0.0.1:3000/", local, remote);
    config.poll_interval = Duration::from_millis(10);
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_peers_reach_connected() {
    let relay = MemoryRelay::default();
    let host_a = RecordingHost::default();
    let host_b = RecordingHost::default();

    let (alice, mut alice_handle) = Orchestrator::new(
        config("alice", "bob"),
        relay.transport("alice", "bob"),
        SyntheticEngine::new,
        host_a.clone(),
    )
    .unwrap();
    let (bob, mut bob_handle) = Orchestrator::new(
        config("bob", "alice"),
        relay.transport("bob", "alice"),
        SyntheticEngine::new,
        host_b.clone(),
    )
    .unwrap();
    let alice_task = tokio::spawn(alice.run());
    let bob_task = tokio::spawn(bob.run());

    assert!(alice_handle.create_offer());

    let state = timeout(
        Duration::from_secs(10),
        alice_handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .unwrap();
    assert_eq!(state, NegotiationState::Connected);
    let state = timeout(
        Duration::from_secs(10),
        bob_handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .unwrap();
    assert_eq!(state, NegotiationState::Connected);

    eventually("remote streams", || {
        host_a.is_ready(StreamKind::Remote) && host_b.is_ready(StreamKind::Remote)
    })
    .await;
    let formats = host_a.ready.lock().unwrap().clone();
    for (_, format) in formats {
        assert_eq!(format.framerate, 30);
        assert_eq!(format.bitrate, 30 * 320 * 240 * 12);
    }

    alice_handle.close();
    bob_handle.close();
    alice_task.await.unwrap();
    bob_task.await.unwrap();
    assert_eq!(alice_handle.state(), NegotiationState::Closed);
    assert_eq!(
        *host_a.detached.lock().unwrap(),
        vec![StreamKind::Local, StreamKind::Remote]
    );
}

#[tokio::test]
async fn candidates_before_offer_are_applied_in_order() {
    let relay = MemoryRelay::default();
    for name in ["A", "B", "C"] {
        relay.post("bob", &candidate_message(name));
    }
    relay.post("bob", &SignalingMessage::description(SdpKind::Offer, "v=0 offer"));

    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine_calls = calls.clone();
    let (bob, mut handle) = Orchestrator::new(
        config("bob", "alice"),
        relay.transport("bob", "alice"),
        move |cb, _| Ok(RecordingEngine::new(cb, engine_calls)),
        RecordingHost::default(),
    )
    .unwrap();
    let task = tokio::spawn(bob.run());

    let state = timeout(
        Duration::from_secs(10),
        handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .unwrap();
    assert_eq!(state, NegotiationState::Connected);

    let expected = vec![
        EngineCall::SetRemote(SdpKind::Offer),
        EngineCall::AddCandidate(candidate_message("A").to_candidate().unwrap().candidate().into()),
        EngineCall::AddCandidate(candidate_message("B").to_candidate().unwrap().candidate().into()),
        EngineCall::AddCandidate(candidate_message("C").to_candidate().unwrap().candidate().into()),
        EngineCall::CreateAnswer,
    ];
    assert_eq!(*calls.lock().unwrap(), expected);

    let mut sent = Vec::new();
    eventually("answer on relay", || {
        sent.extend(relay.take_all("alice"));
        !sent.is_empty()
    })
    .await;
    assert_eq!(sent[0].kind, MessageKind::Answer);

    handle.close();
    task.await.unwrap();
}

#[tokio::test]
async fn malformed_messages_are_dropped_and_session_continues() {
    let relay = MemoryRelay::default();
    relay.post_raw("bob", "{not json");
    relay.post(
        "bob",
        &SignalingMessage::new(
            MessageKind::IceCandidate,
            "candidate:1 1 udp 1 1.2.3.4 9 typ host|0",
        ),
    );
    relay.post_raw("bob", r#"{"MessageType":"bye","Data":""}"#);
    relay.post("bob", &SignalingMessage::description(SdpKind::Offer, "v=0 offer"));
    relay.post("bob", &candidate_message("late"));

    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine_calls = calls.clone();
    let (bob, mut handle) = Orchestrator::new(
        config("bob", "alice"),
        relay.transport("bob", "alice"),
        move |cb, _| Ok(RecordingEngine::new(cb, engine_calls)),
        RecordingHost::default(),
    )
    .unwrap();
    let task = tokio::spawn(bob.run());

    timeout(
        Duration::from_secs(10),
        handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .unwrap();
    eventually("late candidate", || {
        calls
            .lock()
            .unwrap()
            .iter()
            .any(|c| matches!(c, EngineCall::AddCandidate(s) if s.starts_with("candidate:late")))
    })
    .await;

    let answers: Vec<_> = relay
        .take_all("alice")
        .into_iter()
        .filter(|m| m.kind == MessageKind::Answer)
        .collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].payload, "v=0 recorded answer");
    assert!(!calls
        .lock()
        .unwrap()
        .iter()
        .any(|c| matches!(c, EngineCall::AddCandidate(s) if s.starts_with("candidate:1 "))));

    handle.close();
    task.await.unwrap();
}

#[tokio::test]
async fn close_twice_matches_close_once() {
    let relay = MemoryRelay::default();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine_calls = calls.clone();
    let host = RecordingHost::default();
    let (alice, handle) = Orchestrator::new(
        config("alice", "bob"),
        relay.transport("alice", "bob"),
        move |cb, _| Ok(RecordingEngine::new(cb, engine_calls)),
        host.clone(),
    )
    .unwrap();
    let task = tokio::spawn(alice.run());

    handle.close();
    handle.close();
    task.await.unwrap();
    handle.close();
    assert!(!handle.create_offer());

    assert_eq!(handle.state(), NegotiationState::Closed);
    assert_eq!(*calls.lock().unwrap(), vec![EngineCall::Close]);
    assert_eq!(host.detached.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn offerer_sends_offer_through_relay() {
    let relay = MemoryRelay::default();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine_calls = calls.clone();
    let (alice, handle) = Orchestrator::new(
        config("alice", "bob"),
        relay.transport("alice", "bob"),
        move |cb, _| Ok(RecordingEngine::new(cb, engine_calls)),
        RecordingHost::default(),
    )
    .unwrap();
    let task = tokio::spawn(alice.run());
    handle.create_offer();

    let mut delivered = Vec::new();
    eventually("offer on relay", || {
        delivered.extend(relay.take_all("bob"));
        !delivered.is_empty()
    })
    .await;
    assert_eq!(delivered[0].kind, MessageKind::Offer);
    assert_eq!(delivered[0].payload, "v=0 recorded offer");
    assert_eq!(handle.state(), NegotiationState::HaveLocalOffer);

    handle.close();
    task.await.unwrap();
}

#[tokio::test]
async fn failed_offer_leaves_session_negotiable() {
    let relay = MemoryRelay::default();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let engine_calls = calls.clone();
    let (alice, mut handle) = Orchestrator::new(
        config("alice", "bob"),
        relay.transport("alice", "bob"),
        move |cb, _| Ok(RecordingEngine::new(cb, engine_calls).failing_offers(2)),
        RecordingHost::default(),
    )
    .unwrap();
    let task = tokio::spawn(alice.run());

    handle.create_offer();
    handle.create_offer();
    eventually("two offer attempts", || calls.lock().unwrap().len() == 2).await;
    assert_eq!(handle.state(), NegotiationState::Idle);
    assert!(relay.take_all("bob").is_empty());

    // The peer calls in instead and gets answered.
    relay.post("alice", &SignalingMessage::description(SdpKind::Offer, "v=0 offer"));
    let state = timeout(
        Duration::from_secs(10),
        handle.wait_for_state(NegotiationState::Connected),
    )
    .await
    .unwrap();
    assert_eq!(state, NegotiationState::Connected);

    let mut sent = Vec::new();
    eventually("answer on relay", || {
        sent.extend(relay.take_all("bob"));
        !sent.is_empty()
    })
    .await;
    assert_eq!(sent[0].kind, MessageKind::Answer);

    handle.close();
    task.await.unwrap();
}
