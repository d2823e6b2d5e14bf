//! Direct (one-to-one) call flows
//!
//! Both nodes run with in-memory media and signaling; `exchange` plays the
//! relay for addressed messages while membership is fed by hand.

mod common;

use common::*;
use peercall::call::{
    CallDescriptor, CallNotice, CallStatus, ConnectionState, MediaKind, ParticipantId, TrackKind,
};
use peercall::protocol::SignalMessage;
use std::time::Instant;

const CALL: &str = "call-ab";

fn direct_pair(media: MediaKind) -> (Vec<Node>, Instant) {
    let descriptor = CallDescriptor::direct(CALL, "alice", "bob", media);
    let nodes = vec![
        Node::new(descriptor.clone(), record("alice", 0), FakeMedia::auto_connect()),
        Node::new(descriptor, record("bob", 1), FakeMedia::auto_connect()),
    ];
    (nodes, Instant::now())
}

/// Alice joins first, then Bob; the relay tells each what it would in production
async fn join_both(nodes: &mut [Node], now: Instant) {
    for node in nodes.iter_mut() {
        node.start(now).await;
    }
    let alice = nodes[0].record.clone();
    let bob = nodes[1].record.clone();

    nodes[0].deliver(existing(CALL, &[&alice]), now).await;
    nodes[1].deliver(existing(CALL, &[&alice, &bob]), now).await;
    nodes[0].deliver(joined(CALL, &bob), now).await;
}

/// Test: Direct call converges
/// Given a direct call initiated by Alice
/// When both join and the offer delay elapses
/// Then exactly one offer and one answer are exchanged and both sides connect
#[tokio::test]
async fn test_direct_call_converges_with_one_offer_and_one_answer() {
    let (mut nodes, t0) = direct_pair(MediaKind::AudioVideo);
    join_both(&mut nodes, t0).await;

    let bob = ParticipantId::new("bob");
    let alice = ParticipantId::new("alice");
    assert!(nodes[0].orch.registry().session(&bob).unwrap().should_offer());
    assert!(!nodes[1].orch.registry().session(&alice).unwrap().should_offer());

    // Nothing is offered before the delay
    exchange(&mut nodes, t0).await;
    assert_eq!(nodes[0].sent_offers(), 0);

    let t1 = after(t0, 500);
    for node in nodes.iter_mut() {
        node.fire(t1).await;
    }
    exchange(&mut nodes, t1).await;

    assert_eq!(nodes[0].sent_offers(), 1);
    assert_eq!(nodes[1].sent_offers(), 0);
    assert_eq!(nodes[1].sent_answers(), 1);
    assert_eq!(nodes[0].sent_answers(), 0);

    let a_session = nodes[0].orch.registry().session(&bob).unwrap();
    let b_session = nodes[1].orch.registry().session(&alice).unwrap();
    assert_eq!(a_session.state(), ConnectionState::Connected);
    assert_eq!(b_session.state(), ConnectionState::Connected);
    assert_eq!(nodes[0].orch.status(), CallStatus::Active);
    assert_eq!(nodes[1].orch.status(), CallStatus::Active);

    // Local capture was attached to each connection exactly once
    let a_conn = nodes[0].media.latest("bob").unwrap();
    assert_eq!(a_conn.added_tracks(), vec!["alice-mic", "alice-cam"]);
    assert_eq!(nodes[0].media.created(), 1);
    assert_eq!(nodes[1].media.created(), 1);
}

/// Test: Offer retried after a signaling outage
/// Given the relay connection is down when the offer delay elapses
/// When the connection recovers
/// Then the offer goes out on the next attempt and the call connects
#[tokio::test]
async fn test_offer_retried_after_failed_send() {
    let (mut nodes, t0) = direct_pair(MediaKind::Audio);
    join_both(&mut nodes, t0).await;
    let bob = ParticipantId::new("bob");
    let alice = ParticipantId::new("alice");

    nodes[0].outbox.set_offline(true);
    nodes[0].fire(after(t0, 500)).await;
    assert_eq!(nodes[0].sent_offers(), 0);
    assert!(nodes[0].orch.registry().session(&bob).unwrap().is_fresh());

    nodes[0].outbox.set_offline(false);
    let t1 = after(t0, 1000);
    nodes[0].fire(t1).await;
    exchange(&mut nodes, t1).await;

    assert_eq!(nodes[0].sent_offers(), 1);
    assert_eq!(nodes[1].sent_answers(), 1);
    let a_session = nodes[0].orch.registry().session(&bob).unwrap();
    let b_session = nodes[1].orch.registry().session(&alice).unwrap();
    assert_eq!(a_session.state(), ConnectionState::Connected);
    assert_eq!(b_session.state(), ConnectionState::Connected);
}

/// Test: ICE candidates cross over the relay
/// Given a converged direct call
/// Then each side applied the candidate the other gathered
#[tokio::test]
async fn test_candidates_are_signaled_and_applied() {
    let (mut nodes, t0) = direct_pair(MediaKind::Audio);
    join_both(&mut nodes, t0).await;
    let t1 = after(t0, 500);
    nodes[0].fire(t1).await;
    exchange(&mut nodes, t1).await;

    let bob_conn = nodes[1].media.latest("alice").unwrap();
    assert_eq!(
        bob_conn.count(|c| *c == MediaCall::AddCandidate("candidate-for-bob".into())),
        1
    );
    let alice_conn = nodes[0].media.latest("bob").unwrap();
    assert_eq!(
        alice_conn.count(|c| *c == MediaCall::AddCandidate("candidate-for-alice".into())),
        1
    );
}

/// Test: Offer before membership
/// Given Bob has not yet heard from the relay
/// When Alice's offer arrives first
/// Then Bob answers from a fresh session and the later join reuses it
#[tokio::test]
async fn test_offer_before_membership_is_answered_once() {
    let (mut nodes, t0) = direct_pair(MediaKind::Audio);
    nodes[0].start(t0).await;
    nodes[1].start(t0).await;
    let bob = nodes[1].record.clone();
    nodes[0].deliver(joined(CALL, &bob), t0).await;

    let t1 = after(t0, 500);
    nodes[0].fire(t1).await;
    exchange(&mut nodes, t1).await;

    let alice = nodes[0].record.clone();
    nodes[1].deliver(existing(CALL, &[&alice, &bob]), t1).await;

    assert_eq!(nodes[1].sent_answers(), 1);
    assert_eq!(nodes[1].media.created(), 1);
    assert_eq!(
        nodes[1]
            .orch
            .registry()
            .session(&alice.id)
            .unwrap()
            .state(),
        ConnectionState::Connected
    );
}

/// Test: Strangers are ignored
/// Given a direct call between Alice and Bob
/// When Mallory joins or offers
/// Then no session is created for her
#[tokio::test]
async fn test_direct_call_ignores_third_party() {
    let (mut nodes, t0) = direct_pair(MediaKind::Audio);
    nodes[0].start(t0).await;

    let mallory = record("mallory", 5);
    nodes[0].deliver(joined(CALL, &mallory), t0).await;
    nodes[0]
        .deliver(
            SignalMessage::Offer {
                call_id: CALL.to_string(),
                from: mallory.id.clone(),
                to: ParticipantId::new("alice"),
                description: peercall::call::SessionDescription::offer("v=0 mallory"),
            },
            t0,
        )
        .await;

    assert_eq!(nodes[0].orch.registry().session_count(), 0);
    assert_eq!(nodes[0].sent_answers(), 0);
}

/// Test: Counterpart leaves
/// Given a connected direct call
/// When the relay reports Bob left
/// Then Alice closes the session but stays in the call
#[tokio::test]
async fn test_counterpart_leaving_closes_session() {
    let (mut nodes, t0) = direct_pair(MediaKind::Audio);
    join_both(&mut nodes, t0).await;
    let t1 = after(t0, 500);
    nodes[0].fire(t1).await;
    exchange(&mut nodes, t1).await;

    let mut notices = nodes[0].orch.subscribe();
    let bob = nodes[1].id.clone();
    nodes[0].deliver(left(CALL, &bob), t1).await;

    assert!(nodes[0].orch.registry().session(&bob).is_none());
    assert!(nodes[0].media.latest("bob").unwrap().is_closed());
    assert_eq!(nodes[0].orch.status(), CallStatus::Active);
    assert!(matches!(
        notices.try_recv(),
        Ok(CallNotice::ParticipantLeft { peer }) if peer == bob
    ));

    // A second leave for the same identity is harmless
    nodes[0].deliver(left(CALL, &bob), t1).await;
    assert!(notices.try_recv().is_err());
}

/// Test: Toggling a track
/// Given a connected direct call
/// When Alice mutes her microphone
/// Then her senders are disabled, Bob is told, and nothing is renegotiated
#[tokio::test]
async fn test_toggle_track_signals_without_renegotiation() {
    let (mut nodes, t0) = direct_pair(MediaKind::AudioVideo);
    join_both(&mut nodes, t0).await;
    let t1 = after(t0, 500);
    nodes[0].fire(t1).await;
    exchange(&mut nodes, t1).await;

    let offers_before = nodes[0].sent_offers();
    nodes[0]
        .orch
        .handle()
        .toggle_track(TrackKind::Audio, false)
        .unwrap();
    nodes[0].orch.process_pending(t1).await;

    let alice_stream = nodes[0].orch.local_stream();
    let mic = alice_stream
        .tracks()
        .iter()
        .find(|t| t.kind() == TrackKind::Audio)
        .unwrap();
    assert!(!mic.is_enabled());
    let session = nodes[0].orch.registry().session(&nodes[1].id).unwrap();
    assert!(session
        .senders()
        .iter()
        .filter(|s| s.kind() == TrackKind::Audio)
        .all(|s| !s.is_enabled()));
    assert!(session
        .senders()
        .iter()
        .filter(|s| s.kind() == TrackKind::Video)
        .all(|s| s.is_enabled()));

    assert_eq!(
        nodes[0]
            .outbox
            .count(|m| matches!(m, SignalMessage::TrackStateChanged { enabled: false, .. })),
        1
    );
    exchange(&mut nodes, t1).await;
    assert_eq!(nodes[0].sent_offers(), offers_before);

    let alice = nodes[0].id.clone();
    let seen = nodes[1].orch.remote_media_state(&alice).unwrap();
    assert!(!seen.is_enabled(TrackKind::Audio));
    assert!(seen.is_enabled(TrackKind::Video));
}

/// Test: Video toggle on an audio-only call
/// Then it is ignored entirely
#[tokio::test]
async fn test_video_toggle_ignored_on_audio_call() {
    let (mut nodes, t0) = direct_pair(MediaKind::Audio);
    join_both(&mut nodes, t0).await;

    nodes[0]
        .orch
        .handle()
        .toggle_track(TrackKind::Video, false)
        .unwrap();
    nodes[0].orch.process_pending(t0).await;

    assert_eq!(
        nodes[0]
            .outbox
            .count(|m| matches!(m, SignalMessage::TrackStateChanged { .. })),
        0
    );
}

/// Test: Hangup
/// Given a connected direct call
/// When Alice hangs up twice
/// Then she leaves once, releases everything, and ends the call
#[tokio::test]
async fn test_hangup_is_idempotent() {
    let (mut nodes, t0) = direct_pair(MediaKind::AudioVideo);
    join_both(&mut nodes, t0).await;
    let t1 = after(t0, 500);
    nodes[0].fire(t1).await;
    exchange(&mut nodes, t1).await;

    let mut notices = nodes[0].orch.subscribe();
    nodes[0].orch.hangup().await;
    nodes[0].orch.hangup().await;

    assert_eq!(nodes[0].orch.status(), CallStatus::Ended);
    assert_eq!(
        nodes[0]
            .outbox
            .count(|m| matches!(m, SignalMessage::LeaveCall { .. })),
        1
    );
    assert_eq!(nodes[0].orch.registry().session_count(), 0);
    let conn = nodes[0].media.latest("bob").unwrap();
    assert_eq!(conn.count(|c| *c == MediaCall::Close), 1);
    assert!(nodes[0]
        .orch
        .local_stream()
        .tracks()
        .iter()
        .all(|t| !t.is_live()));
    assert!(nodes[0].orch.next_deadline().is_none());

    let mut ended = 0;
    while let Ok(notice) = notices.try_recv() {
        if matches!(notice, CallNotice::CallEnded { .. }) {
            ended += 1;
        }
    }
    assert_eq!(ended, 1);

    // Late events after hangup are dropped
    let bob = nodes[1].record.clone();
    nodes[0].deliver(joined(CALL, &bob), t1).await;
    assert_eq!(nodes[0].orch.registry().session_count(), 0);
}
