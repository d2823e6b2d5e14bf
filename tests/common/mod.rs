//! In-memory collaborators for orchestrator tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use peercall::call::{
    CallConfig, CallDescriptor, CallEvent, CallOrchestrator, CaptureDevice, CaptureError,
    IceCandidate, LocalStream, MediaConnection, MediaConnectionFactory, MediaConnectionState,
    MediaConstraints, MediaError, MediaEvent, MediaEventSink, MediaTrack, ParticipantId,
    ParticipantRecord, SdpKind, SessionDescription, TrackKind,
};
use peercall::network::{NetworkError, SignalingChannel};
use peercall::protocol::SignalMessage;

/// Operation performed on a fake media connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    CreateOffer { ice_restart: bool },
    CreateAnswer,
    SetLocal(SdpKind),
    Rollback,
    SetRemote(SdpKind, String),
    AddCandidate(String),
    AddTrack(String),
    Close,
}

/// Test-side view of one fake connection
#[derive(Clone)]
pub struct FakeConnectionHandle {
    pub peer: ParticipantId,
    pub sink: MediaEventSink,
    calls: Arc<Mutex<Vec<MediaCall>>>,
}

impl FakeConnectionHandle {
    pub fn generation(&self) -> u64 {
        self.sink.generation()
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&MediaCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.calls.lock().contains(&MediaCall::Close)
    }

    pub fn added_tracks(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                MediaCall::AddTrack(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn emit_state(&self, state: MediaConnectionState) {
        self.sink.emit(MediaEvent::StateChanged(state));
    }

    pub fn emit_track(&self, track: MediaTrack) {
        self.sink.emit(MediaEvent::Track(track));
    }

    pub fn emit_candidate(&self, candidate: &str) {
        self.sink
            .emit(MediaEvent::IceCandidate(IceCandidate::new(candidate)));
    }
}

#[derive(Default)]
struct FakeMediaState {
    connections: Vec<FakeConnectionHandle>,
    auto_connect: bool,
    failing_creates: u32,
}

/// Shared registry of every fake connection a node created
#[derive(Clone, Default)]
pub struct FakeMedia {
    state: Arc<Mutex<FakeMediaState>>,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections report `connected` once both descriptions are applied
    pub fn auto_connect() -> Self {
        let media = Self::default();
        media.state.lock().auto_connect = true;
        media
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_creates(&self, count: u32) {
        self.state.lock().failing_creates = count;
    }

    pub fn factory(&self) -> Box<dyn MediaConnectionFactory> {
        Box::new(FakeFactory {
            media: self.clone(),
        })
    }

    pub fn connections(&self) -> Vec<FakeConnectionHandle> {
        self.state.lock().connections.clone()
    }

    pub fn connections_for(&self, peer: &str) -> Vec<FakeConnectionHandle> {
        self.connections()
            .into_iter()
            .filter(|c| c.peer.as_str() == peer)
            .collect()
    }

    pub fn latest(&self, peer: &str) -> Option<FakeConnectionHandle> {
        self.connections_for(peer).pop()
    }

    pub fn created(&self) -> usize {
        self.state.lock().connections.len()
    }
}

struct FakeFactory {
    media: FakeMedia,
}

impl MediaConnectionFactory for FakeFactory {
    fn create(
        &mut self,
        remote: &ParticipantId,
        events: MediaEventSink,
    ) -> Result<Box<dyn MediaConnection>, MediaError> {
        let mut state = self.media.state.lock();
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(MediaError::Negotiation("transport unavailable".into()));
        }

        let calls = Arc::new(Mutex::new(Vec::new()));
        state.connections.push(FakeConnectionHandle {
            peer: remote.clone(),
            sink: events.clone(),
            calls: calls.clone(),
        });

        Ok(Box::new(FakeConnection {
            peer: remote.clone(),
            sink: events,
            calls,
            auto_connect: state.auto_connect,
            descriptions: 0,
            local_set: false,
            remote_set: false,
        }))
    }
}

struct FakeConnection {
    peer: ParticipantId,
    sink: MediaEventSink,
    calls: Arc<Mutex<Vec<MediaCall>>>,
    auto_connect: bool,
    descriptions: u32,
    local_set: bool,
    remote_set: bool,
}

impl FakeConnection {
    fn record(&self, call: MediaCall) {
        self.calls.lock().push(call);
    }

    fn next_sdp(&mut self, kind: &str) -> String {
        self.descriptions += 1;
        format!(
            "{}-to-{}-g{}-{}",
            kind,
            self.peer,
            self.sink.generation(),
            self.descriptions
        )
    }

    fn maybe_connect(&self) {
        if self.auto_connect && self.local_set && self.remote_set {
            self.sink
                .emit(MediaEvent::StateChanged(MediaConnectionState::Connected));
        }
    }
}

#[async_trait]
impl MediaConnection for FakeConnection {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, MediaError> {
        self.record(MediaCall::CreateOffer { ice_restart });
        Ok(SessionDescription::offer(self.next_sdp("offer")))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError> {
        self.record(MediaCall::CreateAnswer);
        Ok(SessionDescription::answer(self.next_sdp("answer")))
    }

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.record(MediaCall::SetLocal(description.kind));
        self.local_set = true;
        // A new offer waits for a new answer
        if description.kind == SdpKind::Offer {
            self.remote_set = false;
        }
        if self.auto_connect {
            self.sink.emit(MediaEvent::IceCandidate(IceCandidate::new(format!(
                "candidate-for-{}",
                self.peer
            ))));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn rollback_local_description(&mut self) -> Result<(), MediaError> {
        self.record(MediaCall::Rollback);
        self.local_set = false;
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError> {
        self.record(MediaCall::SetRemote(description.kind, description.sdp));
        self.remote_set = true;
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), MediaError> {
        self.record(MediaCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    fn add_track(&mut self, track: &MediaTrack) -> Result<(), MediaError> {
        self.record(MediaCall::AddTrack(track.id().to_string()));
        Ok(())
    }

    fn close(&mut self) {
        self.record(MediaCall::Close);
    }
}

/// Signaling channel that records everything sent
///
/// `sent` keeps the full history; `take` drains only the undelivered queue.
#[derive(Clone, Default)]
pub struct RecordingSignaling {
    history: Arc<Mutex<Vec<SignalMessage>>>,
    queue: Arc<Mutex<Vec<SignalMessage>>>,
    offline: Arc<Mutex<bool>>,
}

impl RecordingSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.history.lock().clone()
    }

    pub fn take(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.queue.lock())
    }

    pub fn count(&self, predicate: impl Fn(&SignalMessage) -> bool) -> usize {
        self.history.lock().iter().filter(|m| predicate(m)).count()
    }

    /// While offline every send fails and nothing is recorded
    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }
}

#[async_trait]
impl SignalingChannel for RecordingSignaling {
    async fn send(&mut self, msg: SignalMessage) -> Result<(), NetworkError> {
        if *self.offline.lock() {
            return Err(NetworkError::ConnectionClosed);
        }
        self.history.lock().push(msg.clone());
        self.queue.lock().push(msg);
        Ok(())
    }
}

/// Capture device that fails a configurable number of times first
pub struct FakeCapture {
    owner: ParticipantId,
    failures_left: u32,
    error: CaptureError,
    pub attempts: u32,
}

impl FakeCapture {
    pub fn new(owner: &str) -> Self {
        Self::failing(owner, 0, CaptureError::PermissionDenied)
    }

    pub fn failing(owner: &str, failures: u32, error: CaptureError) -> Self {
        Self {
            owner: ParticipantId::new(owner),
            failures_left: failures,
            error,
            attempts: 0,
        }
    }
}

#[async_trait]
impl CaptureDevice for FakeCapture {
    async fn acquire_local_stream(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, CaptureError> {
        self.attempts += 1;
        if self.failures_left > 0 {
            self.failures_left -= 1;
            return Err(self.error.clone());
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(
                format!("{}-mic", self.owner),
                TrackKind::Audio,
                self.owner.clone(),
            ));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(
                format!("{}-cam", self.owner),
                TrackKind::Video,
                self.owner.clone(),
            ));
        }
        Ok(LocalStream::new(tracks))
    }
}

/// Deterministic timings: fixed offer delay, short and fixed recovery steps
pub fn test_config() -> CallConfig {
    CallConfig {
        offer_delay_ms: 500,
        offer_jitter_ms: 0,
        failure_grace_ms: 3000,
        restart_check_ms: 3000,
        max_retries: 5,
        backoff_base_ms: 1000,
        backoff_max_ms: 1000,
        reconcile_interval_ms: 2000,
        health_interval_ms: 5000,
        connect_timeout_ms: 15_000,
        rejoin_delay_ms: 2000,
        capture_attempts: 3,
        capture_retry_delay_ms: 0,
        max_full_reconnects: 2,
        orphan_candidate_limit: 16,
    }
}

/// Participant record with a join time `offset_secs` after a fixed epoch
pub fn record(id: &str, offset_secs: i64) -> ParticipantRecord {
    let base = Utc
        .with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
        .single()
        .expect("valid timestamp");
    ParticipantRecord {
        id: ParticipantId::new(id),
        display_name: id.to_uppercase(),
        joined_at: base + chrono::Duration::seconds(offset_secs),
    }
}

pub fn after(start: Instant, millis: u64) -> Instant {
    start + Duration::from_millis(millis)
}

/// One participant with its fakes
pub struct Node {
    pub id: ParticipantId,
    pub record: ParticipantRecord,
    pub orch: CallOrchestrator,
    pub media: FakeMedia,
    pub outbox: RecordingSignaling,
}

impl Node {
    pub fn new(descriptor: CallDescriptor, record: ParticipantRecord, media: FakeMedia) -> Self {
        Self::with_config(descriptor, record, media, test_config())
    }

    pub fn with_config(
        descriptor: CallDescriptor,
        record: ParticipantRecord,
        media: FakeMedia,
        config: CallConfig,
    ) -> Self {
        let outbox = RecordingSignaling::new();
        let orch = CallOrchestrator::new(
            descriptor,
            record.clone(),
            config,
            media.factory(),
            Box::new(outbox.clone()),
        );
        Self {
            id: record.id.clone(),
            record,
            orch,
            media,
            outbox,
        }
    }

    pub async fn start(&mut self, now: Instant) {
        let mut capture = FakeCapture::new(self.id.as_str());
        self.orch
            .start(&mut capture, now)
            .await
            .expect("call should start");
    }

    /// Deliver a relay message and everything it triggers
    pub async fn deliver(&mut self, msg: SignalMessage, now: Instant) {
        self.orch.handle_event(CallEvent::Signal(msg), now).await;
        self.orch.process_pending(now).await;
    }

    pub async fn fire(&mut self, now: Instant) {
        self.orch.fire_due_timers(now).await;
        self.orch.process_pending(now).await;
    }

    pub fn sent_offers(&self) -> usize {
        self.outbox
            .count(|m| matches!(m, SignalMessage::Offer { .. }))
    }

    pub fn sent_answers(&self) -> usize {
        self.outbox
            .count(|m| matches!(m, SignalMessage::Answer { .. }))
    }
}

/// Route addressed messages between nodes until no node has anything to say
///
/// Membership messages (join/leave/hub) are dropped; tests feed those directly.
pub async fn exchange(nodes: &mut [Node], now: Instant) -> usize {
    let mut delivered = 0;
    for _ in 0..64 {
        let mut pending = Vec::new();
        for node in nodes.iter() {
            for msg in node.outbox.take() {
                if let Some(to) = msg.recipient().cloned() {
                    pending.push((to, msg));
                }
            }
        }
        if pending.is_empty() {
            break;
        }

        for (to, msg) in pending {
            if let Some(node) = nodes.iter_mut().find(|n| n.id == to) {
                node.deliver(msg, now).await;
                delivered += 1;
            }
        }
    }
    delivered
}

/// Everything a node's relay would send it when joining `call_id`
pub fn existing(call_id: &str, records: &[&ParticipantRecord]) -> SignalMessage {
    SignalMessage::ExistingParticipants {
        call_id: call_id.to_string(),
        participants: records.iter().map(|r| (*r).clone()).collect(),
    }
}

pub fn joined(call_id: &str, record: &ParticipantRecord) -> SignalMessage {
    SignalMessage::ParticipantJoined {
        call_id: call_id.to_string(),
        participant: record.clone(),
    }
}

pub fn left(call_id: &str, id: &ParticipantId) -> SignalMessage {
    SignalMessage::ParticipantLeft {
        call_id: call_id.to_string(),
        participant_id: id.clone(),
    }
}
