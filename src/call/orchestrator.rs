//! Call orchestrator: the single event loop driving one call
//!
//! Signaling messages, media connection callbacks, user commands and timers are
//! all funnelled into one sequential stream of [`CallEvent`]s. Exactly one
//! handler runs at a time, so the registry, topology and supervisor state is
//! plain owned data with no locking.
//!
//! ```text
//! relay ──► SignalingConnection reader ─┐
//! media connections ──► MediaEventSink ─┼──► CallEvent ──► CallOrchestrator
//! UI ──► CallHandle ────────────────────┘          │
//!                                                  ├──► SignalingChannel
//!                                                  └──► CallNotice (broadcast)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::config::CallConfig;
use super::error::{CallError, CaptureError};
use super::media::{
    CaptureDevice, LocalStream, MediaConnectionFactory, MediaConstraints, MediaEvent, MediaTrack,
};
use super::peer::NegotiationContext;
use super::registry::{SessionOpen, SessionRegistry};
use super::status::{CallDuration, CallStatus, RemoteMediaState};
use super::supervisor::{ReconnectionSupervisor, RecoveryAction, RetryPolicy};
use super::timers::{TimerKind, TimerQueue};
use super::topology::{elect_hub, ForwardingRecord, Role, TopologyManager};
use super::types::{
    CallDescriptor, ConnectionState, IceCandidate, MediaConnectionState, ParticipantId,
    ParticipantRecord, SessionDescription, TrackKind,
};
use crate::network::SignalingChannel;
use crate::protocol::SignalMessage;

const NOTICE_CAPACITY: usize = 100;
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Input to the call event loop
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Message received from the relay
    Signal(SignalMessage),
    /// Callback from the media connection of `peer`, created as `generation`
    Media {
        peer: ParticipantId,
        generation: u64,
        event: MediaEvent,
    },
    ToggleTrack {
        kind: TrackKind,
        enabled: bool,
    },
    ForceReconnect,
    Hangup,
}

/// UI-facing notification
#[derive(Debug, Clone)]
pub enum CallNotice {
    PeerStateChanged {
        peer: ParticipantId,
        state: ConnectionState,
    },
    /// Recovery gave up on the peer; the call continues without it
    PeerDegraded {
        peer: ParticipantId,
    },
    /// A track arrived over the session with `via`, captured by `origin`
    RemoteStream {
        via: ParticipantId,
        origin: ParticipantId,
        track: MediaTrack,
    },
    RemoteTrackState {
        peer: ParticipantId,
        kind: TrackKind,
        enabled: bool,
    },
    HubChanged {
        hub: Option<ParticipantId>,
        is_local: bool,
    },
    ParticipantLeft {
        peer: ParticipantId,
    },
    CaptureFailed(String),
    StatusChanged(CallStatus),
    CallEnded {
        duration: CallDuration,
    },
}

/// Cloneable handle for feeding events into a running call
#[derive(Debug, Clone)]
pub struct CallHandle {
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl CallHandle {
    pub fn send(&self, event: CallEvent) -> Result<(), CallError> {
        self.tx.send(event).map_err(|_| CallError::CallEnded)
    }

    pub fn signal(&self, message: SignalMessage) -> Result<(), CallError> {
        self.send(CallEvent::Signal(message))
    }

    pub fn toggle_track(&self, kind: TrackKind, enabled: bool) -> Result<(), CallError> {
        self.send(CallEvent::ToggleTrack { kind, enabled })
    }

    pub fn force_reconnect(&self) -> Result<(), CallError> {
        self.send(CallEvent::ForceReconnect)
    }

    pub fn hangup(&self) -> Result<(), CallError> {
        self.send(CallEvent::Hangup)
    }
}

/// Result of one health scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthReport {
    pub expected: usize,
    pub connected: usize,
    pub degraded: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
    pub id: ParticipantId,
    pub display_name: String,
    pub state: ConnectionState,
    pub should_offer: bool,
    pub generation: u64,
    pub attempts: u32,
    pub remote_tracks: usize,
}

/// Read-only view of the call for debugging
#[derive(Debug, Clone, Serialize)]
pub struct CallSnapshot {
    pub call_id: String,
    pub local: ParticipantId,
    pub status: CallStatus,
    pub duration: String,
    pub hub: Option<ParticipantId>,
    pub is_hub: bool,
    pub members: Vec<ParticipantId>,
    pub peers: Vec<PeerSnapshot>,
    pub forwarding: ForwardingRecord,
    pub degraded: Vec<ParticipantId>,
    pub full_reconnects: u32,
}

pub struct CallOrchestrator {
    descriptor: CallDescriptor,
    local: ParticipantRecord,
    config: CallConfig,
    signaling: Box<dyn SignalingChannel>,
    registry: SessionRegistry,
    topology: TopologyManager,
    supervisor: ReconnectionSupervisor,
    timers: TimerQueue,
    local_stream: LocalStream,
    remote_media: HashMap<ParticipantId, RemoteMediaState>,
    status: CallStatus,
    duration: CallDuration,
    full_reconnects: u32,
    tx: mpsc::UnboundedSender<CallEvent>,
    rx: Option<mpsc::UnboundedReceiver<CallEvent>>,
    notices: broadcast::Sender<CallNotice>,
}

impl CallOrchestrator {
    pub fn new(
        descriptor: CallDescriptor,
        local: ParticipantRecord,
        config: CallConfig,
        factory: Box<dyn MediaConnectionFactory>,
        signaling: Box<dyn SignalingChannel>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let registry = SessionRegistry::new(factory, tx.clone(), config.orphan_candidate_limit);
        let supervisor = ReconnectionSupervisor::new(RetryPolicy::from(&config));
        let topology = TopologyManager::new(local.id.clone());

        Self {
            descriptor,
            local,
            config,
            signaling,
            registry,
            topology,
            supervisor,
            timers: TimerQueue::new(),
            local_stream: LocalStream::default(),
            remote_media: HashMap::new(),
            status: CallStatus::Idle,
            duration: CallDuration::default(),
            full_reconnects: 0,
            tx,
            rx: Some(rx),
            notices,
        }
    }

    pub fn handle(&self) -> CallHandle {
        CallHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallNotice> {
        self.notices.subscribe()
    }

    pub fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    pub fn local(&self) -> &ParticipantRecord {
        &self.local
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn duration(&self) -> CallDuration {
        self.duration
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn topology(&self) -> &TopologyManager {
        &self.topology
    }

    pub fn supervisor(&self) -> &ReconnectionSupervisor {
        &self.supervisor
    }

    pub fn local_stream(&self) -> &LocalStream {
        &self.local_stream
    }

    pub fn remote_media_state(&self, peer: &ParticipantId) -> Option<RemoteMediaState> {
        self.remote_media.get(peer).copied()
    }

    pub fn full_reconnects(&self) -> u32 {
        self.full_reconnects
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub fn has_timer(&self, kind: &TimerKind) -> bool {
        self.timers.contains(kind)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        let mut peers: Vec<PeerSnapshot> = self
            .registry
            .sessions()
            .map(|session| PeerSnapshot {
                id: session.remote_id().clone(),
                display_name: session.remote().display_name.clone(),
                state: session.state(),
                should_offer: session.should_offer(),
                generation: session.generation(),
                attempts: self.supervisor.attempts(session.remote_id()),
                remote_tracks: session.remote_tracks().len(),
            })
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        let mut degraded = self.supervisor.permanently_failed();
        degraded.sort();

        CallSnapshot {
            call_id: self.descriptor.call_id.clone(),
            local: self.local.id.clone(),
            status: self.status,
            duration: self.duration.to_string(),
            hub: self.topology.hub().cloned(),
            is_hub: self.topology.is_hub(),
            members: self.registry.member_ids(),
            peers,
            forwarding: self.topology.state().forwarded.clone(),
            degraded,
            full_reconnects: self.full_reconnects,
        }
    }

    /// Acquire local media and join the call
    ///
    /// Capture is retried a bounded number of times; the final failure is
    /// fatal to starting the call.
    pub async fn start(
        &mut self,
        capture: &mut dyn CaptureDevice,
        now: Instant,
    ) -> Result<(), CallError> {
        if self.status != CallStatus::Idle {
            warn!("Call {} already started", self.descriptor.call_id);
            return Ok(());
        }

        self.local_stream = self.acquire_local_stream(capture).await?;

        self.signaling
            .send(SignalMessage::JoinCall {
                call_id: self.descriptor.call_id.clone(),
                participant: self.local.clone(),
            })
            .await?;
        info!(
            "Joined call {} as {}",
            self.descriptor.call_id, self.local.id
        );

        self.set_status(CallStatus::Connecting);
        self.timers.schedule(now + TICK_INTERVAL, TimerKind::Tick);
        self.timers
            .schedule(now + self.config.health_interval(), TimerKind::HealthScan);
        if self.descriptor.is_group() {
            self.timers
                .schedule(now + self.config.reconcile_interval(), TimerKind::Reconcile);
        }
        Ok(())
    }

    async fn acquire_local_stream(
        &mut self,
        capture: &mut dyn CaptureDevice,
    ) -> Result<LocalStream, CallError> {
        let constraints = MediaConstraints::from(self.descriptor.media);
        let attempts = self.config.capture_attempts;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match capture.acquire_local_stream(constraints).await {
                Ok(stream) => {
                    debug!("Local stream acquired with {} tracks", stream.tracks().len());
                    return Ok(stream);
                }
                Err(e) if attempt < attempts => {
                    warn!("Capture attempt {}/{} failed: {}", attempt, attempts, e);
                    tokio::time::sleep(self.config.capture_retry_delay()).await;
                }
                Err(e) => return Err(self.capture_failed(attempt, e)),
            }
        }
    }

    fn capture_failed(&mut self, attempts: u32, source: CaptureError) -> CallError {
        error!("Could not acquire local media: {}", source);
        self.notify(CallNotice::CaptureFailed(source.to_string()));
        CallError::Capture { attempts, source }
    }

    /// Run the event loop until the call ends
    pub async fn run(mut self) -> Result<(), CallError> {
        let mut rx = self.rx.take().ok_or(CallError::CallEnded)?;

        while self.status != CallStatus::Ended {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    let now = Instant::now();
                    self.handle_event(event, now).await;
                    self.fire_due_timers(now).await;
                }
                _ = wait_until(deadline) => {
                    self.fire_due_timers(Instant::now()).await;
                }
            }
        }

        info!("Call {} event loop finished", self.descriptor.call_id);
        Ok(())
    }

    /// Handle every event already queued, including ones queued while handling
    pub async fn process_pending(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        loop {
            let event = match self.rx.as_mut() {
                Some(rx) => match rx.try_recv() {
                    Ok(event) => event,
                    Err(_) => break,
                },
                None => break,
            };
            self.handle_event(event, now).await;
            handled += 1;
        }
        handled
    }

    /// Fire every timer due at `now`; returns how many fired
    pub async fn fire_due_timers(&mut self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some(timer) = self.timers.pop_due(now) {
            self.on_timer(timer, now).await;
            fired += 1;
        }
        fired
    }

    /// Dispatch one event; per-peer failures are logged and contained
    pub async fn handle_event(&mut self, event: CallEvent, now: Instant) {
        if self.status == CallStatus::Ended {
            debug!("Call ended, dropping {:?}", event);
            return;
        }

        let result = match event {
            CallEvent::Signal(message) => self.on_signal(message, now).await,
            CallEvent::Media {
                peer,
                generation,
                event,
            } => self.on_media_event(peer, generation, event, now).await,
            CallEvent::ToggleTrack { kind, enabled } => self.toggle_local_track(kind, enabled).await,
            CallEvent::ForceReconnect => {
                self.force_reconnect_all(now).await;
                Ok(())
            }
            CallEvent::Hangup => {
                self.hangup().await;
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!("Call {}: {}", self.descriptor.call_id, e);
        }
    }

    async fn on_signal(&mut self, message: SignalMessage, now: Instant) -> Result<(), CallError> {
        if let SignalMessage::Error { message } = &message {
            warn!("Relay error: {}", message);
            return Ok(());
        }
        if message.call_id() != Some(self.descriptor.call_id.as_str()) {
            debug!("Ignoring {} for another call", message.name());
            return Ok(());
        }
        if let Some(to) = message.recipient() {
            if to != &self.local.id {
                debug!("Ignoring {} addressed to {}", message.name(), to);
                return Ok(());
            }
        }

        match message {
            SignalMessage::ParticipantJoined { participant, .. } => {
                self.on_participant_joined(participant, now).await
            }
            SignalMessage::ParticipantLeft { participant_id, .. } => {
                self.on_participant_left(participant_id, now).await
            }
            SignalMessage::ExistingParticipants { participants, .. } => {
                self.on_existing_participants(participants, now).await
            }
            SignalMessage::Offer {
                from, description, ..
            } => self.on_offer(from, description, now).await,
            SignalMessage::Answer {
                from, description, ..
            } => self.on_answer(from, description).await,
            SignalMessage::IceCandidate {
                from, candidate, ..
            } => self.on_remote_candidate(from, candidate).await,
            SignalMessage::TrackStateChanged {
                from,
                kind,
                enabled,
                ..
            } => {
                self.on_remote_track_state(from, kind, enabled);
                Ok(())
            }
            SignalMessage::HubAssignment { hub, .. } => self.on_hub_assignment(hub).await,
            other => {
                debug!("Ignoring {}", other.name());
                Ok(())
            }
        }
    }

    async fn on_participant_joined(
        &mut self,
        record: ParticipantRecord,
        now: Instant,
    ) -> Result<(), CallError> {
        if record.id == self.local.id {
            return Ok(());
        }

        if self.descriptor.is_group() {
            self.admit_member(record);
            return self.rebalance_topology(now).await;
        }

        if self.descriptor.counterpart(&self.local.id) != Some(&record.id) {
            warn!("{} is not part of this direct call, ignoring", record.id);
            return Ok(());
        }
        let should_offer = self.descriptor.is_initiator(&self.local.id);
        self.admit_member(record.clone());
        if self.supervisor.is_permanently_failed(&record.id) {
            return Ok(());
        }
        self.open_peer(record, should_offer, now)?;
        Ok(())
    }

    fn admit_member(&mut self, record: ParticipantRecord) {
        let id = record.id.clone();
        let rejoined = self
            .registry
            .member(&id)
            .is_some_and(|known| record.joined_at > known.joined_at);
        if rejoined {
            // A newer join is a new instance: its old session and failures are history
            info!("{} re-joined call {}", id, self.descriptor.call_id);
            self.close_peer(&id);
            self.supervisor.clear_failure(&id);
        }
        if self.registry.upsert_member(record) {
            info!("{} joined call {}", id, self.descriptor.call_id);
        }
        self.remote_media
            .entry(id)
            .or_insert_with(|| RemoteMediaState::for_media(self.descriptor.media));
    }

    async fn on_participant_left(
        &mut self,
        id: ParticipantId,
        now: Instant,
    ) -> Result<(), CallError> {
        if id == self.local.id {
            return Ok(());
        }
        self.drop_participant(&id);
        if self.descriptor.is_group() {
            self.rebalance_topology(now).await?;
        }
        Ok(())
    }

    /// Forget a participant entirely; tolerates identities never seen
    fn drop_participant(&mut self, id: &ParticipantId) {
        let was_member = self.registry.remove_member(id).is_some();
        let had_session = self.close_peer(id);
        self.supervisor.forget(id);
        self.remote_media.remove(id);

        if was_member || had_session {
            info!("{} left call {}", id, self.descriptor.call_id);
            self.notify(CallNotice::ParticipantLeft { peer: id.clone() });
        }
    }

    /// Full membership from the relay (our join, or a resync)
    async fn on_existing_participants(
        &mut self,
        participants: Vec<ParticipantRecord>,
        now: Instant,
    ) -> Result<(), CallError> {
        debug!("Relay reports {} participants", participants.len());

        if !self.descriptor.is_group() {
            for record in participants {
                self.on_participant_joined(record, now).await?;
            }
            return Ok(());
        }

        let listed: BTreeSet<&ParticipantId> = participants.iter().map(|p| &p.id).collect();
        let departed: Vec<ParticipantId> = self
            .registry
            .member_ids()
            .into_iter()
            .filter(|id| !listed.contains(id))
            .collect();
        for id in departed {
            self.drop_participant(&id);
        }

        for record in participants {
            if record.id == self.local.id {
                // The relay's timestamp is the one every participant elects with
                self.local.joined_at = record.joined_at;
            } else {
                self.admit_member(record);
            }
        }

        self.rebalance_topology(now).await
    }

    async fn on_offer(
        &mut self,
        from: ParticipantId,
        description: SessionDescription,
        now: Instant,
    ) -> Result<(), CallError> {
        if !self.descriptor.is_group()
            && self.descriptor.counterpart(&self.local.id) != Some(&from)
        {
            warn!("Offer from {} who is not in this call, ignoring", from);
            return Ok(());
        }

        let needs_session = self.registry.session(&from).map_or(true, |s| s.is_closed());
        if needs_session {
            debug!("Offer from {} without a session, answering", from);
            let record = self
                .registry
                .member(&from)
                .cloned()
                .unwrap_or_else(|| ParticipantRecord::new(from.clone(), from.as_str()));
            if self.supervisor.is_permanently_failed(&from) {
                self.supervisor.clear_failure(&from);
            }
            self.open_peer(record, false, now)?;
        }

        let mut ctx = NegotiationContext {
            call_id: &self.descriptor.call_id,
            local: &self.local.id,
            signaling: self.signaling.as_mut(),
        };
        let Some(session) = self.registry.session_mut(&from) else {
            return Ok(());
        };
        let outcome = session.handle_offer(&mut ctx, description).await?;
        debug!("Offer from {}: {:?}", from, outcome);
        Ok(())
    }

    async fn on_answer(
        &mut self,
        from: ParticipantId,
        description: SessionDescription,
    ) -> Result<(), CallError> {
        match self.registry.session_mut(&from) {
            Some(session) => {
                session.handle_answer(description).await?;
            }
            None => debug!("Answer from {} without a session dropped", from),
        }
        Ok(())
    }

    async fn on_remote_candidate(
        &mut self,
        from: ParticipantId,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        match self.registry.session_mut(&from) {
            Some(session) => session.handle_ice_candidate(candidate).await,
            None => {
                self.registry.buffer_orphan_candidate(&from, candidate);
                Ok(())
            }
        }
    }

    fn on_remote_track_state(&mut self, from: ParticipantId, kind: TrackKind, enabled: bool) {
        let media = self.descriptor.media;
        self.remote_media
            .entry(from.clone())
            .or_insert_with(|| RemoteMediaState::for_media(media))
            .set(kind, enabled);
        debug!("{} {} {}", from, kind, if enabled { "on" } else { "off" });
        self.notify(CallNotice::RemoteTrackState {
            peer: from,
            kind,
            enabled,
        });
    }

    /// Another node announced a hub; a disagreement means our membership is stale
    async fn on_hub_assignment(&mut self, announced: ParticipantId) -> Result<(), CallError> {
        if !self.descriptor.is_group() {
            return Ok(());
        }
        let local_choice = self.topology.hub();
        if local_choice == Some(&announced) {
            return Ok(());
        }

        warn!(
            "Hub announced as {} but local election chose {}, resyncing membership",
            announced,
            local_choice.map_or("none", |h| h.as_str())
        );
        self.signaling
            .send(SignalMessage::GetCallParticipants {
                call_id: self.descriptor.call_id.clone(),
            })
            .await?;
        Ok(())
    }

    async fn on_media_event(
        &mut self,
        peer: ParticipantId,
        generation: u64,
        event: MediaEvent,
        now: Instant,
    ) -> Result<(), CallError> {
        if self
            .registry
            .session_for_generation(&peer, generation)
            .is_none()
        {
            debug!("Stale media event from {} (generation {})", peer, generation);
            return Ok(());
        }

        match event {
            MediaEvent::IceCandidate(candidate) => {
                self.signaling
                    .send(SignalMessage::IceCandidate {
                        call_id: self.descriptor.call_id.clone(),
                        from: self.local.id.clone(),
                        to: peer,
                        candidate,
                    })
                    .await?;
            }
            MediaEvent::Track(track) => self.on_remote_track(peer, generation, track),
            MediaEvent::StateChanged(state) => self.on_peer_state(peer, state, now),
        }
        Ok(())
    }

    fn on_remote_track(&mut self, peer: ParticipantId, generation: u64, track: MediaTrack) {
        let Some(session) = self.registry.session_for_generation(&peer, generation) else {
            return;
        };
        if !session.record_remote_track(track.clone()) {
            return;
        }

        info!(
            "{} track from {} (via {})",
            track.kind(),
            track.origin(),
            peer
        );
        self.notify(CallNotice::RemoteStream {
            via: peer,
            origin: track.origin().clone(),
            track,
        });

        if self.topology.is_hub() {
            self.reconcile_forwarding();
        }
    }

    fn on_peer_state(&mut self, peer: ParticipantId, state: MediaConnectionState, now: Instant) {
        // A connection closing underneath us is a failure to recover from
        let state = match ConnectionState::from(state) {
            ConnectionState::Closed => ConnectionState::Failed,
            other => other,
        };

        let Some(session) = self.registry.session_mut(&peer) else {
            return;
        };
        if session.set_state(state).is_none() {
            return;
        }
        let generation = session.generation();
        self.notify(CallNotice::PeerStateChanged {
            peer: peer.clone(),
            state,
        });

        match state {
            ConnectionState::Connected => {
                info!("Connected to {}", peer);
                self.supervisor.on_connected(&peer);
                self.timers.cancel_where(|kind| {
                    matches!(
                        kind,
                        TimerKind::FailureGrace { peer: p, .. }
                        | TimerKind::RestartCheck { peer: p, .. } if p == &peer
                    )
                });
                if self.status != CallStatus::Active {
                    self.set_status(CallStatus::Active);
                }
                if self.topology.is_hub() {
                    self.reconcile_forwarding();
                }
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                warn!("Connection to {} is {:?}", peer, state);
                if let RecoveryAction::ScheduleGrace(at) = self.supervisor.on_failure(&peer, now) {
                    self.timers
                        .schedule(at, TimerKind::FailureGrace { peer, generation });
                }
            }
            _ => {}
        }
    }

    async fn on_timer(&mut self, timer: TimerKind, now: Instant) {
        let result = match timer {
            TimerKind::SendOffer { peer, generation } => {
                self.send_offer(peer, generation, now).await
            }
            TimerKind::FailureGrace { peer, generation } => {
                self.on_failure_grace(peer, generation, now).await
            }
            TimerKind::RestartCheck { peer, generation } => {
                self.on_restart_check(peer, generation, now);
                Ok(())
            }
            TimerKind::Recreate { peer } => self.recreate_peer(peer, now),
            TimerKind::Reconcile => {
                if self.topology.is_hub() {
                    self.reconcile_forwarding();
                }
                self.timers
                    .schedule(now + self.config.reconcile_interval(), TimerKind::Reconcile);
                Ok(())
            }
            TimerKind::HealthScan => {
                let report = self.health_scan(now).await;
                debug!("Health scan: {:?}", report);
                self.timers
                    .schedule(now + self.config.health_interval(), TimerKind::HealthScan);
                Ok(())
            }
            TimerKind::Tick => {
                if matches!(self.status, CallStatus::Active | CallStatus::Reconnecting) {
                    self.duration.tick();
                }
                self.timers.schedule(now + TICK_INTERVAL, TimerKind::Tick);
                Ok(())
            }
            TimerKind::Rejoin => self.rejoin().await,
        };

        if let Err(e) = result {
            warn!("Call {}: timer failed: {}", self.descriptor.call_id, e);
        }
    }

    async fn send_offer(
        &mut self,
        peer: ParticipantId,
        generation: u64,
        now: Instant,
    ) -> Result<(), CallError> {
        let mut ctx = NegotiationContext {
            call_id: &self.descriptor.call_id,
            local: &self.local.id,
            signaling: self.signaling.as_mut(),
        };
        let Some(session) = self.registry.session_for_generation(&peer, generation) else {
            return Ok(());
        };
        if let Err(e) = session.send_offer(&mut ctx).await {
            // The session is fresh again; try once more after the usual delay
            self.timers.schedule(
                now + self.config.offer_delay(),
                TimerKind::SendOffer { peer, generation },
            );
            return Err(e);
        }
        Ok(())
    }

    async fn on_failure_grace(
        &mut self,
        peer: ParticipantId,
        generation: u64,
        now: Instant,
    ) -> Result<(), CallError> {
        let Some(session) = self.registry.session_for_generation(&peer, generation) else {
            self.supervisor.on_recreated(&peer);
            return Ok(());
        };
        let still_failed = !session.state().is_connected();

        match self.supervisor.on_grace_elapsed(&peer, now, still_failed) {
            RecoveryAction::RestartIce { check_at } => {
                self.timers
                    .schedule(check_at, TimerKind::RestartCheck { peer: peer.clone(), generation });

                let mut ctx = NegotiationContext {
                    call_id: &self.descriptor.call_id,
                    local: &self.local.id,
                    signaling: self.signaling.as_mut(),
                };
                if let Some(session) = self.registry.session_for_generation(&peer, generation) {
                    // The answering side waits for the offerer's restart
                    if session.should_offer() {
                        session.restart_ice(&mut ctx).await?;
                    }
                }
            }
            RecoveryAction::GiveUp => self.give_up(&peer),
            _ => {}
        }
        Ok(())
    }

    fn on_restart_check(&mut self, peer: ParticipantId, generation: u64, now: Instant) {
        let Some(session) = self.registry.session_for_generation(&peer, generation) else {
            self.supervisor.on_recreated(&peer);
            return;
        };
        let recovered = session.state().is_connected();

        if let RecoveryAction::Recreate { at } =
            self.supervisor.on_restart_check(&peer, now, recovered)
        {
            self.close_peer(&peer);
            self.timers.schedule(at, TimerKind::Recreate { peer });
        }
    }

    fn recreate_peer(&mut self, peer: ParticipantId, now: Instant) -> Result<(), CallError> {
        let Some(should_offer) = self.expected_role(&peer) else {
            debug!("{} no longer expected, not recreating", peer);
            self.supervisor.forget(&peer);
            return Ok(());
        };
        let Some(record) = self.registry.member(&peer).cloned() else {
            return Ok(());
        };

        info!("Recreating session with {}", peer);
        if let SessionOpen::Existing { .. } = self.open_peer(record, should_offer, now)? {
            self.supervisor.on_recreated(&peer);
        }
        Ok(())
    }

    fn give_up(&mut self, peer: &ParticipantId) {
        error!("Giving up on {}, marking degraded", peer);
        self.close_peer(peer);
        self.notify(CallNotice::PeerStateChanged {
            peer: peer.clone(),
            state: ConnectionState::Failed,
        });
        self.notify(CallNotice::PeerDegraded { peer: peer.clone() });
    }

    /// Whether a session with `peer` belongs in the current topology, and who offers
    fn expected_role(&self, peer: &ParticipantId) -> Option<bool> {
        if !self.registry.is_member(peer) {
            return None;
        }
        if self.descriptor.is_group() {
            self.topology.connection_plan(peer)
        } else if self.descriptor.counterpart(&self.local.id) == Some(peer) {
            Some(self.descriptor.is_initiator(&self.local.id))
        } else {
            None
        }
    }

    /// Open (or reuse) the session with `record`
    fn open_peer(
        &mut self,
        record: ParticipantRecord,
        should_offer: bool,
        now: Instant,
    ) -> Result<SessionOpen, CallError> {
        let id = record.id.clone();
        let opened =
            self.registry
                .open_session(record, should_offer, self.local_stream.tracks(), now)?;

        if let SessionOpen::Created { generation } = opened {
            self.timers.cancel_peer(&id);
            self.supervisor.on_recreated(&id);
            self.topology.forget(&id);
            if should_offer {
                self.timers.schedule(
                    now + self.config.offer_delay(),
                    TimerKind::SendOffer {
                        peer: id.clone(),
                        generation,
                    },
                );
            }
            self.notify(CallNotice::PeerStateChanged {
                peer: id,
                state: ConnectionState::Connecting,
            });
        }
        Ok(opened)
    }

    /// Close the session with `id` and cancel everything scheduled for it
    fn close_peer(&mut self, id: &ParticipantId) -> bool {
        let closed = self.registry.close_session(id);
        self.timers.cancel_peer(id);
        self.topology.forget(id);
        closed
    }

    /// Re-run the hub election and adjust sessions to the result
    async fn rebalance_topology(&mut self, now: Instant) -> Result<(), CallError> {
        let hub = elect_hub(
            self.registry
                .members()
                .chain(std::iter::once(&self.local)),
        );
        let change = self.topology.assign_hub(hub);

        if change.changed() {
            self.notify(CallNotice::HubChanged {
                hub: change.current.clone(),
                is_local: self.topology.is_hub(),
            });
            if self.topology.is_hub() {
                self.signaling
                    .send(SignalMessage::HubAssignment {
                        call_id: self.descriptor.call_id.clone(),
                        hub: self.local.id.clone(),
                    })
                    .await?;
            }
        }

        self.apply_topology(change.changed(), now);
        Ok(())
    }

    /// Hub: a session to every member. Spoke: one session, to the hub.
    fn apply_topology(&mut self, hub_changed: bool, now: Instant) {
        match self.topology.role() {
            Role::Undecided => {}
            Role::Hub => {
                let members: Vec<ParticipantRecord> = self.registry.members().cloned().collect();
                for record in members {
                    self.ensure_peer(record, true, hub_changed, now);
                }
            }
            Role::Spoke { hub } => {
                if hub_changed {
                    for id in self.registry.session_ids() {
                        if id != hub {
                            debug!("Closing session with {}: not the hub", id);
                            self.close_peer(&id);
                        }
                    }
                }
                if let Some(record) = self.registry.member(&hub).cloned() {
                    self.ensure_peer(record, false, hub_changed, now);
                }
            }
        }
    }

    fn ensure_peer(
        &mut self,
        record: ParticipantRecord,
        should_offer: bool,
        hub_changed: bool,
        now: Instant,
    ) {
        let id = record.id.clone();
        if self.supervisor.is_permanently_failed(&id) {
            return;
        }
        if hub_changed {
            let wrong_role = self
                .registry
                .session(&id)
                .is_some_and(|s| s.is_live() && s.should_offer() != should_offer);
            if wrong_role {
                debug!("Session with {} has the wrong role, replacing", id);
                self.close_peer(&id);
            }
        }
        if let Err(e) = self.open_peer(record, should_offer, now) {
            warn!("Could not open session with {}: {}", id, e);
        }
    }

    /// Forward every known track to every connected participant still missing it
    ///
    /// Only acts on the hub. Each (source track, target) pair is forwarded at
    /// most once, so running this repeatedly is harmless. Returns the tracks
    /// forwarded.
    pub fn reconcile_forwarding(&mut self) -> usize {
        if !self.topology.is_hub() {
            return 0;
        }

        let targets = self.registry.connected_ids();
        if targets.is_empty() {
            return 0;
        }

        let mut streams: HashMap<ParticipantId, Vec<MediaTrack>> = HashMap::new();
        for session in self.registry.sessions() {
            let tracks = session.own_remote_tracks();
            if !tracks.is_empty() {
                streams.insert(session.remote_id().clone(), tracks);
            }
        }

        let mut sources: BTreeMap<ParticipantId, Vec<String>> = streams
            .iter()
            .map(|(id, tracks)| (id.clone(), tracks.iter().map(|t| t.id().to_string()).collect()))
            .collect();
        sources.insert(
            self.local.id.clone(),
            self.local_stream
                .tracks()
                .iter()
                .map(|t| t.id().to_string())
                .collect(),
        );

        let mut forwarded = 0;
        for gap in self.topology.missing_forwards(&sources, &targets) {
            if gap.source == self.local.id {
                // Our own tracks were attached when the session was created
                for track in &gap.tracks {
                    self.topology.record_forwarded(&gap.source, &gap.target, track);
                }
                continue;
            }

            let Some(tracks) = streams.get(&gap.source) else {
                continue;
            };
            let Some(session) = self.registry.session_mut(&gap.target) else {
                continue;
            };
            for track in tracks.iter().filter(|t| gap.tracks.iter().any(|id| id == t.id())) {
                match session.add_forwarded_track(track) {
                    Ok(()) => {
                        debug!("Forwarded {} from {} to {}", track.id(), gap.source, gap.target);
                        self.topology
                            .record_forwarded(&gap.source, &gap.target, track.id());
                        forwarded += 1;
                    }
                    Err(e) => warn!(
                        "Forwarding {} from {} to {} failed: {}",
                        track.id(),
                        gap.source,
                        gap.target,
                        e
                    ),
                }
            }
        }

        if forwarded > 0 {
            info!("Reconciliation forwarded {} track(s)", forwarded);
        }
        forwarded
    }

    /// Cross-check expected peers against connected ones
    ///
    /// Opens missing sessions, treats sessions stuck connecting as failed, and
    /// escalates to a full reconnect when every expected peer is degraded.
    pub async fn health_scan(&mut self, now: Instant) -> HealthReport {
        let expected: Vec<(ParticipantId, bool)> = self
            .registry
            .member_ids()
            .into_iter()
            .filter_map(|id| self.expected_role(&id).map(|offer| (id, offer)))
            .collect();

        let mut report = HealthReport {
            expected: expected.len(),
            ..HealthReport::default()
        };
        let connect_timeout = self.config.connect_timeout();

        for (id, should_offer) in expected {
            if self.supervisor.is_permanently_failed(&id) {
                report.degraded += 1;
                continue;
            }
            if self.supervisor.is_recovering(&id) {
                continue;
            }

            let Some(session) = self.registry.session(&id) else {
                warn!("Expected session with {} is missing, creating", id);
                if let Some(record) = self.registry.member(&id).cloned() {
                    if let Err(e) = self.open_peer(record, should_offer, now) {
                        warn!("Could not open session with {}: {}", id, e);
                    }
                }
                continue;
            };

            if session.state().is_connected() {
                report.connected += 1;
            } else if session.is_stalled(now, connect_timeout) || session.state().is_failing() {
                warn!("Session with {} stuck in {:?}", id, session.state());
                let generation = session.generation();
                if let RecoveryAction::ScheduleGrace(at) = self.supervisor.on_failure(&id, now) {
                    self.timers.schedule(
                        at,
                        TimerKind::FailureGrace {
                            peer: id.clone(),
                            generation,
                        },
                    );
                }
            }
        }

        let all_degraded = report.expected > 0 && report.degraded == report.expected;
        if all_degraded && self.full_reconnects < self.config.max_full_reconnects {
            self.full_reconnects += 1;
            warn!(
                "Every peer degraded, full reconnect {}/{}",
                self.full_reconnects, self.config.max_full_reconnects
            );
            self.force_reconnect_all(now).await;
        }

        report
    }

    /// Tear down every session and the topology, then re-join from scratch
    pub async fn force_reconnect_all(&mut self, now: Instant) {
        info!("Reconnecting call {} from scratch", self.descriptor.call_id);

        if let Err(e) = self
            .signaling
            .send(SignalMessage::LeaveCall {
                call_id: self.descriptor.call_id.clone(),
                participant_id: self.local.id.clone(),
            })
            .await
        {
            warn!("Failed to send leave before reconnect: {}", e);
        }

        self.registry.close_all();
        self.registry.clear_members();
        self.remote_media.clear();
        self.topology.reset();
        self.supervisor.reset();
        self.timers.cancel_peer_timers();
        self.timers.cancel_where(|kind| matches!(kind, TimerKind::Rejoin));

        self.set_status(CallStatus::Reconnecting);
        self.timers
            .schedule(now + self.config.rejoin_delay(), TimerKind::Rejoin);
    }

    async fn rejoin(&mut self) -> Result<(), CallError> {
        info!("Re-joining call {}", self.descriptor.call_id);
        self.signaling
            .send(SignalMessage::JoinCall {
                call_id: self.descriptor.call_id.clone(),
                participant: self.local.clone(),
            })
            .await?;
        Ok(())
    }

    /// Flip a local track and tell every member; never renegotiates
    async fn toggle_local_track(&mut self, kind: TrackKind, enabled: bool) -> Result<(), CallError> {
        if kind == TrackKind::Video && !self.descriptor.media.has_video() {
            debug!("Audio-only call, ignoring video toggle");
            return Ok(());
        }

        self.local_stream.set_enabled(kind, enabled);
        let senders: usize = self
            .registry
            .sessions_mut()
            .map(|s| s.set_local_senders_enabled(&self.local.id, kind, enabled))
            .sum();
        info!(
            "Local {} {} ({} senders)",
            kind,
            if enabled { "enabled" } else { "disabled" },
            senders
        );

        for member in self.registry.member_ids() {
            self.signaling
                .send(SignalMessage::TrackStateChanged {
                    call_id: self.descriptor.call_id.clone(),
                    from: self.local.id.clone(),
                    to: member,
                    kind,
                    enabled,
                })
                .await?;
        }
        Ok(())
    }

    /// Leave the call and release everything; safe to call repeatedly
    pub async fn hangup(&mut self) {
        if self.status == CallStatus::Ended {
            return;
        }

        if self.status != CallStatus::Idle {
            if let Err(e) = self
                .signaling
                .send(SignalMessage::LeaveCall {
                    call_id: self.descriptor.call_id.clone(),
                    participant_id: self.local.id.clone(),
                })
                .await
            {
                warn!("Failed to send leave: {}", e);
            }
        }

        self.registry.close_all();
        self.registry.clear_members();
        self.local_stream.stop();
        self.remote_media.clear();
        self.topology.reset();
        self.supervisor.reset();
        self.timers.cancel_all();

        info!(
            "Call {} ended after {}",
            self.descriptor.call_id, self.duration
        );
        self.set_status(CallStatus::Ended);
        self.notify(CallNotice::CallEnded {
            duration: self.duration,
        });
    }

    fn set_status(&mut self, status: CallStatus) {
        if self.status == status {
            return;
        }
        debug!("Call status {} -> {}", self.status, status);
        self.status = status;
        self.notify(CallNotice::StatusChanged(status));
    }

    fn notify(&self, notice: CallNotice) {
        // No subscribers is fine
        let _ = self.notices.send(notice);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
