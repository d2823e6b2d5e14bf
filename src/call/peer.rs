//! Peer session: negotiation state machine for one remote participant
//!
//! A session owns exactly one media connection. Messages for it may arrive in
//! any order (an ICE candidate before its offer, an answer nobody asked for), so
//! every mutating step first checks the description flags below instead of
//! assuming the "expected" sequence.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::error::CallError;
use super::media::{MediaConnection, MediaTrack};
use super::types::{
    ConnectionState, IceCandidate, ParticipantId, ParticipantRecord, SessionDescription, TrackKind,
};
use crate::network::SignalingChannel;
use crate::protocol::SignalMessage;

/// Call-wide values a session needs while negotiating
pub struct NegotiationContext<'a> {
    pub call_id: &'a str,
    pub local: &'a ParticipantId,
    pub signaling: &'a mut dyn SignalingChannel,
}

/// Result of handling an inbound offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    /// Remote description applied and an answer sent
    Answered,
    /// Glare: our identity orders after the remote one, so our offer stands
    KeptLocalOffer,
    /// Same offer already answered
    Duplicate,
    Closed,
}

pub struct PeerSession {
    remote: ParticipantRecord,
    connection: Box<dyn MediaConnection>,
    generation: u64,
    should_offer: bool,
    local_description_set: bool,
    remote_description_set: bool,
    offer_sent: bool,
    answer_sent: bool,
    last_remote_offer: Option<String>,
    /// Candidates received before the remote description; applied in arrival order
    pending_candidates: VecDeque<IceCandidate>,
    state: ConnectionState,
    senders: Vec<MediaTrack>,
    remote_tracks: Vec<MediaTrack>,
    created_at: Instant,
}

impl PeerSession {
    pub fn new(
        remote: ParticipantRecord,
        connection: Box<dyn MediaConnection>,
        generation: u64,
        should_offer: bool,
        now: Instant,
    ) -> Self {
        Self {
            remote,
            connection,
            generation,
            should_offer,
            local_description_set: false,
            remote_description_set: false,
            offer_sent: false,
            answer_sent: false,
            last_remote_offer: None,
            pending_candidates: VecDeque::new(),
            state: ConnectionState::Connecting,
            senders: Vec::new(),
            remote_tracks: Vec::new(),
            created_at: now,
        }
    }

    pub fn remote(&self) -> &ParticipantRecord {
        &self.remote
    }

    pub fn remote_id(&self) -> &ParticipantId {
        &self.remote.id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn should_offer(&self) -> bool {
        self.should_offer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn local_description_set(&self) -> bool {
        self.local_description_set
    }

    pub fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    pub fn offer_sent(&self) -> bool {
        self.offer_sent
    }

    pub fn answer_sent(&self) -> bool {
        self.answer_sent
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn senders(&self) -> &[MediaTrack] {
        &self.senders
    }

    pub fn remote_tracks(&self) -> &[MediaTrack] {
        &self.remote_tracks
    }

    /// Tracks captured by the remote participant itself, excluding relayed ones
    pub fn own_remote_tracks(&self) -> Vec<MediaTrack> {
        self.remote_tracks
            .iter()
            .filter(|t| t.origin() == &self.remote.id)
            .cloned()
            .collect()
    }

    /// An offer of ours is outstanding and unanswered
    pub fn has_pending_local_offer(&self) -> bool {
        self.offer_sent && !self.remote_description_set
    }

    /// No description has been exchanged yet in either direction
    pub fn is_fresh(&self) -> bool {
        !self.offer_sent && !self.remote_description_set && !self.local_description_set
    }

    /// Still connecting after `timeout`
    pub fn is_stalled(&self, now: Instant, timeout: Duration) -> bool {
        matches!(self.state, ConnectionState::New | ConnectionState::Connecting)
            && now.saturating_duration_since(self.created_at) >= timeout
    }

    /// Attach the local capture tracks as outbound senders
    pub fn attach_local_tracks(&mut self, tracks: &[MediaTrack]) -> Result<(), CallError> {
        for track in tracks {
            self.connection.add_track(track)?;
            self.senders.push(track.clone());
        }
        Ok(())
    }

    /// Relay another participant's track over this established connection
    ///
    /// No renegotiation is started here.
    pub fn add_forwarded_track(&mut self, track: &MediaTrack) -> Result<(), CallError> {
        let forwarded = track.forward_clone();
        self.connection.add_track(&forwarded)?;
        self.senders.push(forwarded);
        Ok(())
    }

    /// Record a remote track; returns false for a track already known
    pub fn record_remote_track(&mut self, track: MediaTrack) -> bool {
        if self.remote_tracks.iter().any(|t| t.id() == track.id()) {
            return false;
        }
        self.remote_tracks.push(track);
        true
    }

    /// Flip every outbound sender carrying our own capture of `kind`
    pub fn set_local_senders_enabled(
        &mut self,
        local: &ParticipantId,
        kind: TrackKind,
        enabled: bool,
    ) -> usize {
        let mut updated = 0;
        for sender in self
            .senders
            .iter()
            .filter(|s| s.kind() == kind && s.origin() == local)
        {
            sender.set_enabled(enabled);
            updated += 1;
        }
        updated
    }

    /// Apply a state reported by the media connection; returns the previous
    /// state when it changed
    pub fn set_state(&mut self, state: ConnectionState) -> Option<ConnectionState> {
        if self.is_closed() || self.state == state {
            return None;
        }
        let previous = self.state;
        self.state = state;
        debug!(
            "Session {} state {:?} -> {:?}",
            self.remote.id, previous, state
        );
        Some(previous)
    }

    /// Queue candidates that arrived before this session existed
    pub fn buffer_candidates(&mut self, candidates: impl IntoIterator<Item = IceCandidate>) {
        self.pending_candidates.extend(candidates);
    }

    /// Create and send the initial offer
    ///
    /// Returns false without doing anything once negotiation has started in
    /// either direction.
    pub async fn send_offer(&mut self, ctx: &mut NegotiationContext<'_>) -> Result<bool, CallError> {
        if self.is_closed() || !self.is_fresh() {
            debug!(
                "Skipping offer to {}: negotiation already started",
                self.remote.id
            );
            return Ok(false);
        }
        self.offer(ctx, false).await?;
        Ok(true)
    }

    /// Re-negotiate ICE in place without replacing the connection
    pub async fn restart_ice(&mut self, ctx: &mut NegotiationContext<'_>) -> Result<(), CallError> {
        if self.is_closed() {
            return Ok(());
        }
        info!("Restarting ICE with {}", self.remote.id);
        self.begin_round();
        self.offer(ctx, true).await
    }

    async fn offer(
        &mut self,
        ctx: &mut NegotiationContext<'_>,
        ice_restart: bool,
    ) -> Result<(), CallError> {
        let offer = self.connection.create_offer(ice_restart).await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.local_description_set = true;

        let sent = ctx
            .signaling
            .send(SignalMessage::Offer {
                call_id: ctx.call_id.to_string(),
                from: ctx.local.clone(),
                to: self.remote.id.clone(),
                description: offer,
            })
            .await;
        if let Err(e) = sent {
            // An offer nobody received must not block the next attempt
            warn!("Failed to send offer to {}: {}", self.remote.id, e);
            self.connection.rollback_local_description().await?;
            self.local_description_set = false;
            return Err(e.into());
        }
        self.offer_sent = true;

        debug!("Offer sent to {}", self.remote.id);
        Ok(())
    }

    /// Handle an inbound offer, resolving glare by identity order
    ///
    /// When both sides have an unanswered offer, the side whose identity orders
    /// first rolls back and answers; the other keeps its own offer. Both sides
    /// reach the same decision regardless of which evaluates first.
    pub async fn handle_offer(
        &mut self,
        ctx: &mut NegotiationContext<'_>,
        offer: SessionDescription,
    ) -> Result<OfferOutcome, CallError> {
        if self.is_closed() {
            return Ok(OfferOutcome::Closed);
        }

        if self.has_pending_local_offer() {
            if ctx.local < &self.remote.id {
                debug!("Glare with {}: rolling back local offer", self.remote.id);
                self.connection.rollback_local_description().await?;
                self.local_description_set = false;
                self.offer_sent = false;
            } else {
                debug!("Glare with {}: keeping local offer", self.remote.id);
                return Ok(OfferOutcome::KeptLocalOffer);
            }
        } else if self.remote_description_set {
            if self.answer_sent && self.last_remote_offer.as_deref() == Some(offer.sdp.as_str()) {
                debug!("Duplicate offer from {} ignored", self.remote.id);
                return Ok(OfferOutcome::Duplicate);
            }
            debug!("Renegotiation offer from {}", self.remote.id);
            self.begin_round();
        }

        let sdp = offer.sdp.clone();
        self.connection.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.last_remote_offer = Some(sdp);
        self.flush_candidates().await;

        if self.answer_sent {
            return Ok(OfferOutcome::Duplicate);
        }

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.local_description_set = true;

        ctx.signaling
            .send(SignalMessage::Answer {
                call_id: ctx.call_id.to_string(),
                from: ctx.local.clone(),
                to: self.remote.id.clone(),
                description: answer,
            })
            .await?;
        self.answer_sent = true;

        debug!("Answer sent to {}", self.remote.id);
        Ok(OfferOutcome::Answered)
    }

    /// Apply an answer to our outstanding offer
    ///
    /// Returns false (and changes nothing) when no offer of ours is waiting.
    pub async fn handle_answer(&mut self, answer: SessionDescription) -> Result<bool, CallError> {
        if self.is_closed() || !self.has_pending_local_offer() {
            debug!("Unexpected answer from {} ignored", self.remote.id);
            return Ok(false);
        }

        self.connection.set_remote_description(answer).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        debug!("Answer from {} applied", self.remote.id);
        Ok(true)
    }

    /// Apply a remote candidate, or buffer it until the remote description exists
    pub async fn handle_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), CallError> {
        if self.is_closed() {
            return Ok(());
        }

        if !self.remote_description_set {
            self.pending_candidates.push_back(candidate);
            debug!(
                "Buffered candidate from {} ({} pending)",
                self.remote.id,
                self.pending_candidates.len()
            );
            return Ok(());
        }

        self.connection.add_ice_candidate(candidate).await?;
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        if self.pending_candidates.is_empty() {
            return;
        }
        debug!(
            "Applying {} buffered candidates from {}",
            self.pending_candidates.len(),
            self.remote.id
        );
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!("Buffered candidate from {} rejected: {}", self.remote.id, e);
            }
        }
    }

    fn begin_round(&mut self) {
        self.local_description_set = false;
        self.remote_description_set = false;
        self.offer_sent = false;
        self.answer_sent = false;
    }

    /// Release the media connection and every sender/receiver handle
    pub fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        self.connection.close();
        self.senders.clear();
        self.remote_tracks.clear();
        self.pending_candidates.clear();
        self.state = ConnectionState::Closed;
        info!("Session with {} closed", self.remote.id);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}
