//! Session registry: call membership and the peer sessions derived from it
//!
//! The registry is the only owner of peer sessions. It guarantees at most one
//! non-closed session per remote identity: opening a session for an identity
//! with a live one returns the existing session, and a failed one is replaced.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::CallError;
use super::media::{MediaConnectionFactory, MediaEventSink, MediaTrack};
use super::orchestrator::CallEvent;
use super::peer::PeerSession;
use super::types::{IceCandidate, ParticipantId, ParticipantRecord};

/// Outcome of [`SessionRegistry::open_session`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOpen {
    Existing { generation: u64 },
    Created { generation: u64 },
}

impl SessionOpen {
    pub fn generation(&self) -> u64 {
        match self {
            Self::Existing { generation } | Self::Created { generation } => *generation,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

pub struct SessionRegistry {
    factory: Box<dyn MediaConnectionFactory>,
    events: mpsc::UnboundedSender<CallEvent>,
    /// Remote members of the call (never includes the local participant)
    members: BTreeMap<ParticipantId, ParticipantRecord>,
    sessions: HashMap<ParticipantId, PeerSession>,
    /// Candidates from identities that have no session yet
    orphan_candidates: HashMap<ParticipantId, VecDeque<IceCandidate>>,
    orphan_limit: usize,
    next_generation: u64,
}

impl SessionRegistry {
    pub fn new(
        factory: Box<dyn MediaConnectionFactory>,
        events: mpsc::UnboundedSender<CallEvent>,
        orphan_limit: usize,
    ) -> Self {
        Self {
            factory,
            events,
            members: BTreeMap::new(),
            sessions: HashMap::new(),
            orphan_candidates: HashMap::new(),
            orphan_limit,
            next_generation: 1,
        }
    }

    /// Add or refresh a member; returns true if the identity was not known
    pub fn upsert_member(&mut self, record: ParticipantRecord) -> bool {
        self.members.insert(record.id.clone(), record).is_none()
    }

    pub fn remove_member(&mut self, id: &ParticipantId) -> Option<ParticipantRecord> {
        self.orphan_candidates.remove(id);
        self.members.remove(id)
    }

    pub fn clear_members(&mut self) {
        self.members.clear();
        self.orphan_candidates.clear();
    }

    pub fn member(&self, id: &ParticipantId) -> Option<&ParticipantRecord> {
        self.members.get(id)
    }

    pub fn is_member(&self, id: &ParticipantId) -> bool {
        self.members.contains_key(id)
    }

    pub fn members(&self) -> impl Iterator<Item = &ParticipantRecord> {
        self.members.values()
    }

    pub fn member_ids(&self) -> Vec<ParticipantId> {
        self.members.keys().cloned().collect()
    }

    pub fn session(&self, id: &ParticipantId) -> Option<&PeerSession> {
        self.sessions.get(id)
    }

    pub fn session_mut(&mut self, id: &ParticipantId) -> Option<&mut PeerSession> {
        self.sessions.get_mut(id)
    }

    /// Session for `id` only if it belongs to `generation`
    pub fn session_for_generation(
        &mut self,
        id: &ParticipantId,
        generation: u64,
    ) -> Option<&mut PeerSession> {
        self.sessions
            .get_mut(id)
            .filter(|s| s.generation() == generation && !s.is_closed())
    }

    pub fn has_live_session(&self, id: &ParticipantId) -> bool {
        self.sessions.get(id).is_some_and(|s| s.is_live())
    }

    pub fn sessions(&self) -> impl Iterator<Item = &PeerSession> {
        self.sessions.values()
    }

    pub fn sessions_mut(&mut self) -> impl Iterator<Item = &mut PeerSession> {
        self.sessions.values_mut()
    }

    pub fn session_ids(&self) -> Vec<ParticipantId> {
        self.sessions.keys().cloned().collect()
    }

    pub fn connected_ids(&self) -> Vec<ParticipantId> {
        self.sessions
            .values()
            .filter(|s| s.state().is_connected())
            .map(|s| s.remote_id().clone())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Open a session for `remote`, reusing a live one (idempotent)
    ///
    /// A session that is failing or closed is closed and replaced. Candidates
    /// buffered for the identity before it had a session are handed over.
    pub fn open_session(
        &mut self,
        remote: ParticipantRecord,
        should_offer: bool,
        local_tracks: &[MediaTrack],
        now: Instant,
    ) -> Result<SessionOpen, CallError> {
        if let Some(existing) = self.sessions.get(&remote.id) {
            if existing.is_live() {
                debug!("Session with {} already exists", remote.id);
                return Ok(SessionOpen::Existing {
                    generation: existing.generation(),
                });
            }
        }

        if let Some(mut stale) = self.sessions.remove(&remote.id) {
            stale.close();
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let sink = MediaEventSink::new(remote.id.clone(), generation, self.events.clone());
        let connection = self.factory.create(&remote.id, sink)?;

        let id = remote.id.clone();
        let mut session = PeerSession::new(remote, connection, generation, should_offer, now);
        session.attach_local_tracks(local_tracks)?;

        if let Some(orphans) = self.orphan_candidates.remove(&id) {
            debug!("Handing {} early candidates to {}", orphans.len(), id);
            session.buffer_candidates(orphans);
        }

        info!(
            "Created session with {} (generation {}, offer: {})",
            id, generation, should_offer
        );
        self.sessions.insert(id, session);

        Ok(SessionOpen::Created { generation })
    }

    /// Close and remove the session for `id`; tolerates unknown identities
    pub fn close_session(&mut self, id: &ParticipantId) -> bool {
        match self.sessions.remove(id) {
            Some(mut session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close();
        }
        self.orphan_candidates.clear();
    }

    /// Keep a candidate for an identity that has no session yet
    pub fn buffer_orphan_candidate(&mut self, from: &ParticipantId, candidate: IceCandidate) {
        let queue = self.orphan_candidates.entry(from.clone()).or_default();
        if queue.len() >= self.orphan_limit {
            warn!("Dropping candidate from {}: no session and buffer full", from);
            return;
        }
        queue.push_back(candidate);
    }

    pub fn orphan_candidates(&self, id: &ParticipantId) -> usize {
        self.orphan_candidates.get(id).map_or(0, |q| q.len())
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}
