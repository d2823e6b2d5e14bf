//! Cancellable timer queue for the call event loop
//!
//! Timers are plain data owned by the orchestrator. Cancelling a peer's timers
//! removes them from the queue, so a closed session can never be revived by a
//! late callback.

use std::collections::BTreeMap;
use std::time::Instant;

use super::types::ParticipantId;

/// Work scheduled for a future instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Send the initial offer for a session
    SendOffer { peer: ParticipantId, generation: u64 },
    /// Grace period after a failed/disconnected signal has elapsed
    FailureGrace { peer: ParticipantId, generation: u64 },
    /// Check whether an ICE restart brought the session back
    RestartCheck { peer: ParticipantId, generation: u64 },
    /// Recreate a closed session from scratch
    Recreate { peer: ParticipantId },
    /// Hub forwarding reconciliation pass
    Reconcile,
    /// Expected-vs-connected health scan
    HealthScan,
    /// One-second call duration tick
    Tick,
    /// Re-send join-call after a forced reconnect
    Rejoin,
}

impl TimerKind {
    pub fn peer(&self) -> Option<&ParticipantId> {
        match self {
            Self::SendOffer { peer, .. }
            | Self::FailureGrace { peer, .. }
            | Self::RestartCheck { peer, .. }
            | Self::Recreate { peer } => Some(peer),
            Self::Reconcile | Self::HealthScan | Self::Tick | Self::Rejoin => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    entries: BTreeMap<(Instant, u64), TimerKind>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, at: Instant, kind: TimerKind) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((at, seq), kind);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Pop the earliest timer due at or before `now`
    pub fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        let key = *self.entries.keys().next()?;
        if key.0 > now {
            return None;
        }
        self.entries.remove(&key)
    }

    /// Remove every timer belonging to `peer`; returns how many were removed
    pub fn cancel_peer(&mut self, peer: &ParticipantId) -> usize {
        self.cancel_where(|kind| kind.peer() == Some(peer))
    }

    /// Remove every per-peer timer, keeping call-wide periodic ones
    pub fn cancel_peer_timers(&mut self) -> usize {
        self.cancel_where(|kind| kind.peer().is_some())
    }

    pub fn cancel_all(&mut self) {
        self.entries.clear();
    }

    pub fn cancel_where(&mut self, mut predicate: impl FnMut(&TimerKind) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, kind| !predicate(kind));
        before - self.entries.len()
    }

    pub fn contains(&self, kind: &TimerKind) -> bool {
        self.entries.values().any(|k| k == kind)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
