//! Reconnection supervisor: bounded per-peer recovery
//!
//! Recovery for a peer walks through a fixed ladder:
//!
//! ```text
//! failed/disconnected -> grace delay -> ICE restart -> check -> recreate (backoff)
//! ```
//!
//! Each pass through the ladder counts as one attempt. Once the attempts exceed
//! the configured bound the peer is marked permanently failed and left alone.
//! The supervisor only decides; the orchestrator owns the timers and sessions.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::config::CallConfig;
use super::types::ParticipantId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub grace: Duration,
    pub restart_check: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    /// Recreate delay for the given attempt (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << exponent);
        delay.min(self.backoff_max)
    }
}

impl From<&CallConfig> for RetryPolicy {
    fn from(config: &CallConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            grace: config.failure_grace(),
            restart_check: config.restart_check(),
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPhase {
    #[default]
    Idle,
    GracePending,
    IceRestarting,
    Recreating,
}

/// Recovery bookkeeping for one remote identity
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    pub attempts: u32,
    pub last_attempt: Option<Instant>,
    pub next_eligible: Option<Instant>,
    pub phase: RecoveryPhase,
    pub permanently_failed: bool,
}

/// What the orchestrator should do next for a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    None,
    /// Re-check the peer once the grace delay has elapsed
    ScheduleGrace(Instant),
    /// Restart ICE in place, then check again at `check_at`
    RestartIce { check_at: Instant },
    /// Close the session and recreate it at `at`
    Recreate { at: Instant },
    /// Bound exceeded: mark the peer degraded and stop retrying
    GiveUp,
}

pub struct ReconnectionSupervisor {
    policy: RetryPolicy,
    peers: HashMap<ParticipantId, RetryState>,
}

impl ReconnectionSupervisor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            peers: HashMap::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn state(&self, peer: &ParticipantId) -> Option<&RetryState> {
        self.peers.get(peer)
    }

    pub fn attempts(&self, peer: &ParticipantId) -> u32 {
        self.peers.get(peer).map_or(0, |s| s.attempts)
    }

    pub fn is_recovering(&self, peer: &ParticipantId) -> bool {
        self.peers
            .get(peer)
            .is_some_and(|s| s.phase != RecoveryPhase::Idle)
    }

    pub fn is_permanently_failed(&self, peer: &ParticipantId) -> bool {
        self.peers.get(peer).is_some_and(|s| s.permanently_failed)
    }

    pub fn permanently_failed(&self) -> Vec<ParticipantId> {
        self.peers
            .iter()
            .filter(|(_, s)| s.permanently_failed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// The peer reached `connected`: recovery is over and the counter resets
    pub fn on_connected(&mut self, peer: &ParticipantId) {
        if let Some(state) = self.peers.remove(peer) {
            if state.attempts > 0 {
                info!(
                    "Peer {} recovered after {} attempt(s)",
                    peer, state.attempts
                );
            }
        }
    }

    /// A failed/disconnected signal arrived for `peer`
    ///
    /// Repeated signals while recovery is already running are absorbed.
    pub fn on_failure(&mut self, peer: &ParticipantId, now: Instant) -> RecoveryAction {
        let state = self.peers.entry(peer.clone()).or_default();
        if state.permanently_failed || state.phase != RecoveryPhase::Idle {
            return RecoveryAction::None;
        }

        state.phase = RecoveryPhase::GracePending;
        let at = now + self.policy.grace;
        state.next_eligible = Some(at);
        debug!("Peer {} failing, grace until {:?}", peer, self.policy.grace);
        RecoveryAction::ScheduleGrace(at)
    }

    /// The grace delay elapsed; `still_failed` is false if the peer came back
    pub fn on_grace_elapsed(
        &mut self,
        peer: &ParticipantId,
        now: Instant,
        still_failed: bool,
    ) -> RecoveryAction {
        let Some(state) = self.peers.get_mut(peer) else {
            return RecoveryAction::None;
        };
        if state.phase != RecoveryPhase::GracePending {
            return RecoveryAction::None;
        }
        if !still_failed {
            state.phase = RecoveryPhase::Idle;
            return RecoveryAction::None;
        }

        state.attempts += 1;
        state.last_attempt = Some(now);

        if state.attempts > self.policy.max_retries {
            state.phase = RecoveryPhase::Idle;
            state.permanently_failed = true;
            state.next_eligible = None;
            warn!(
                "Peer {} failed {} times, giving up",
                peer, state.attempts
            );
            return RecoveryAction::GiveUp;
        }

        info!(
            "Recovery attempt {}/{} for {}: restarting ICE",
            state.attempts, self.policy.max_retries, peer
        );
        state.phase = RecoveryPhase::IceRestarting;
        let check_at = now + self.policy.restart_check;
        state.next_eligible = Some(check_at);
        RecoveryAction::RestartIce { check_at }
    }

    /// The ICE restart check elapsed; `recovered` is true if the peer came back
    pub fn on_restart_check(
        &mut self,
        peer: &ParticipantId,
        now: Instant,
        recovered: bool,
    ) -> RecoveryAction {
        let Some(state) = self.peers.get_mut(peer) else {
            return RecoveryAction::None;
        };
        if state.phase != RecoveryPhase::IceRestarting {
            return RecoveryAction::None;
        }
        if recovered {
            state.phase = RecoveryPhase::Idle;
            return RecoveryAction::None;
        }

        state.phase = RecoveryPhase::Recreating;
        let at = now + self.policy.backoff(state.attempts);
        state.next_eligible = Some(at);
        info!(
            "ICE restart did not recover {}, recreating in {:?}",
            peer,
            at - now
        );
        RecoveryAction::Recreate { at }
    }

    /// A fresh session was created for the peer
    pub fn on_recreated(&mut self, peer: &ParticipantId) {
        if let Some(state) = self.peers.get_mut(peer) {
            state.phase = RecoveryPhase::Idle;
            state.next_eligible = None;
        }
    }

    /// Allow a permanently failed peer to be tried again (it reached out to us)
    pub fn clear_failure(&mut self, peer: &ParticipantId) {
        if let Some(state) = self.peers.get_mut(peer) {
            if state.permanently_failed {
                info!("Peer {} is back, clearing failure", peer);
            }
        }
        self.peers.remove(peer);
    }

    pub fn forget(&mut self, peer: &ParticipantId) {
        self.peers.remove(peer);
    }

    pub fn reset(&mut self) {
        self.peers.clear();
    }
}
