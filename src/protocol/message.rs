//! Signaling messages exchanged between participants and the relay
//!
//! Messages are JSON objects tagged by `type` (kebab-case) with the payload
//! under `data`.

use serde::{Deserialize, Serialize};

use crate::call::{IceCandidate, ParticipantId, ParticipantRecord, SessionDescription, TrackKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SignalMessage {
    // Client -> Relay
    JoinCall {
        call_id: String,
        participant: ParticipantRecord,
    },
    LeaveCall {
        call_id: String,
        participant_id: ParticipantId,
    },
    GetCallParticipants {
        call_id: String,
    },

    // Relay -> Client
    ParticipantJoined {
        call_id: String,
        participant: ParticipantRecord,
    },
    ParticipantLeft {
        call_id: String,
        participant_id: ParticipantId,
    },
    ExistingParticipants {
        call_id: String,
        participants: Vec<ParticipantRecord>,
    },

    // Client -> Relay -> Client, addressed
    Offer {
        call_id: String,
        from: ParticipantId,
        to: ParticipantId,
        description: SessionDescription,
    },
    Answer {
        call_id: String,
        from: ParticipantId,
        to: ParticipantId,
        description: SessionDescription,
    },
    IceCandidate {
        call_id: String,
        from: ParticipantId,
        to: ParticipantId,
        candidate: IceCandidate,
    },
    TrackStateChanged {
        call_id: String,
        from: ParticipantId,
        to: ParticipantId,
        kind: TrackKind,
        enabled: bool,
    },

    // Client -> Relay -> every other member
    HubAssignment {
        call_id: String,
        hub: ParticipantId,
    },

    Error {
        message: String,
    },
}

impl SignalMessage {
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::JoinCall { call_id, .. }
            | Self::LeaveCall { call_id, .. }
            | Self::GetCallParticipants { call_id }
            | Self::ParticipantJoined { call_id, .. }
            | Self::ParticipantLeft { call_id, .. }
            | Self::ExistingParticipants { call_id, .. }
            | Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::TrackStateChanged { call_id, .. }
            | Self::HubAssignment { call_id, .. } => Some(call_id),
            Self::Error { .. } => None,
        }
    }

    /// Addressee of a routed message
    pub fn recipient(&self) -> Option<&ParticipantId> {
        match self {
            Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::TrackStateChanged { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Overwrite the sender of a routed message
    pub fn set_sender(&mut self, sender: ParticipantId) {
        match self {
            Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::IceCandidate { from, .. }
            | Self::TrackStateChanged { from, .. } => *from = sender,
            _ => {}
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinCall { .. } => "join-call",
            Self::LeaveCall { .. } => "leave-call",
            Self::GetCallParticipants { .. } => "get-call-participants",
            Self::ParticipantJoined { .. } => "participant-joined",
            Self::ParticipantLeft { .. } => "participant-left",
            Self::ExistingParticipants { .. } => "existing-participants",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::TrackStateChanged { .. } => "track-state-changed",
            Self::HubAssignment { .. } => "hub-assignment",
            Self::Error { .. } => "error",
        }
    }
}
