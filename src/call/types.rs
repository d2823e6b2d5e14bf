//! Core call data model: identities, descriptors, negotiation payloads and states

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque participant identity
///
/// Ordering is byte-wise lexicographic over the UTF-8 string. Every participant
/// must use the same ordering: glare resolution and hub election both depend on it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ParticipantId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Participant membership record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRecord {
    pub id: ParticipantId,
    pub display_name: String,
    /// Stamped by the relay when the participant joins
    pub joined_at: DateTime<Utc>,
}

impl ParticipantRecord {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            joined_at: Utc::now(),
        }
    }

    /// Election key: join time first, identity breaks ties
    pub fn election_key(&self) -> (DateTime<Utc>, &ParticipantId) {
        (self.joined_at, &self.id)
    }
}

/// Media carried by the call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    AudioVideo,
}

impl MediaKind {
    pub fn has_video(&self) -> bool {
        matches!(self, Self::AudioVideo)
    }
}

/// Call shape, fixed for the lifetime of the call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallKind {
    /// One-to-one call; the initiator always makes the offer
    Direct {
        initiator: ParticipantId,
        responder: ParticipantId,
    },
    /// Multi-party call relayed through an elected hub
    Group,
}

/// Immutable description of a call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDescriptor {
    pub call_id: String,
    pub kind: CallKind,
    pub media: MediaKind,
}

impl CallDescriptor {
    pub fn direct(
        call_id: impl Into<String>,
        initiator: impl Into<ParticipantId>,
        responder: impl Into<ParticipantId>,
        media: MediaKind,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            kind: CallKind::Direct {
                initiator: initiator.into(),
                responder: responder.into(),
            },
            media,
        }
    }

    pub fn group(call_id: impl Into<String>, media: MediaKind) -> Self {
        Self {
            call_id: call_id.into(),
            kind: CallKind::Group,
            media,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, CallKind::Group)
    }

    /// For direct calls, the participant on the other end from `local`
    pub fn counterpart(&self, local: &ParticipantId) -> Option<&ParticipantId> {
        match &self.kind {
            CallKind::Direct {
                initiator,
                responder,
            } => {
                if initiator == local {
                    Some(responder)
                } else if responder == local {
                    Some(initiator)
                } else {
                    None
                }
            }
            CallKind::Group => None,
        }
    }

    pub fn is_initiator(&self, local: &ParticipantId) -> bool {
        matches!(&self.kind, CallKind::Direct { initiator, .. } if initiator == local)
    }
}

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for a media connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// State reported by the media connection itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Peer session connection state
///
/// ```text
/// [*] --> Connecting: create()
/// Connecting --> Connected: connected / completed
/// Connected --> Disconnected | Failed
/// Disconnected | Failed --> Connected: ICE restart
/// any --> Closed: close()
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// A live session blocks creation of another one for the same identity
    pub fn is_live(&self) -> bool {
        matches!(self, Self::New | Self::Connecting | Self::Connected)
    }

    pub fn is_failing(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl From<MediaConnectionState> for ConnectionState {
    fn from(state: MediaConnectionState) -> Self {
        match state {
            MediaConnectionState::New => Self::New,
            MediaConnectionState::Checking => Self::Connecting,
            MediaConnectionState::Connected | MediaConnectionState::Completed => Self::Connected,
            MediaConnectionState::Disconnected => Self::Disconnected,
            MediaConnectionState::Failed => Self::Failed,
            MediaConnectionState::Closed => Self::Closed,
        }
    }
}
