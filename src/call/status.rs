//! Call-scoped status and duration counters

use std::fmt;

use serde::{Deserialize, Serialize};

use super::types::{MediaKind, TrackKind};

/// Overall call status shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Idle,
    /// Joined, no peer connected yet
    Connecting,
    /// At least one peer connected
    Active,
    /// Forced reconnect in progress
    Reconnecting,
    Ended,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Reconnecting => "reconnecting",
            Self::Ended => "ended",
        };
        f.write_str(label)
    }
}

/// Elapsed call time, advanced by a one-second tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CallDuration {
    seconds: u64,
}

impl CallDuration {
    pub fn tick(&mut self) {
        self.seconds += 1;
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }
}

/// Formats as `MM:SS`; minutes keep growing past 99
impl fmt::Display for CallDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.seconds / 60, self.seconds % 60)
    }
}

/// Mute state a remote participant last announced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteMediaState {
    pub audio: bool,
    pub video: bool,
}

impl RemoteMediaState {
    /// Everything the call carries starts enabled
    pub fn for_media(media: MediaKind) -> Self {
        Self {
            audio: true,
            video: media.has_video(),
        }
    }

    pub fn set(&mut self, kind: TrackKind, enabled: bool) {
        match kind {
            TrackKind::Audio => self.audio = enabled,
            TrackKind::Video => self.video = enabled,
        }
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Audio => self.audio,
            TrackKind::Video => self.video,
        }
    }
}
