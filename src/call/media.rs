//! Interfaces to the media layer
//!
//! The media connection (ICE/DTLS/SRTP transport) and the capture device are
//! supplied by the host platform. The orchestrator only drives them through the
//! traits below; their own events come back through a [`MediaEventSink`] so they
//! are processed in the same sequential event stream as signaling messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::error::{CaptureError, MediaError};
use super::orchestrator::CallEvent;
use super::types::{
    IceCandidate, MediaConnectionState, MediaKind, ParticipantId, SessionDescription, TrackKind,
};

#[derive(Debug)]
struct TrackState {
    enabled: AtomicBool,
    live: AtomicBool,
}

/// Handle to a media track
///
/// Clones share the same enabled/live flags, so toggling a local track is
/// observed by every sender it was attached to.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    origin: ParticipantId,
    state: Arc<TrackState>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, origin: ParticipantId) -> Self {
        Self {
            id: id.into(),
            kind,
            origin,
            state: Arc::new(TrackState {
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    /// Independent copy of this track for relaying to another peer
    pub fn forward_clone(&self) -> Self {
        Self {
            id: format!("{}~{}", self.id, Uuid::new_v4()),
            kind: self.kind,
            origin: self.origin.clone(),
            state: Arc::new(TrackState {
                enabled: AtomicBool::new(self.is_enabled()),
                live: AtomicBool::new(self.is_live()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    /// Participant whose capture produced this track
    pub fn origin(&self) -> &ParticipantId {
        &self.origin
    }

    pub fn is_enabled(&self) -> bool {
        self.state.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.state.live.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.state.live.store(false, Ordering::SeqCst);
    }
}

/// Local capture constraints
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl From<MediaKind> for MediaConstraints {
    fn from(kind: MediaKind) -> Self {
        Self {
            audio: true,
            video: kind.has_video(),
        }
    }
}

/// Tracks produced by the local capture device
#[derive(Debug, Clone, Default)]
pub struct LocalStream {
    tracks: Vec<MediaTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// Returns the number of tracks of `kind` that were updated
    pub fn set_enabled(&self, kind: TrackKind, enabled: bool) -> usize {
        let mut updated = 0;
        for track in self.tracks.iter().filter(|t| t.kind() == kind) {
            track.set_enabled(enabled);
            updated += 1;
        }
        updated
    }

    /// Release the capture; tracks become permanently ended
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Event produced asynchronously by a media connection
#[derive(Debug, Clone)]
pub enum MediaEvent {
    /// A local ICE candidate was gathered and must be signaled
    IceCandidate(IceCandidate),
    /// A remote track arrived
    Track(MediaTrack),
    /// Connection state changed
    StateChanged(MediaConnectionState),
}

/// Routes media connection callbacks into the call's event stream
///
/// Each sink is tagged with the session generation it was created for, so
/// callbacks from a connection that has since been replaced are recognised as
/// stale and dropped.
#[derive(Debug, Clone)]
pub struct MediaEventSink {
    peer: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<CallEvent>,
}

impl MediaEventSink {
    pub(crate) fn new(
        peer: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<CallEvent>,
    ) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &ParticipantId {
        &self.peer
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue an event; dropped silently once the call has shut down
    pub fn emit(&self, event: MediaEvent) {
        let _ = self.tx.send(CallEvent::Media {
            peer: self.peer.clone(),
            generation: self.generation,
            event,
        });
    }
}

/// One peer-to-peer media connection (an RTCPeerConnection equivalent)
#[async_trait]
pub trait MediaConnection: Send {
    /// Create an offer; `ice_restart` requests fresh ICE credentials
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, MediaError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, MediaError>;

    async fn set_local_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    /// Discard a pending local offer
    async fn rollback_local_description(&mut self) -> Result<(), MediaError>;

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), MediaError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), MediaError>;

    /// Attach an outbound track to the connection
    fn add_track(&mut self, track: &MediaTrack) -> Result<(), MediaError>;

    /// Release the transport; must tolerate repeated calls
    fn close(&mut self);
}

/// Builds media connections for new peer sessions
pub trait MediaConnectionFactory: Send {
    /// `events` receives the connection's ICE candidate, track and state callbacks
    fn create(
        &mut self,
        remote: &ParticipantId,
        events: MediaEventSink,
    ) -> Result<Box<dyn MediaConnection>, MediaError>;
}

/// Local capture device (camera/microphone)
#[async_trait]
pub trait CaptureDevice: Send {
    async fn acquire_local_stream(
        &mut self,
        constraints: MediaConstraints,
    ) -> Result<LocalStream, CaptureError>;
}
