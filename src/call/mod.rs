//! Call session orchestration
//!
//! Decides, for every participant in a call, whether and when to create a media
//! connection, who offers, how ICE candidates are sequenced, how a group call's
//! hub topology forms and re-forms, and how failed connections recover.

mod config;
mod error;
mod media;
mod orchestrator;
mod peer;
mod registry;
mod status;
mod supervisor;
mod timers;
mod topology;
mod types;

pub use config::{CallConfig, MAX_TIMING_MS};
pub use error::{CallError, CaptureError, MediaError};
pub use media::{
    CaptureDevice, LocalStream, MediaConnection, MediaConnectionFactory, MediaConstraints,
    MediaEvent, MediaEventSink, MediaTrack,
};
pub use orchestrator::{
    CallEvent, CallHandle, CallNotice, CallOrchestrator, CallSnapshot, HealthReport, PeerSnapshot,
};
pub use peer::{NegotiationContext, OfferOutcome, PeerSession};
pub use registry::{SessionOpen, SessionRegistry};
pub use status::{CallDuration, CallStatus, RemoteMediaState};
pub use supervisor::{
    ReconnectionSupervisor, RecoveryAction, RecoveryPhase, RetryPolicy, RetryState,
};
pub use timers::{TimerKind, TimerQueue};
pub use topology::{
    elect_hub, ForwardGap, ForwardingRecord, HubChange, Role, TopologyManager, TopologyState,
};
pub use types::{
    CallDescriptor, CallKind, ConnectionState, IceCandidate, MediaConnectionState, MediaKind,
    ParticipantId, ParticipantRecord, SdpKind, SessionDescription, TrackKind,
};
