//! peercall - Peer-session orchestration for audio/video calls
//!
//! This library decides when media connections are created between call
//! participants, how they negotiate, how group calls are relayed through an
//! elected hub, and how failed connections are recovered. The media transport
//! and capture devices are supplied by the host through the traits in [`call`].

pub mod call;
pub mod network;
pub mod protocol;

pub use call::{CallConfig, CallDescriptor, CallHandle, CallOrchestrator, ParticipantId};
pub use network::{SignalingClient, SignalingRelay};
pub use protocol::SignalMessage;
