//! Call orchestration error types

use thiserror::Error;

use super::types::ParticipantId;
use crate::network::NetworkError;

/// Errors raised by a media connection implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    #[error("Invalid description: {0}")]
    InvalidDescription(String),

    #[error("Candidate rejected: {0}")]
    CandidateRejected(String),

    #[error("Track error: {0}")]
    Track(String),

    #[error("Connection closed")]
    Closed,
}

/// Errors raised while acquiring local capture tracks
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device busy: {0}")]
    DeviceBusy(String),
}

/// Errors that can occur while orchestrating a call
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Capture failed after {attempts} attempts: {source}")]
    Capture {
        attempts: u32,
        #[source]
        source: CaptureError,
    },

    #[error("Signaling error: {0}")]
    Signaling(#[from] NetworkError),

    #[error("No session for participant {0}")]
    NoSession(ParticipantId),

    #[error("Call has ended")]
    CallEnded,

    #[error("Invalid configuration: {0}")]
    Config(String),
}
