//! Network module for call signaling
//!
//! Handles the WebSocket signaling client and the relay server that carries
//! membership and negotiation messages between participants.

mod error;
mod relay;
mod signaling;

pub use error::NetworkError;
pub use relay::{create_tls_acceptor, SignalingRelay};
pub use signaling::{
    SignalingChannel, SignalingClient, SignalingConnection, SignalingReader, WsSignalingChannel,
};
