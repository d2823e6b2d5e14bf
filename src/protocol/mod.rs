//! Signaling protocol definitions

mod message;

pub use message::SignalMessage;
