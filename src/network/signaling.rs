//! Signaling client
//!
//! Connects a participant to the relay over WebSocket. Inside a call the
//! connection is split: the write half becomes the call's [`SignalingChannel`]
//! and the read half ([`SignalingReader`]) feeds inbound messages to the call's
//! event stream.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::error::NetworkError;
use crate::call::CallHandle;
use crate::protocol::SignalMessage;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of the signaling bus, as seen by the call orchestrator
#[async_trait]
pub trait SignalingChannel: Send {
    async fn send(&mut self, msg: SignalMessage) -> Result<(), NetworkError>;
}

fn encode(msg: &SignalMessage) -> Result<Message, NetworkError> {
    let json = serde_json::to_string(msg)
        .map_err(|e| NetworkError::SignalingError(format!("Serialize failed: {}", e)))?;
    Ok(Message::Text(json))
}

fn decode(text: &str) -> Result<SignalMessage, NetworkError> {
    serde_json::from_str(text)
        .map_err(|e| NetworkError::SignalingError(format!("Deserialize failed: {}", e)))
}

/// Signaling client for connecting to a relay
pub struct SignalingClient {
    server_url: String,
}

impl SignalingClient {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.to_string(),
        }
    }

    /// Connect to the relay (`ws://` or `wss://`)
    pub async fn connect(&self) -> Result<SignalingConnection, NetworkError> {
        let (ws_stream, _) = connect_async(&self.server_url)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Connect failed: {}", e)))?;

        debug!("Connected to signaling relay: {}", self.server_url);

        Ok(SignalingConnection { ws_stream })
    }
}

/// An active connection to the relay
pub struct SignalingConnection {
    ws_stream: WsStream,
}

impl SignalingConnection {
    pub async fn send(&mut self, msg: SignalMessage) -> Result<(), NetworkError> {
        self.ws_stream
            .send(encode(&msg)?)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Send failed: {}", e)))
    }

    /// Receive the next message, skipping non-text frames
    pub async fn recv(&mut self) -> Result<SignalMessage, NetworkError> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => return decode(&text),
                Some(Ok(Message::Close(_))) | None => return Err(NetworkError::ConnectionClosed),
                Some(Err(e)) => {
                    return Err(NetworkError::SignalingError(format!(
                        "Receive failed: {}",
                        e
                    )));
                }
                _ => continue,
            }
        }
    }

    pub async fn close(mut self) -> Result<(), NetworkError> {
        self.ws_stream
            .close(None)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Close failed: {}", e)))
    }

    /// Split into the call's outbound channel and the inbound reader
    pub fn split(self) -> (WsSignalingChannel, SignalingReader) {
        let (sink, stream) = self.ws_stream.split();
        (WsSignalingChannel { sink }, SignalingReader { stream })
    }
}

/// Read half of a relay connection
pub struct SignalingReader {
    stream: SplitStream<WsStream>,
}

impl SignalingReader {
    /// Forward inbound messages to the call behind `handle`
    ///
    /// The task ends when the relay closes the socket or the call ends.
    pub fn spawn(self, handle: CallHandle) -> JoinHandle<()> {
        tokio::spawn(forward_inbound(self.stream, handle))
    }
}

async fn forward_inbound(mut stream: SplitStream<WsStream>, handle: CallHandle) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match decode(&text) {
                Ok(msg) => {
                    if handle.signal(msg).is_err() {
                        debug!("Call ended, stopping signaling reader");
                        return;
                    }
                }
                Err(e) => warn!("Invalid message from relay: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Signaling receive failed: {}", e);
                break;
            }
        }
    }
    info!("Signaling connection closed");
}

/// Write half of a relay connection
pub struct WsSignalingChannel {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn send(&mut self, msg: SignalMessage) -> Result<(), NetworkError> {
        self.sink
            .send(encode(&msg)?)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Send failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{ParticipantId, SessionDescription};

    #[test]
    fn test_encode_decode_offer() {
        let msg = SignalMessage::Offer {
            call_id: "call-1".to_string(),
            from: ParticipantId::new("alice"),
            to: ParticipantId::new("bob"),
            description: SessionDescription::offer("v=0"),
        };

        let Message::Text(text) = encode(&msg).unwrap() else {
            panic!("expected a text frame");
        };
        assert!(text.contains("\"type\":\"offer\""));
        assert_eq!(decode(&text).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode("{\"type\":\"nope\"}"),
            Err(NetworkError::SignalingError(_))
        ));
    }
}
