//! Signaling relay server
//!
//! Keeps per-call membership and routes messages between participants. The
//! relay is the only shared view of membership, so it stamps join times: every
//! participant elects the hub from the same timestamps.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::error::NetworkError;
use crate::call::{ParticipantId, ParticipantRecord};
use crate::protocol::SignalMessage;

/// A participant connected to a call
struct Member {
    record: ParticipantRecord,
    tx: mpsc::UnboundedSender<SignalMessage>,
}

type Calls = Arc<Mutex<HashMap<String, HashMap<ParticipantId, Member>>>>;

/// The call a connection has joined
#[derive(Debug, Clone)]
struct Membership {
    call_id: String,
    id: ParticipantId,
    /// Sender of the connection that joined; identifies it after a re-join
    tx: mpsc::UnboundedSender<SignalMessage>,
}

impl Membership {
    /// Whether `member` is still this connection's registration
    fn owns(&self, member: &Member) -> bool {
        member.tx.same_channel(&self.tx)
    }
}

/// Signaling relay state
#[derive(Clone, Default)]
pub struct SignalingRelay {
    calls: Calls,
}

impl SignalingRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `addr` and serve until the process exits
    pub async fn run(&self, addr: &str, tls: Option<TlsAcceptor>) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::SignalingError(format!("Bind failed: {}", e)))?;

        info!("Signaling relay listening on {}", addr);
        self.serve(listener, tls).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
        tls: Option<TlsAcceptor>,
    ) -> Result<(), NetworkError> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!("New signaling connection from {}", peer_addr);
                    let calls = self.calls.clone();
                    let tls = tls.clone();

                    tokio::spawn(async move {
                        let result = match tls {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(tls_stream) => accept_and_handle(tls_stream, calls).await,
                                Err(e) => {
                                    warn!("TLS handshake failed for {}: {}", peer_addr, e);
                                    return;
                                }
                            },
                            None => accept_and_handle(stream, calls).await,
                        };
                        if let Err(e) = result {
                            warn!("Connection error for {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    pub fn participant_count(&self, call_id: &str) -> usize {
        self.calls.lock().get(call_id).map_or(0, |members| members.len())
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

async fn accept_and_handle<S>(stream: S, calls: Calls) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| NetworkError::SignalingError(format!("WebSocket accept failed: {}", e)))?;
    handle_connection(ws_stream, calls).await
}

/// Handle a single WebSocket connection
async fn handle_connection<S>(ws_stream: WebSocketStream<S>, calls: Calls) -> Result<(), NetworkError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<SignalMessage>();
    let mut membership: Option<Membership> = None;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<SignalMessage>(&text) {
                            Ok(msg) => {
                                let reply = process_message(msg, &calls, &mut membership, &tx);
                                if let Some(reply) = reply {
                                    if send_json(&mut write, &reply).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                warn!("Invalid message: {}", e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            // Messages routed to this participant by other connections
            routed = rx.recv() => {
                if let Some(msg) = routed {
                    if send_json(&mut write, &msg).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    // A dropped socket counts as leaving
    if let Some(membership) = membership {
        leave(&calls, &membership);
    }

    Ok(())
}

async fn send_json<W>(write: &mut W, msg: &SignalMessage) -> Result<(), NetworkError>
where
    W: SinkExt<Message> + Unpin,
{
    let json = serde_json::to_string(msg)
        .map_err(|e| NetworkError::SignalingError(format!("Serialize failed: {}", e)))?;
    write
        .send(Message::Text(json))
        .await
        .map_err(|_| NetworkError::ConnectionClosed)
}

/// Process one inbound message; returns the direct reply, if any
fn process_message(
    msg: SignalMessage,
    calls: &Calls,
    membership: &mut Option<Membership>,
    tx: &mpsc::UnboundedSender<SignalMessage>,
) -> Option<SignalMessage> {
    match msg {
        SignalMessage::JoinCall {
            call_id,
            mut participant,
        } => {
            if let Some(previous) = membership.take() {
                leave(calls, &previous);
            }

            participant.joined_at = Utc::now();
            let id = participant.id.clone();

            let mut calls_guard = calls.lock();
            let members = calls_guard.entry(call_id.clone()).or_default();
            if let Some(stale) = members.remove(&id) {
                debug!("{} re-joined call {} from a new connection", stale.record.id, call_id);
            }

            broadcast(
                members,
                &id,
                SignalMessage::ParticipantJoined {
                    call_id: call_id.clone(),
                    participant: participant.clone(),
                },
            );
            members.insert(
                id.clone(),
                Member {
                    record: participant,
                    tx: tx.clone(),
                },
            );

            info!(
                "{} joined call {} ({} participants)",
                id,
                call_id,
                members.len()
            );

            let participants = member_list(members);
            *membership = Some(Membership {
                call_id: call_id.clone(),
                id,
                tx: tx.clone(),
            });

            Some(SignalMessage::ExistingParticipants {
                call_id,
                participants,
            })
        }

        SignalMessage::LeaveCall { call_id, .. } => {
            if membership.as_ref().is_some_and(|m| m.call_id == call_id) {
                if let Some(current) = membership.take() {
                    leave(calls, &current);
                }
            }
            None
        }

        SignalMessage::GetCallParticipants { call_id } => {
            let calls_guard = calls.lock();
            let participants = calls_guard.get(&call_id).map(member_list).unwrap_or_default();
            Some(SignalMessage::ExistingParticipants {
                call_id,
                participants,
            })
        }

        SignalMessage::HubAssignment { call_id, hub } => {
            let Some(current) = membership.as_ref().filter(|m| m.call_id == call_id) else {
                return not_joined(&call_id);
            };
            let calls_guard = calls.lock();
            if let Some(members) = calls_guard.get(&call_id) {
                broadcast(
                    members,
                    &current.id,
                    SignalMessage::HubAssignment {
                        call_id: call_id.clone(),
                        hub,
                    },
                );
            }
            None
        }

        mut routed @ (SignalMessage::Offer { .. }
        | SignalMessage::Answer { .. }
        | SignalMessage::IceCandidate { .. }
        | SignalMessage::TrackStateChanged { .. }) => {
            let call_id = routed.call_id().unwrap_or_default().to_string();
            let Some(current) = membership.as_ref().filter(|m| m.call_id == call_id) else {
                return not_joined(&call_id);
            };
            let Some(to) = routed.recipient().cloned() else {
                return None;
            };

            // Senders cannot impersonate other participants
            routed.set_sender(current.id.clone());

            let calls_guard = calls.lock();
            match calls_guard.get(&call_id).and_then(|members| members.get(&to)) {
                Some(member) => {
                    debug!("Routing {} from {} to {}", routed.name(), current.id, to);
                    if member.tx.send(routed).is_err() {
                        debug!("{} is disconnecting, message dropped", to);
                    }
                    None
                }
                None => Some(SignalMessage::Error {
                    message: format!("Participant {} is not in call {}", to, call_id),
                }),
            }
        }

        // Relay -> participant messages, ignore if received
        other => {
            debug!("Ignoring {} from client", other.name());
            None
        }
    }
}

fn not_joined(call_id: &str) -> Option<SignalMessage> {
    Some(SignalMessage::Error {
        message: format!("Not joined to call {}", call_id),
    })
}

/// Membership ordered by join time, then identity
fn member_list(members: &HashMap<ParticipantId, Member>) -> Vec<ParticipantRecord> {
    let mut list: Vec<ParticipantRecord> = members.values().map(|m| m.record.clone()).collect();
    list.sort_by(|a, b| a.election_key().cmp(&b.election_key()));
    list
}

/// Send `msg` to every member except `except`
fn broadcast(
    members: &HashMap<ParticipantId, Member>,
    except: &ParticipantId,
    msg: SignalMessage,
) {
    for (id, member) in members {
        if id != except {
            let _ = member.tx.send(msg.clone());
        }
    }
}

fn leave(calls: &Calls, membership: &Membership) {
    let mut calls_guard = calls.lock();
    let Some(members) = calls_guard.get_mut(&membership.call_id) else {
        return;
    };
    // A re-join from another connection replaced this registration
    if !members
        .get(&membership.id)
        .is_some_and(|member| membership.owns(member))
    {
        debug!(
            "{} already re-joined call {} elsewhere",
            membership.id, membership.call_id
        );
        return;
    }
    members.remove(&membership.id);

    info!("{} left call {}", membership.id, membership.call_id);
    broadcast(
        members,
        &membership.id,
        SignalMessage::ParticipantLeft {
            call_id: membership.call_id.clone(),
            participant_id: membership.id.clone(),
        },
    );

    if members.is_empty() {
        calls_guard.remove(&membership.call_id);
        info!("Call {} removed (empty)", membership.call_id);
    }
}

/// Load TLS certificates from PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, NetworkError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

/// Load TLS private key from PEM file
fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, NetworkError> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    for item in rustls_pemfile::read_all(&mut reader) {
        match item? {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(NetworkError::Tls(format!(
        "No private key found in {}",
        path.display()
    )))
}

/// Create TLS acceptor from certificate and key files
pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, NetworkError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetworkError::Tls(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
