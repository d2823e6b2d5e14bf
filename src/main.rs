//! peercall - Peer-session orchestration for audio/video calls

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use peercall::call::{CallConfig, ParticipantId, ParticipantRecord};
use peercall::network::{create_tls_acceptor, SignalingClient, SignalingRelay};
use peercall::protocol::SignalMessage;

#[derive(Parser)]
#[command(name = "peercall")]
#[command(about = "Peer-session orchestration for audio/video calls")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Port to listen on
        #[arg(short, long, default_value = "8080", env = "PEERCALL_PORT")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Path to TLS certificate file (PEM format)
        #[arg(long)]
        cert: Option<PathBuf>,

        /// Path to TLS private key file (PEM format)
        #[arg(long)]
        key: Option<PathBuf>,
    },

    /// Validate an orchestrator config file and print the effective settings
    Config {
        /// TOML file; defaults are printed when omitted
        path: Option<PathBuf>,
    },

    /// Join a call on a relay and print membership traffic
    Watch {
        /// Relay URL (ws:// or wss://)
        #[arg(short, long, default_value = "ws://127.0.0.1:8080")]
        server: String,

        /// Call to join
        call_id: String,

        /// Identity to join as
        #[arg(long, default_value = "watcher")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Relay {
            port,
            host,
            cert,
            key,
        } => run_relay(&host, port, cert, key).await?,
        Commands::Config { path } => print_config(path)?,
        Commands::Watch {
            server,
            call_id,
            name,
        } => watch_call(&server, &call_id, &name).await?,
    }

    Ok(())
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

async fn run_relay(
    host: &str,
    port: u16,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;

    let tls_acceptor = match (&cert, &key) {
        (Some(cert), Some(key)) => {
            info!("TLS enabled with cert: {:?}, key: {:?}", cert, key);
            Some(create_tls_acceptor(cert, key)?)
        }
        (Some(_), None) | (None, Some(_)) => {
            bail!("Both --cert and --key must be provided for TLS");
        }
        (None, None) => {
            warn!("TLS disabled - running in plain WebSocket mode");
            None
        }
    };

    info!(
        "Protocol: {}",
        if tls_acceptor.is_some() {
            "wss:// (WebSocket Secure)"
        } else {
            "ws:// (WebSocket)"
        }
    );

    let relay = SignalingRelay::new();
    relay.run(&addr.to_string(), tls_acceptor).await?;
    Ok(())
}

fn print_config(path: Option<PathBuf>) -> Result<()> {
    let config = match path {
        Some(path) => {
            let config = CallConfig::load(&path)?;
            info!("{} is valid", path.display());
            config
        }
        None => CallConfig::default(),
    };

    print!("{}", config.to_toml()?);
    Ok(())
}

async fn watch_call(server: &str, call_id: &str, name: &str) -> Result<()> {
    let client = SignalingClient::new(server);
    let mut connection = client.connect().await?;
    info!("Connected to {}", server);

    connection
        .send(SignalMessage::JoinCall {
            call_id: call_id.to_string(),
            participant: ParticipantRecord::new(ParticipantId::new(name), name),
        })
        .await?;

    loop {
        tokio::select! {
            msg = connection.recv() => match msg? {
                SignalMessage::ExistingParticipants { participants, .. } => {
                    println!("Participants in {}:", call_id);
                    for p in participants {
                        println!("  - {} ({}) joined {}", p.id, p.display_name, p.joined_at);
                    }
                }
                SignalMessage::ParticipantJoined { participant, .. } => {
                    println!("+ {} ({})", participant.id, participant.display_name);
                }
                SignalMessage::ParticipantLeft { participant_id, .. } => {
                    println!("- {}", participant_id);
                }
                SignalMessage::HubAssignment { hub, .. } => {
                    println!("* hub is {}", hub);
                }
                SignalMessage::Error { message } => {
                    warn!("Relay error: {}", message);
                }
                other => {
                    println!("  {}", other.name());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    connection
        .send(SignalMessage::LeaveCall {
            call_id: call_id.to_string(),
            participant_id: ParticipantId::new(name),
        })
        .await?;
    connection.close().await?;
    info!("Left call {}", call_id);
    Ok(())
}
