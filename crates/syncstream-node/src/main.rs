//! SyncStream -- send files directly to another device over one TCP link.
//!
//! Usage:
//!   syncstream                            # Listen and accept files
//!   syncstream run --peer laptop          # Listen and keep a link to a peer
//!   syncstream send report.pdf --peer 10.8.0.2
//!   syncstream config                     # Print the effective config
//!   syncstream peers                      # List peer profiles

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;

use syncstream_node::config::NodeConfig;
use syncstream_node::{expand_tilde, SyncNode};
use syncstream_transfer::{Direction, Event};

#[derive(Parser)]
#[command(name = "syncstream", about = "Peer-to-peer file transfer over a single TCP link")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.syncstream/config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for a peer and receive files (default)
    Run {
        /// Peer profile name or address to dial
        #[arg(short, long)]
        peer: Option<String>,
    },
    /// Send one file to a peer and exit
    Send {
        /// File to send
        file: PathBuf,
        /// Peer profile name or address
        #[arg(short, long)]
        peer: Option<String>,
        /// Seconds to wait for the connection
        #[arg(long, default_value_t = 30)]
        wait: u64,
    },
    /// Print the effective configuration
    Config,
    /// List configured peer profiles
    Peers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config_path = expand_tilde(&cli.config);
    let cfg = NodeConfig::load_or_default(&config_path)?;

    match cli.command {
        Some(Commands::Run { peer }) => run_node(cfg, peer).await?,
        None => run_node(cfg, None).await?,
        Some(Commands::Send { file, peer, wait }) => {
            send_once(cfg, file, peer, Duration::from_secs(wait)).await?
        }
        Some(Commands::Config) => {
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        Some(Commands::Peers) => {
            if cfg.peers.is_empty() {
                println!("No peers configured in {}", config_path.display());
            }
            for p in &cfg.peers {
                println!("{:<16} {:<28} {}", p.name, p.address(), p.description);
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "syncstream_node=info,syncstream_transfer=info,syncstream_protocol=info".into()
    });
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn run_node(mut cfg: NodeConfig, peer: Option<String>) -> anyhow::Result<()> {
    if peer.is_some() {
        cfg.network.peer = peer;
    }
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        name = %cfg.node.name,
        listen_port = cfg.network.listen_port,
        peer = cfg.network.peer.as_deref().unwrap_or("(none)"),
        reconnect = cfg.reconnect.enabled,
        "starting syncstream"
    );

    let node = SyncNode::start(cfg).await?;
    let logger = node.events().spawn_handler(log_event);

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.shutdown().await;
    logger.abort();
    Ok(())
}

fn log_event(event: Event) {
    match &event {
        Event::Connected { peer_address } => tracing::info!(peer = %peer_address, "peer connected"),
        Event::Disconnected => tracing::info!("peer disconnected"),
        Event::ConnectionError { message } => tracing::warn!(%message, "connection error"),
        Event::Reconnecting { attempt } => tracing::info!(attempt, "reconnecting"),
        Event::DataReceived { text } => tracing::info!(%text, "message from peer"),
        Event::FileOffer(t) => {
            tracing::info!(filename = %t.filename, size = t.size_bytes, from = %t.sender, "incoming file")
        }
        Event::TransferComplete(t) => tracing::info!(
            filename = %t.filename,
            direction = %t.direction,
            secs = %format_args!("{:.1}", t.elapsed_seconds()),
            "transfer complete"
        ),
        Event::TransferError { transfer, message } => {
            tracing::warn!(filename = %transfer.filename, %message, "transfer failed")
        }
        Event::TransferProgress(t) => tracing::debug!(
            filename = %t.filename,
            percent = %format_args!("{:.1}", t.progress_percent()),
            "transfer progress"
        ),
        Event::Connecting | Event::TransferStart(_) => {}
    }
}

/// Connect, send `file`, wait for the outcome and exit.
async fn send_once(
    mut cfg: NodeConfig,
    file: PathBuf,
    peer: Option<String>,
    wait: Duration,
) -> anyhow::Result<()> {
    let peer = peer
        .or_else(|| cfg.network.peer.clone())
        .ok_or_else(|| anyhow::anyhow!("no peer given; use --peer or set network.peer"))?;
    // one-shot: an ephemeral port, and no reconnect loop outliving the command
    cfg.network.listen_port = 0;
    cfg.network.peer = None;
    cfg.reconnect.enabled = false;

    let node = SyncNode::start(cfg).await?;
    let mut events = node.subscribe();
    node.connect(&peer)?;

    let outcome = async {
        wait_connected(&mut events, wait).await?;
        let transfer = node.send_file(&file).await?;
        println!(
            "Sending {} ({} bytes, {} chunks) to {peer}",
            transfer.filename, transfer.size_bytes, transfer.chunks_total
        );
        wait_outcome(&mut events, &transfer.id).await
    }
    .await;

    node.shutdown().await;
    outcome
}

async fn wait_connected(events: &mut broadcast::Receiver<Event>, wait: Duration) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for the peer"))?;
        match event {
            Ok(Event::Connected { .. }) => return Ok(()),
            Ok(Event::ConnectionError { message }) => anyhow::bail!("connection failed: {message}"),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("event bus closed"),
        }
    }
}

async fn wait_outcome(events: &mut broadcast::Receiver<Event>, id: &str) -> anyhow::Result<()> {
    loop {
        match events.recv().await {
            Ok(Event::TransferComplete(t)) if t.id == id && t.direction == Direction::Sending => {
                println!("Sent {} in {:.1}s", t.filename, t.elapsed_seconds());
                return Ok(());
            }
            Ok(Event::TransferError { transfer, message }) if transfer.id == id => {
                anyhow::bail!("transfer of {} failed: {message}", transfer.filename)
            }
            Ok(Event::Disconnected) => anyhow::bail!("peer disconnected"),
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("event bus closed"),
        }
    }
}
