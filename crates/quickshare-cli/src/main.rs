use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use quickshare_core::identifier;
use quickshare_core::protocol::format_file_size;
use quickshare_core::session::SessionState;
use quickshare_core::transport::Acquire;
use quickshare_core::{Client, ClientConfig, FileSource, HubConfig, TransferEvent, TransportMode};
use storage::LocalStorage;

/// How long `send` waits for the link and for the receiver's acknowledgement.
const SEND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "quickshare", version, about = "QuickShare file transfer by identifier")]
struct Cli {
    /// Set log level: error,warn,info,debug,trace
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Directory holding config.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay hub
    Relay {
        /// Port to listen on
        #[arg(long, default_value_t = 3000)]
        port: u16,
    },

    /// Print a fresh identifier and its share link
    Id {
        /// Base URL for the share link
        #[arg(long, default_value = "http://localhost:3000/")]
        base_url: String,
    },

    /// Wait for incoming transfers
    Receive {
        /// Relay hub address (host:port)
        #[arg(long)]
        relay: Option<String>,

        /// Accept direct TCP channels instead of using the relay
        #[arg(long)]
        direct: bool,

        /// Port for direct channels
        #[arg(long)]
        port: Option<u16>,

        /// Identifier to register with the relay
        #[arg(long)]
        id: Option<String>,

        /// Link to this identifier or share link once ready
        #[arg(long)]
        connect: Option<String>,

        /// Output directory for received files
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Send a file to a peer
    Send {
        /// File to send
        #[arg(long)]
        file: PathBuf,

        /// Peer identifier, share link, or host:port with --direct
        #[arg(long)]
        peer: String,

        /// Relay hub address (host:port)
        #[arg(long)]
        relay: Option<String>,

        /// Dial the peer directly instead of using the relay
        #[arg(long)]
        direct: bool,

        /// Port for direct channels
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    fmt()
        .with_env_filter(EnvFilter::new(&cli.log_level))
        .with_target(false)
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".quickshare")
    });

    match cli.cmd {
        Commands::Relay { port } => {
            println!("✓ Relay hub starting on port {}", port);
            quickshare_hub::run(HubConfig::with_port(port)).await?;
        }

        Commands::Id { base_url } => {
            let id = identifier::generate();
            println!("Identifier: {}", id);
            println!("Share link: {}", identifier::share_link(&base_url, &id));
        }

        Commands::Receive { relay, direct, port, id, connect, output } => {
            let mut cfg = load_config(&data_dir)?;
            apply_transport(&mut cfg, relay, direct, port);
            if let Some(output) = output {
                cfg.output_dir = output;
            }
            receive(cfg, id, connect).await?;
        }

        Commands::Send { file, peer, relay, direct, port } => {
            let mut cfg = load_config(&data_dir)?;
            apply_transport(&mut cfg, relay, direct, port);
            if cfg.transport == TransportMode::Direct && port.is_none() {
                // Outgoing only; any free port will do.
                cfg.listen_port = 0;
            }
            send(cfg, &file, &peer).await?;
        }
    }

    Ok(())
}

/// `config.json` in `data_dir`, or defaults when there is none.
fn load_config(data_dir: &Path) -> Result<ClientConfig> {
    let cfg_path = data_dir.join("config.json");
    if !cfg_path.exists() {
        return Ok(ClientConfig::default());
    }

    let cfg_json = std::fs::read_to_string(&cfg_path)
        .with_context(|| format!("Failed to read {}", cfg_path.display()))?;
    let cfg: ClientConfig = serde_json::from_str(&cfg_json)
        .with_context(|| format!("Invalid config in {}", cfg_path.display()))?;
    Ok(cfg)
}

fn apply_transport(cfg: &mut ClientConfig, relay: Option<String>, direct: bool, port: Option<u16>) {
    if let Some(relay) = relay {
        *cfg = cfg.clone().with_relay(relay);
    }
    if direct {
        cfg.transport = TransportMode::Direct;
    }
    if let Some(port) = port {
        cfg.listen_port = port;
    }
}

/// Accept a bare identifier or a share link.
fn parse_peer(peer: &str) -> Result<String> {
    if peer.contains("://") || peer.contains('?') {
        Ok(identifier::from_share_link(peer)?)
    } else {
        Ok(identifier::canonical(peer)?)
    }
}

fn start_client(cfg: ClientConfig, id: Option<String>) -> Result<Client<LocalStorage>> {
    cfg.ensure_output_dir()?;
    let storage = LocalStorage::new(cfg.output_dir.clone())?;
    let acquire: Arc<dyn Acquire> = match (cfg.transport, id) {
        (TransportMode::Relayed, Some(id)) => Arc::new(
            transport_tcp::RelayAcquire::new(cfg.relay_addr.clone()).with_identifier(identifier::canonical(&id)?),
        ),
        _ => transport_tcp::acquirer(&cfg),
    };
    Ok(Client::start(acquire, storage, cfg))
}

async fn wait_ready(client: &Client<LocalStorage>) -> Result<String> {
    let mut status = client.session.watch_status();
    tokio::time::timeout(SEND_TIMEOUT, status.wait_for(|s| s.state == SessionState::Ready))
        .await
        .context("Timed out waiting for the transport")??;
    client
        .session
        .local_identifier()
        .context("Session is ready without an identifier")
}

async fn receive(cfg: ClientConfig, id: Option<String>, connect: Option<String>) -> Result<()> {
    let output_dir = cfg.output_dir.clone();
    let client = start_client(cfg, id)?;
    let mut saved = client.subscribe_saved();
    let mut transfers = client.subscribe_transfers();

    let local_id = wait_ready(&client).await?;
    println!("✓ Ready as {}", local_id);
    println!("  Saving to {}", output_dir.display());

    if let Some(peer) = connect {
        let peer = parse_peer(&peer)?;
        client.connect_to_peer(&peer).await?;
        println!("  Linking to {}", peer);
    }
    println!("  Press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(stored) = saved.recv() => {
                println!("✓ Saved {} ({})", stored.path.display(), format_file_size(stored.size));
            }
            Some(event) = transfers.recv() => match event {
                TransferEvent::Announced { peer, file_name, total_size, .. } => {
                    println!("Receiving {} ({}) from {}", file_name, format_file_size(total_size), peer);
                }
                TransferEvent::Aborted { file_name, received, total, reason, .. } => {
                    println!("✗ {} aborted at {}/{} chunks: {:?}", file_name, received, total, reason);
                }
                _ => {}
            },
        }
    }

    client.shutdown().await;
    Ok(())
}

async fn send(cfg: ClientConfig, file: &Path, peer: &str) -> Result<()> {
    let peer = parse_peer(peer)?;
    let source = FileSource::from_path(file);
    let size = source
        .size()
        .await
        .with_context(|| format!("Cannot read {}", file.display()))?;
    println!("Preparing to send: {} ({})", file.display(), format_file_size(size));

    let client = start_client(cfg, None)?;
    let mut transfers = client.subscribe_transfers();
    let local_id = wait_ready(&client).await?;
    println!("✓ Ready as {}", local_id);

    println!("Connecting to {}...", peer);
    client.connect_to_peer(&peer).await?;
    let mut status = client.session.watch_status();
    tokio::time::timeout(
        SEND_TIMEOUT,
        status.wait_for(|s| s.linked_peers.iter().any(|p| identifier::matches(p, &peer))),
    )
    .await
    .context("Timed out waiting for the peer to link")??;
    println!("✓ Connected");

    let report = client.send_file(source).await?;
    for (failed, error) in &report.failed {
        println!("✗ {}: {}", failed, error);
    }
    if report.delivered.is_empty() {
        client.shutdown().await;
        anyhow::bail!("File was not delivered to any peer");
    }
    println!("  Sent {} chunks, waiting for confirmation...", report.total_chunks);

    let acknowledged = tokio::time::timeout(SEND_TIMEOUT, async {
        while let Some(event) = transfers.recv().await {
            if let TransferEvent::Acknowledged { file_id, .. } = event {
                if file_id == report.file_id {
                    return true;
                }
            }
        }
        false
    })
    .await
    .unwrap_or(false);

    client.shutdown().await;
    if !acknowledged {
        anyhow::bail!("Peer did not confirm receipt");
    }
    println!("✓ File sent successfully");
    Ok(())
}
