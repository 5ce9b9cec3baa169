use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use paddock::{Event, Node, NodeConfig};

#[derive(Parser, Debug)]
#[command(name = "paddock")]
#[command(author, version, about = "Peer-to-peer overlay node", long_about = None)]
struct Args {
    /// Display name.
    #[arg(short, long, default_value = "anon")]
    name: String,

    /// Bind address, e.g. 0.0.0.0:0 for a random port.
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: String,

    /// Comma-separated bootstrap addresses (host:port).
    #[arg(short = 'B', long, default_value = "")]
    bootstrap: String,

    /// Run as a seed node: keep a user registry and relay NAT envelopes.
    #[arg(long)]
    seed: bool,

    /// Verbose logging.
    #[arg(short, long)]
    debug: bool,

    /// Directory for persisted peer/DHT address books.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.debug { "paddock=debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let bootstraps: Vec<String> = args
        .bootstrap
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let (peerstore_path, dhtstore_path) = match &args.data_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            (
                Some(dir.join("peerstore.json")),
                Some(dir.join("dhtstore.json")),
            )
        }
        None => (None, None),
    };

    let node = Node::start(NodeConfig {
        name: args.name,
        bind_addr: args.bind,
        bootstraps,
        is_seed: args.seed,
        peerstore_path,
        dhtstore_path,
        ..Default::default()
    })
    .await?;

    println!("Node started.");
    println!("Listen:     {}", node.listen_addr());
    println!("NetworkID:  {}", node.network_id());
    println!("UserID:     {}", node.user_id());
    println!("NodeID:     {}", node.node_id().to_hex());

    let mut events = node.events().expect("fresh node has an event stream");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
            event = events.recv() => match event {
                Some(Event::PeerConnected { network_id, name, addr, .. }) => {
                    info!(peer = %&network_id[..8], %name, %addr, "peer connected");
                }
                Some(Event::PeerDisconnected { network_id, .. }) => {
                    info!(peer = %&network_id[..8], "peer disconnected");
                }
                None => break,
            }
        }
    }

    node.shutdown().await;
    Ok(())
}
