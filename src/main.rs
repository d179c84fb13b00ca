use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use replikv::config::{NodeConfig, PeerConfig};
use replikv::node::Node;
use replikv::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "replikv")]
#[command(about = "A replicated key-value store built on Raft consensus")]
struct Args {
    /// Node ID (unique identifier for this replica)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for Raft gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Port for the client-facing HTTP API
    #[arg(long, default_value = "8080")]
    api_port: u16,

    /// Directory for persistent state (term, vote, log)
    #[arg(long, default_value = "./data")]
    data_dir: PathBuf,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,
}

/// Parse the `--peers` list. Entries that do not match `id:host:port`
/// are skipped with a warning rather than aborting startup.
fn parse_peers(list: &str) -> Vec<PeerConfig> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let fields: Vec<&str> = entry.splitn(2, ':').collect();
            match fields[..] {
                [id, addr] if addr.split(':').count() == 2 => match id.parse() {
                    Ok(node_id) => Some(PeerConfig {
                        node_id,
                        addr: addr.to_string(),
                    }),
                    Err(_) => {
                        tracing::warn!(entry, "skipping peer with non-numeric id");
                        None
                    }
                },
                _ => {
                    tracing::warn!(entry, "skipping peer, expected id:host:port");
                    None
                }
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let api_addr: SocketAddr = format!("0.0.0.0:{}", args.api_port).parse()?;
    let peers = parse_peers(&args.peers);

    let config = NodeConfig {
        node_id: args.node_id,
        listen_addr,
        api_addr,
        data_dir: args.data_dir,
        peers,
        ..Default::default()
    };

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        api_addr = %config.api_addr,
        data_dir = %config.data_dir.display(),
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting replikv node"
    );

    let shutdown = install_shutdown_handler();
    let (node, raft_rx) = Node::new(config, shutdown)?;
    node.run(raft_rx).await?;

    Ok(())
}
