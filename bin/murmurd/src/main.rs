//! Murmur daemon - a gossip/DHT peer node.
//!
//! Binds a UDP port from the user's four-port range, joins the overlay,
//! and exposes the node through a small line-based console standing in
//! for a GUI: plain lines are gossiped as chat, `/`-prefixed commands
//! drive file sharing, downloads, search, and DHT membership.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use murmur_core::{OriginId, Peer, ShaDigest};
use murmur_node::runtime::{bind_socket, neighbor_peers};
use murmur_node::{Command, Event, Node, NodeConfig, NodeHandle, NodeRuntime};

/// Murmur daemon.
#[derive(Parser)]
#[command(name = "murmurd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.murmur/config.toml")]
    config: PathBuf,

    /// Disable forwarding of chat traffic through this node
    #[arg(long)]
    no_forward: bool,

    /// Peers to contact at startup, as host:port
    peers: Vec<String>,
}

/// Daemon configuration.
#[derive(Debug, Clone)]
struct DaemonConfig {
    /// Peers contacted at startup
    peers: Vec<String>,
    /// Chat-forwarding opt-out
    no_forward: bool,
    /// Where downloads and DHT copies land
    download_dir: PathBuf,
    /// Ring size (power of two)
    dht_spots: u32,
    /// DHT storage budget in kilobytes
    dht_size_limit_kb: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            no_forward: false,
            download_dir: PathBuf::from("."),
            dht_spots: 32,
            dht_size_limit_kb: 20,
        }
    }
}

/// Load configuration from TOML file.
fn load_config(path: &PathBuf) -> Result<DaemonConfig> {
    let path = expand_tilde(path);

    if !path.exists() {
        info!("No config file found at {:?}, using defaults", path);
        return Ok(DaemonConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;

    let toml: toml::Value = content.parse().context("Failed to parse config file")?;

    let mut config = DaemonConfig::default();

    // Parse [network] section
    if let Some(network) = toml.get("network") {
        if let Some(peers) = network.get("peers").and_then(|v| v.as_array()) {
            config.peers = peers
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect();
        }
        if let Some(no_forward) = network.get("no_forward").and_then(|v| v.as_bool()) {
            config.no_forward = no_forward;
        }
    }

    // Parse [storage] section
    if let Some(storage) = toml.get("storage") {
        if let Some(dir) = storage.get("download_dir").and_then(|v| v.as_str()) {
            config.download_dir = expand_tilde(&PathBuf::from(dir));
        }
    }

    // Parse [dht] section
    if let Some(dht) = toml.get("dht") {
        if let Some(spots) = dht.get("spots").and_then(|v| v.as_integer()) {
            if spots > 0 && (spots as u32).is_power_of_two() {
                config.dht_spots = spots as u32;
            } else {
                warn!(spots, "dht.spots must be a power of two, keeping default");
            }
        }
        if let Some(limit) = dht.get("size_limit_kb").and_then(|v| v.as_integer()) {
            config.dht_size_limit_kb = limit.max(0) as u64;
        }
    }

    Ok(config)
}

/// Expand ~ to home directory.
fn expand_tilde(path: &PathBuf) -> PathBuf {
    let s = path.to_string_lossy();
    if s.starts_with("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(&s[2..]);
        }
    }
    path.clone()
}

/// First port of this user's four-port range.
fn port_base() -> u16 {
    // Four consecutive ports per user keep multiple instances on one
    // host discoverable without configuration.
    let uid = unsafe { libc::getuid() } as u32;
    32768 + ((uid % 4096) as u16) * 4
}

/// Builds the node's origin id: readable, port-tagged, and suffixed with
/// enough randomness to make collisions implausible.
fn make_origin(port: u16, rng: &mut StdRng) -> OriginId {
    OriginId::new(format!("Node{}{}", port, rng.gen::<u32>()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    // Load configuration
    let mut config = load_config(&cli.config)?;
    if cli.no_forward {
        config.no_forward = true;
    }
    config.peers.extend(cli.peers.iter().cloned());

    // Bind a port from this user's range; failure is fatal.
    let base = port_base();
    let (socket, port) = bind_socket(base)
        .await
        .context("Failed to bind a UDP port")?;

    let mut rng = StdRng::from_entropy();
    let origin = make_origin(port, &mut rng);

    let mut node_config = NodeConfig::new(origin.clone(), Peer::new(Ipv4Addr::LOCALHOST, port));
    node_config.no_forward = config.no_forward;
    node_config.download_dir = config.download_dir.clone();
    node_config.n_spots = config.dht_spots;
    node_config.dht_size_limit_kb = config.dht_size_limit_kb;

    let mut node = Node::new(node_config, rng, Instant::now());

    // The other three ports of the range are presumed neighbors.
    for peer in neighbor_peers(base, port) {
        node.learn_peer(peer);
    }

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (runtime, handle) = NodeRuntime::new(socket, node, event_tx);

    println!("murmurd running");
    println!("  Origin:  {origin}");
    println!("  Port:    {port}");
    println!("  Peers:   type /help for commands");
    println!();

    // Configured and command-line peers resolve through the runtime.
    for arg in &config.peers {
        handle.send(Command::AddPeer(arg.clone())).await;
    }

    tokio::spawn(print_events(event_rx));
    tokio::spawn(read_console(handle.clone()));

    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_handle.send(Command::Shutdown).await;
        }
    });

    runtime.run().await?;
    info!("daemon stopped");
    Ok(())
}

/// Prints node notifications to the console.
async fn print_events(mut events: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::ChatMessage { origin, text } => println!("{origin}:\n > {text}"),
            Event::PrivateMessage { origin, text } => println!("{origin} (PM):\n > {text}"),
            Event::NewOrigin(origin) => println!("* new contact: {origin}"),
            Event::SearchResult {
                file_name,
                metafile,
                holder,
            } => println!("* found {file_name} at {holder} ({metafile})"),
            Event::SearchFinished { results } => println!("* search finished, {results} result(s)"),
            Event::DownloadComplete { path } => println!("* download complete: {}", path.display()),
            Event::Rejected { reason } => println!("* rejected: {reason}"),
            Event::JoinedDht => println!("* joined the DHT"),
            Event::LeftDht => println!("* left the DHT"),
        }
    }
}

/// Reads console lines: plain text gossips as chat, `/commands` drive
/// everything else.
async fn read_console(handle: NodeHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('/') {
            if !run_console_command(&handle, rest).await {
                break;
            }
        } else {
            handle.send(Command::SendChat(line.to_string())).await;
        }
    }
    handle.send(Command::Shutdown).await;
}

/// Returns false when the console asked to quit.
async fn run_console_command(handle: &NodeHandle, input: &str) -> bool {
    let mut parts = input.split_whitespace();
    match parts.next() {
        Some("peer") => {
            if let Some(arg) = parts.next() {
                handle.send(Command::AddPeer(arg.to_string())).await;
            } else {
                println!("usage: /peer host:port");
            }
        }
        Some("share") => {
            let path: String = parts.collect::<Vec<_>>().join(" ");
            if path.is_empty() {
                println!("usage: /share <path>");
            } else {
                handle.send(Command::ShareFile(PathBuf::from(path))).await;
            }
        }
        Some("download") => match (parts.next(), parts.next(), parts.next()) {
            (Some(target), Some(hash), Some(name)) => match ShaDigest::from_hex(hash) {
                Ok(metafile) => {
                    handle
                        .send(Command::Download {
                            target: OriginId::new(target),
                            metafile,
                            file_name: name.to_string(),
                        })
                        .await;
                }
                Err(_) => println!("metafile hash must be 40 hex characters"),
            },
            _ => println!("usage: /download <origin> <metafile-hex> <filename>"),
        },
        Some("search") => {
            let query: String = parts.collect::<Vec<_>>().join(" ");
            if query.is_empty() {
                println!("usage: /search <terms>");
            } else {
                handle.send(Command::Search(query)).await;
            }
        }
        Some("pm") => match parts.next() {
            Some(dest) => {
                let text: String = parts.collect::<Vec<_>>().join(" ");
                handle
                    .send(Command::SendPrivate {
                        dest: OriginId::new(dest),
                        text,
                    })
                    .await;
            }
            None => println!("usage: /pm <origin> <text>"),
        },
        Some("dht") => match parts.next() {
            Some("on") => handle.send(Command::SetDhtParticipation(true)).await,
            Some("off") => handle.send(Command::SetDhtParticipation(false)).await,
            _ => println!("usage: /dht on|off"),
        },
        Some("quit") => {
            return false;
        }
        _ => {
            println!("commands:");
            println!("  /peer host:port                      add a peer");
            println!("  /share <path>                        share a file");
            println!("  /download <origin> <hash> <name>     fetch a file");
            println!("  /search <terms>                      search shared files");
            println!("  /pm <origin> <text>                  private message");
            println!("  /dht on|off                          DHT membership");
            println!("  /quit                                exit");
            println!("  anything else is gossiped as chat");
        }
    }
    true
}
