//! LanLink - Serverless peer messaging for local networks
//!
//! Joins a group of peers on the LAN and relays chat lines between them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use lanlink::config::{self, Config};
use lanlink::protocol::{self, VALUE_TYPE_COUNT};
use lanlink::{
    Discovery, DiscoveryEvent, MessageType, Node, NodeEvent, TransportEvent, Value,
};

/// Message type used for chat lines
const CHAT_MESSAGE: i32 = 2;

/// LanLink - Serverless peer messaging
#[derive(Parser)]
#[command(name = "lanlink")]
#[command(version)]
#[command(about = "Discover peers on the local network and exchange messages", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the network and broadcast lines typed on stdin
    Run {
        /// Transport port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Friendly name announced to peers
        #[arg(short, long)]
        name: Option<String>,

        /// Group to join
        #[arg(short, long)]
        group: Option<String>,

        /// Application tick interval (milliseconds)
        #[arg(long, default_value_t = 16)]
        tick_ms: u64,
    },

    /// Listen for discovery beacons and list peers
    Discover {
        /// How long to scan (seconds)
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,

        /// Group to look in
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run {
            port,
            name,
            group,
            tick_ms,
        } => {
            let mut config = config;
            if let Some(port) = port {
                config.transport.port = port;
            }
            if let Some(name) = name {
                config.general.name = name;
            }
            if let Some(group) = group {
                config.discovery.group_id = group;
            }
            run_node(config, Duration::from_millis(tick_ms.max(1))).await?;
        }
        Commands::Discover { timeout, group } => {
            let mut config = config;
            if let Some(group) = group {
                config.discovery.group_id = group;
            }
            run_discovery(config, timeout).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_info(&config);
        }
    }

    Ok(())
}

/// Join the network and relay chat lines until Ctrl+C
async fn run_node(config: Config, tick: Duration) -> anyhow::Result<()> {
    let mut node = Node::new(&config);
    node.start()?;

    println!("\n========================================");
    println!("  LanLink Node Running");
    println!("========================================");
    println!("  Name:  {}", config.general.name);
    println!("  UID:   {}", node.transport().uid());
    println!("  App:   {}", config.discovery.app_id);
    println!("  Group: {}", config.discovery.group_id);
    println!("  Port:  {}", config.transport.port);
    println!("========================================");
    println!("\nType a line to send it to every peer.");
    println!("Press Ctrl+C to stop.\n");

    let mut interval = tokio::time::interval(tick);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut names: BTreeMap<i32, String> = BTreeMap::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for event in node.update() {
                    handle_event(&node, &mut names, event);
                }
            }
            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if !line.trim().is_empty() => send_chat(&node, line.trim()),
                    Ok(Some(_)) => {}
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        tracing::warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    node.shutdown();
    tracing::info!("Node stopped");

    Ok(())
}

fn handle_event(node: &Node, names: &mut BTreeMap<i32, String>, event: NodeEvent) {
    match event {
        NodeEvent::Discovery(DiscoveryEvent::PeerFound(peer)) => {
            println!("? Found {} ({})", peer.hostname, peer.address);
        }
        NodeEvent::Discovery(DiscoveryEvent::PeerLost(peer)) => {
            println!("? Lost {} ({})", peer.hostname, peer.address);
        }
        NodeEvent::Transport(TransportEvent::PeerConnected { addr }) => {
            println!("+ Connected: {}", addr);
        }
        NodeEvent::Transport(TransportEvent::PeerDisconnected { addr, reason }) => {
            println!("- Disconnected: {} ({})", addr, reason);
        }
        NodeEvent::Transport(TransportEvent::PeerJoined { uid, name }) => {
            println!("* {} joined as {}", name, uid);
            names.insert(uid, name);
        }
        NodeEvent::Transport(TransportEvent::Message(mut msg)) => {
            if msg.message_type() == MessageType::UserDefined(CHAT_MESSAGE) {
                let sender = names
                    .get(&msg.from_uid())
                    .cloned()
                    .unwrap_or_else(|| msg.from_uid().to_string());
                match msg.read_value() {
                    Ok(Value::String(text)) => println!("<{}> {}", sender, text),
                    Ok(other) => tracing::warn!("Unexpected chat payload: {:?}", other),
                    Err(e) => tracing::warn!("Malformed chat message from {}: {}", sender, e),
                }
            } else {
                tracing::debug!("Ignoring {:?}", msg);
            }
            if let Err(e) = node.transport().recycle(msg) {
                tracing::error!("Failed to recycle message: {}", e);
            }
        }
    }
}

fn send_chat(node: &Node, text: &str) {
    let transport = node.transport();
    if transport.peer_count() == 0 {
        println!("(no peers connected)");
        return;
    }

    let mut msg = transport.take_message();
    msg.set_message_type(MessageType::UserDefined(CHAT_MESSAGE));
    let result = msg
        .write_value(&Value::from(text))
        .map_err(anyhow::Error::from)
        .and_then(|_| transport.send(&msg).map_err(anyhow::Error::from));
    if let Err(e) = result {
        tracing::warn!("Failed to send chat line: {}", e);
    }
    if let Err(e) = transport.recycle(msg) {
        tracing::error!("Failed to recycle message: {}", e);
    }
}

/// Listen for beacons for a while and print every peer seen
async fn run_discovery(config: Config, timeout_secs: u64) -> anyhow::Result<()> {
    println!(
        "Scanning for '{}' peers in group '{}' ({} seconds)...\n",
        config.discovery.app_id, config.discovery.group_id, timeout_secs
    );

    let mut discovery = Discovery::new(config.discovery.clone());
    discovery.start()?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    let mut interval = tokio::time::interval(Duration::from_millis(100));
    let mut seen = BTreeMap::new();

    loop {
        tokio::select! {
            _ = interval.tick() => {
                for event in discovery.update() {
                    if let DiscoveryEvent::PeerFound(peer) = event {
                        println!("  {} ({})", peer.hostname, peer.address);
                        seen.insert(peer.hostname, peer.address);
                    }
                }
            }
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    discovery.stop();
    println!("\nDiscovery complete: {} peer(s) found.", seen.len());

    Ok(())
}

/// Print protocol information
fn print_info(config: &Config) {
    let discovery = Discovery::new(config.discovery.clone());

    println!("LanLink {}", env!("CARGO_PKG_VERSION"));
    println!("==========================\n");

    println!("Hostname: {}", discovery.hostname());
    println!("Local Address: {}", discovery.local_address());
    println!("Broadcast Target: {}", discovery.broadcast_target());

    println!("\nTransport Port: {}", protocol::DEFAULT_TRANSPORT_PORT);
    println!("Discovery Port: {}", protocol::DEFAULT_DISCOVERY_PORT);
    println!("Max Message Size: {} bytes", protocol::MAX_MESSAGE_SIZE);
    println!("Header Size: {} bytes", protocol::HEADER_SIZE);
    println!("Typed Value Kinds: {}", VALUE_TYPE_COUNT);
}
