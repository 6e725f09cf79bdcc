//! NetherLink CLI - Bedrock multiplayer through a peer tunnel
//!
//! Point the game at the loopback ingress; the relay logs in to the chosen
//! server as your account and follows server transfers.

mod config;
mod dev_session;
mod servers;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use netherlink_proto::{strip_formatting, ServerEntry, ServerStatus};
use netherlink_relay::{join_host_port, PathSelector, RelayService, Session, StatusPoller};
use netherlink_transport::{Dialer, RakNetDialer, TcpDialer, TcpSignaling};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::{ConfigManager, NetherlinkConfig};
use servers::{split_host_port, ServerStore};

/// NetherLink - Play on Bedrock servers through a peer tunnel
#[derive(Parser, Debug)]
#[command(name = "netherlink")]
#[command(about = "NetherLink - Play on Bedrock servers through a peer tunnel")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Relay the game to a server
    #[command(long_about = r#"
Start the loopback ingress and the relay, then join the game to
"NetherLink" in the Friends/LAN tab (or add 127.0.0.1:19132).

EXAMPLES:
  # Relay to a server using a development session
  netherlink serve --server play.example.net:19132 --session ./session.json

ENVIRONMENT VARIABLES:
  NETHERLINK_SERVER     Server to relay to (host[:port])
  NETHERLINK_SESSION    Development session file
  NETHERLINK_SIGNALING  Signaling rendezvous bind address
    "#)]
    Serve {
        /// Server address (host[:port], port defaults to 19132)
        #[arg(long, env = "NETHERLINK_SERVER")]
        server: String,

        /// Development session file (JSON with xuid and displayName)
        #[arg(long, env = "NETHERLINK_SESSION")]
        session: Option<PathBuf>,

        /// Signaling rendezvous bind address
        #[arg(long, env = "NETHERLINK_SIGNALING")]
        signaling: Option<String>,

        /// Do not answer LAN discovery pings
        #[arg(long)]
        no_discovery: bool,

        /// Dial the server over framed TCP instead of RakNet (development relays)
        #[arg(long)]
        tcp_upstream: bool,
    },

    /// Measure latency to every address of a host
    Ping {
        host: String,

        #[arg(long, default_value = "19132")]
        port: u16,

        /// Probes per address
        #[arg(long, default_value = "3")]
        count: u32,

        /// Probe timeout in milliseconds
        #[arg(long, default_value = "2000")]
        timeout: u64,
    },

    /// Show the status of every saved server
    Status {
        /// Polling cycles to wait for replies
        #[arg(long, default_value = "1")]
        cycles: u32,
    },

    /// Manage saved servers
    Servers {
        #[command(subcommand)]
        command: ServersCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ServersCommand {
    /// List saved servers, most recently played first
    List,
    /// Add or replace a server
    Add {
        name: String,
        /// host[:port]
        address: String,
    },
    /// Remove a server by name
    Remove { name: String },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn serve(
    config: NetherlinkConfig,
    server: String,
    session: Option<PathBuf>,
    signaling: Option<String>,
    no_discovery: bool,
    tcp_upstream: bool,
) -> Result<()> {
    let (host, port) = split_host_port(&server)?;

    let session_path = session.or(config.session_file.clone()).context(
        "No session configured: pass --session or set session_file in ~/.netherlink/config.json",
    )?;
    let session = dev_session::load(&session_path)?;
    info!(
        "Session: {} ({})",
        session.identity().display_name,
        session.xuid()
    );

    let signaling_addr: SocketAddr = signaling
        .unwrap_or_else(|| config.signaling_addr.clone())
        .parse()
        .context("Invalid signaling address")?;
    let signaling = Arc::new(
        TcpSignaling::bind(signaling_addr)
            .await
            .context("Failed to start signaling rendezvous")?,
    );

    let mut relay_config = config.relay;
    if no_discovery {
        relay_config.discovery = false;
    }

    let dialer: Arc<dyn Dialer> = if tcp_upstream {
        Arc::new(TcpDialer::default())
    } else {
        Arc::new(RakNetDialer::default())
    };

    let service = RelayService::builder(Arc::new(session), signaling.clone(), dialer)
        .config(relay_config)
        .build();

    service.join(&host, port).await;
    match ServerStore::new().and_then(|store| store.mark_played(&host, port)) {
        Ok(_) => {}
        Err(e) => warn!("Could not update server list: {:#}", e),
    }

    service
        .start()
        .await
        .context("Failed to start loopback ingress")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    service.shutdown().await;
    signaling.shutdown().await;
    Ok(())
}

async fn ping(host: String, port: u16, count: u32, timeout: u64) -> Result<()> {
    let selector = PathSelector::system(count.max(1), Duration::from_millis(timeout));
    let results = selector
        .probe_all(&host, port)
        .await
        .context(format!("Failed to resolve {}", host))?;

    println!("{} ({} addresses)", host, results.len());
    for result in &results {
        match result.mean {
            Some(mean) => println!(
                "  {:<40} {:>8.1} ms  ({}/{} replies)",
                result.address,
                mean.as_secs_f64() * 1000.0,
                result.successes,
                count
            ),
            None => println!("  {:<40} unreachable", result.address),
        }
    }

    match PathSelector::best_of(&results) {
        Some(best) => println!("Best: {}", join_host_port(&best.address.to_string(), port)),
        None => println!("No address answered; {} would be dialed as-is", host),
    }
    Ok(())
}

async fn status(config: NetherlinkConfig, cycles: u32) -> Result<()> {
    let servers = ServerStore::new()?.list()?;
    let poller = StatusPoller::start(&config.relay)
        .await
        .context("Failed to open status socket")?;

    let latest: Arc<Mutex<HashMap<String, ServerStatus>>> = Arc::new(Mutex::new(HashMap::new()));
    for server in &servers {
        let latest = latest.clone();
        let name = server.name.clone();
        let callback = Arc::new(move |status: ServerStatus| {
            if let Ok(mut latest) = latest.lock() {
                latest.insert(name.clone(), status);
            }
        });
        if let Err(e) = poller.add_server(&server.address(), callback).await {
            warn!("Skipping {}: {}", server.name, e);
        }
    }

    let wait = config.relay.status_cycle.saturating_mul(cycles.max(1));
    tokio::time::sleep(wait).await;
    poller.close();

    let latest = latest
        .lock()
        .map_err(|_| anyhow::anyhow!("Status table poisoned"))?;
    for server in &servers {
        print_status(server, latest.get(&server.name));
    }
    Ok(())
}

fn print_status(server: &ServerEntry, status: Option<&ServerStatus>) {
    match status {
        Some(status) => println!(
            "{:<20} {:>5}/{:<5} {:<10} {}",
            server.name,
            status.player_count,
            status.max_players,
            status.version,
            strip_formatting(&status.server_name)
        ),
        None => println!("{:<20} offline", server.name),
    }
}

fn manage_servers(command: ServersCommand) -> Result<()> {
    let store = ServerStore::new()?;
    match command {
        ServersCommand::List => {
            for server in store.list()? {
                let played = server
                    .last_played
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("{:<20} {:<40} {}", server.name, server.address(), played);
            }
        }
        ServersCommand::Add { name, address } => {
            let (host, port) = split_host_port(&address)?;
            store.add(ServerEntry::new(name.clone(), host, port))?;
            println!("Saved {}", name);
        }
        ServersCommand::Remove { name } => {
            if store.remove(&name)? {
                println!("Removed {}", name);
            } else {
                anyhow::bail!("No saved server named {}", name);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Serve {
            server,
            session,
            signaling,
            no_discovery,
            tcp_upstream,
        } => {
            let config = ConfigManager::load()?;
            serve(config, server, session, signaling, no_discovery, tcp_upstream).await
        }
        Commands::Ping {
            host,
            port,
            count,
            timeout,
        } => ping(host, port, count, timeout).await,
        Commands::Status { cycles } => status(ConfigManager::load()?, cycles).await,
        Commands::Servers { command } => manage_servers(command),
    }
}
