//! LanMesh Client
//!
//! CLI for the lobby-scoped mesh VPN overlay. The production transport is
//! supplied by the hosting application; this binary drives the overlay
//! against the in-memory lobby so a full negotiation, routing, and
//! data-path cycle can be observed on one machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::{BufMut, BytesMut};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lanmesh_core::VpnBridge;
use lanmesh_network::{LoopbackTun, MemoryHub, MessagePump};
use lanmesh_proto::{ip, PeerId};

mod config;

use config::ClientConfig;

/// LanMesh - lobby-scoped mesh VPN overlay
#[derive(Parser)]
#[command(name = "lanmesh")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "lanmesh.toml")]
    config: PathBuf,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a simulated lobby of in-process peers
    Sim {
        /// Number of peers in the lobby
        #[arg(short, long, default_value = "3")]
        peers: u64,

        /// Virtual subnet (overrides config)
        #[arg(long)]
        subnet: Option<String>,

        /// Subnet mask (overrides config)
        #[arg(long)]
        netmask: Option<String>,

        /// Seconds to keep the lobby alive after convergence
        #[arg(short, long, default_value = "3")]
        duration: u64,
    },

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Sim {
            peers,
            subnet,
            netmask,
            duration,
        } => cmd_sim(cli.config, peers, subnet, netmask, duration).await,
        Commands::Init { force } => cmd_init(cli.config, force).await,
        Commands::Config => cmd_config(cli.config).await,
    }
}

struct SimPeer {
    name: String,
    bridge: Arc<VpnBridge>,
    pump: Arc<MessagePump>,
    tun: Arc<LoopbackTun>,
}

async fn cmd_sim(
    config_path: PathBuf,
    peers: u64,
    subnet: Option<String>,
    netmask: Option<String>,
    duration: u64,
) -> Result<()> {
    anyhow::ensure!(peers >= 1, "A lobby needs at least one peer");

    let mut config = ClientConfig::load_or_create(&config_path).await?;
    if let Some(subnet) = subnet {
        config.vpn.subnet = subnet;
    }
    if let Some(netmask) = netmask {
        config.vpn.netmask = netmask;
    }
    config.validate()?;

    info!("Simulating a lobby of {} peers", peers);
    let hub = MemoryHub::new();
    let mut lobby: Vec<SimPeer> = Vec::new();

    for n in 1..=peers {
        let id = PeerId(n);
        let name = format!("peer-{}", n);
        let transport = Arc::new(hub.join(id, &name));
        let tun = LoopbackTun::new(&format!("sim{}", n), 1100);

        let bridge = VpnBridge::new(
            transport.clone(),
            Arc::new(hub.clone()),
            id,
            config.vpn.clone(),
        );
        bridge
            .start_with_device(tun.clone())
            .await
            .with_context(|| format!("Failed to start {}", name))?;

        let pump = Arc::new(MessagePump::new(transport, bridge.clone()));
        pump.start();

        // Existing peers greet the newcomer
        for existing in &lobby {
            existing.bridge.on_peer_joined(id).await;
        }

        lobby.push(SimPeer {
            name,
            bridge,
            pump,
            tun,
        });
    }

    wait_for_convergence(&lobby).await?;
    print_lobby(&lobby);

    // One broadcast through the data plane, so the counters move
    if let Some(first) = lobby.first() {
        if let Some(addr) = first.bridge.local_ip() {
            let (base, mask) = config
                .vpn
                .subnet_pair()
                .map_err(|e| anyhow::anyhow!(e))?;
            let dest = ip::subnet_broadcast(base, mask);
            first.tun.inject(hello_packet(u32::from(addr), dest));
        }
    }

    // Let the lobby run; ctrl-c cuts the wait short
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down...");
        }
    }
    print_stats(&lobby);

    for peer in &lobby {
        peer.pump.stop().await;
        peer.bridge.stop().await;
    }
    Ok(())
}

async fn wait_for_convergence(lobby: &[SimPeer]) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);

    loop {
        let settled = lobby.iter().all(|peer| {
            peer.bridge.local_ip().is_some()
                && peer.bridge.routing_table_snapshot().len() == lobby.len()
        });
        if settled {
            return Ok(());
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "Lobby did not converge within 10 seconds"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn print_lobby(lobby: &[SimPeer]) {
    println!("\nLobby converged");
    println!("{:<10} {:<16} {:<12} {}", "Peer", "Address", "Device", "Routes");
    println!("{}", "-".repeat(50));

    for peer in lobby {
        println!(
            "{:<10} {:<16} {:<12} {}",
            peer.name,
            peer.bridge
                .local_ip()
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".into()),
            peer.bridge.device_name().unwrap_or_else(|| "-".into()),
            peer.bridge.routing_table_snapshot().len(),
        );
    }
}

fn print_stats(lobby: &[SimPeer]) {
    println!("\nTraffic");
    println!(
        "{:<10} {:>8} {:>8} {:>10} {:>10} {:>8}",
        "Peer", "TxPkts", "RxPkts", "TxBytes", "RxBytes", "Dropped"
    );
    println!("{}", "-".repeat(60));

    for peer in lobby {
        let stats = peer.bridge.statistics();
        println!(
            "{:<10} {:>8} {:>8} {:>10} {:>10} {:>8}",
            peer.name,
            stats.packets_sent,
            stats.packets_received,
            stats.bytes_sent,
            stats.bytes_received,
            stats.packets_dropped,
        );
    }
}

/// A minimal UDP datagram for the smoke broadcast
fn hello_packet(src: u32, dest: u32) -> bytes::Bytes {
    let payload = b"lanmesh-hello";
    let mut buf = BytesMut::with_capacity(28 + payload.len());
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16((28 + payload.len()) as u16);
    buf.put_u32(0);
    buf.put_u8(64);
    buf.put_u8(17);
    buf.put_u16(0);
    buf.put_u32(src);
    buf.put_u32(dest);
    // UDP header
    buf.put_u16(40000);
    buf.put_u16(40000);
    buf.put_u16((8 + payload.len()) as u16);
    buf.put_u16(0);
    buf.put_slice(payload);
    buf.freeze()
}

async fn cmd_init(config_path: PathBuf, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {:?}. Use --force to overwrite.",
            config_path
        );
    }

    let config = ClientConfig::default();
    config.save(&config_path).await?;
    info!("Config written to {:?}", config_path);
    Ok(())
}

async fn cmd_config(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        ClientConfig::load(&config_path).await?
    } else {
        ClientConfig::default()
    };
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
