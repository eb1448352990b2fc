//! Palisade node binary
//!
//! Minimal node wrapper around the networking core: parses the CLI, wires
//! the in-memory chain store to the coordinator, and runs until ctrl-c.

use clap::Parser;
use palisade::chain::memory::{mine_header, GenesisParams, MemoryChainStore};
use palisade::chain::{ChainStore, REGTEST_BITS};
use palisade::net::{ConnLimits, Coordinator, NetConfig, TcpTransport};
use std::net::{IpAddr, Ipv4Addr};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "palisade", version, about = "Palisade: headers-only chain node")]
struct Args {
    /// Network magic as 8 hex digits (no default: networks must not mix)
    #[arg(long)]
    magic: String,

    /// Listen port (no default: networks must not mix)
    #[arg(short, long)]
    port: u16,

    /// Data directory for anchors.json, banlist.json, peers.json
    #[arg(short, long, default_value = "./data")]
    datadir: PathBuf,

    /// Seed peers to connect to (comma-separated host:port)
    #[arg(short, long)]
    seeds: Option<String>,

    /// Accept and dial non-routable addresses (local test networks)
    #[arg(long)]
    allow_unroutable: bool,

    /// Disable the TCP listener (outbound-only node)
    #[arg(long)]
    no_listen: bool,

    /// Maximum outbound connections
    #[arg(long, default_value_t = 8)]
    max_outbound: usize,

    /// Maximum inbound connections
    #[arg(long, default_value_t = 125)]
    max_inbound: usize,

    /// Mine a block on the local tip every N seconds (test networks)
    #[arg(long)]
    mine_interval: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "palisade=info".into()),
        )
        .init();

    let args = Args::parse();

    let magic = match u32::from_str_radix(args.magic.trim_start_matches("0x"), 16) {
        Ok(magic) => magic,
        Err(err) => {
            error!("invalid --magic value {:?}: {err}", args.magic);
            std::process::exit(2);
        }
    };

    if let Err(err) = std::fs::create_dir_all(&args.datadir) {
        error!("cannot create datadir {:?}: {err}", args.datadir);
        std::process::exit(1);
    }

    let chain = Arc::new(MemoryChainStore::with_genesis(GenesisParams::default()));

    let transport = if args.no_listen {
        Arc::new(TcpTransport::dial_only())
    } else {
        let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), args.port);
        match TcpTransport::bind(bind_addr).await {
            Ok(transport) => Arc::new(transport),
            Err(err) => {
                error!("cannot bind port {}: {err}", args.port);
                std::process::exit(1);
            }
        }
    };

    let mut config = NetConfig::new(magic, args.port, args.datadir.clone());
    config.allow_unroutable = args.allow_unroutable;
    config.limits = ConnLimits {
        max_outbound: args.max_outbound,
        max_inbound: args.max_inbound,
        ..ConnLimits::default()
    };

    let coordinator = Coordinator::new(config, chain.clone(), transport);
    if let Err(err) = coordinator.start().await {
        error!("failed to start network: {err}");
        std::process::exit(1);
    }
    info!("node up on port {} (height {})", args.port, chain.chain_height());

    if let Some(seeds) = args.seeds.as_deref() {
        for seed in seeds.split(',') {
            match seed.trim().parse::<SocketAddr>() {
                Ok(addr) => {
                    coordinator.add_addresses(&[addr]);
                    let result = coordinator.add_node(addr).await;
                    info!("seed {addr}: {result:?}");
                }
                Err(err) => error!("bad seed {seed:?}: {err}"),
            }
        }
    }

    // Optional local miner for test networks.
    if let Some(interval) = args.mine_interval {
        let chain = chain.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval));
            loop {
                ticker.tick().await;
                let header = mine_header(
                    chain.tip_hash(),
                    [0u8; 20],
                    palisade::now() as u32,
                    REGTEST_BITS,
                );
                match chain.accept_block_header(&header, -1, true) {
                    Ok(entry) => {
                        chain.activate_best_chain();
                        info!("mined block at height {}", entry.height);
                    }
                    Err(err) => error!("mined header rejected: {err}"),
                }
            }
        });
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("signal wait failed: {err}");
    }
    info!("shutting down");
    if let Err(err) = coordinator.stop() {
        error!("shutdown error: {err}");
        std::process::exit(1);
    }
}
