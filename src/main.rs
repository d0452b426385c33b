use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use bitwire::{Network, Settings};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NetworkChoice {
    Mainnet,
    Testnet,
    Regtest,
    Signet,
}

impl NetworkChoice {
    fn magic(self) -> u32 {
        match self {
            NetworkChoice::Mainnet => bitwire::wire::MAINNET_MAGIC,
            NetworkChoice::Testnet => bitwire::wire::TESTNET_MAGIC,
            NetworkChoice::Regtest => bitwire::wire::REGTEST_MAGIC,
            NetworkChoice::Signet => bitwire::wire::SIGNET_MAGIC,
        }
    }

    fn default_port(self) -> u16 {
        match self {
            NetworkChoice::Mainnet => 8333,
            NetworkChoice::Testnet => 18333,
            NetworkChoice::Regtest => 18444,
            NetworkChoice::Signet => 38333,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "bitwire")]
#[command(author, version, about = "Bitcoin P2P networking runtime", long_about = None)]
struct Args {
    #[arg(short, long, value_enum, default_value_t = NetworkChoice::Mainnet)]
    network: NetworkChoice,

    /// Inbound listener port; 0 disables the listener.
    #[arg(short, long)]
    port: Option<u16>,

    /// Cap on concurrent inbound channels.
    #[arg(long, default_value_t = 8)]
    inbound: u32,

    /// Target count of dialed channels.
    #[arg(long, default_value_t = 8)]
    outbound: u32,

    /// Worker threads for the runtime.
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Address book location.
    #[arg(long, default_value = "hosts.cache")]
    hosts_file: PathBuf,

    /// Extra DNS seed, HOST:PORT; repeatable. Replaces the defaults.
    #[arg(long = "seed", value_name = "HOST:PORT")]
    seeds: Vec<String>,

    /// Peer to dial immediately, HOST:PORT; repeatable.
    #[arg(short, long = "connect", value_name = "HOST:PORT")]
    connect: Vec<String>,
}

impl Args {
    fn settings(&self) -> Settings {
        let mut settings = Settings {
            threads: self.threads,
            magic: self.network.magic(),
            inbound_port: self.port.unwrap_or_else(|| self.network.default_port()),
            inbound_connections: self.inbound,
            outbound_connections: self.outbound,
            hosts_file: self.hosts_file.clone(),
            ..Settings::default()
        };
        if !self.seeds.is_empty() {
            settings.seeds = self.seeds.clone();
        } else if !matches!(self.network, NetworkChoice::Mainnet) {
            // The built-in seed list is mainnet only.
            settings.seeds = Vec::new();
        }
        settings
    }
}

fn parse_peer(peer: &str) -> Result<(String, u16)> {
    let (host, port) = peer
        .rsplit_once(':')
        .context("peer must be HOST:PORT")?;
    let port: u16 = port.parse().context("invalid peer port")?;
    Ok((host.to_string(), port))
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let settings = args.settings();

    // The `threads` option lands here: the runtime is the worker pool.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.threads)
        .enable_all()
        .build()
        .context("failed to build runtime")?;

    runtime.block_on(serve(settings, args.connect))
}

async fn serve(settings: Settings, peers: Vec<String>) -> Result<()> {
    let network = Network::new(settings);

    network.start().await.context("network start failed")?;
    info!("network started");

    network.subscribe_connections(|event| match event {
        Ok(channel) => info!(peer = %channel.authority(), "channel admitted"),
        Err(code) => debug!(error = %code, "connection subscription closed"),
    })?;

    network.run().await.context("network run failed")?;

    for peer in &peers {
        let (host, port) = parse_peer(peer)?;
        match network.connect(&host, port).await {
            Ok(channel) => info!(peer = %channel.authority(), "manual channel up"),
            Err(code) => warn!(peer = %peer, error = %code, "manual connect failed"),
        }
    }

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("received shutdown signal, stopping");

    match network.stop().await {
        Ok(()) => info!("network stopped"),
        Err(code) => warn!(error = %code, "network stopped with error"),
    }
    Ok(())
}
