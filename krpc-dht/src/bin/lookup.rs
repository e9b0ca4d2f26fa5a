//! DHT peer lookup
//!
//! Finds peers for a torrent by walking the public Mainline DHT, and
//! optionally announces us as a peer to the nodes that issued tokens.

use std::net::SocketAddrV4;
use std::time::Duration;

use clap::Parser;
use krpc_dht::{Dht, DhtConfig, InfoHash};
use tracing::warn;

#[derive(Parser)]
#[command(name = "lookup")]
#[command(about = "Find torrent peers via the BitTorrent Mainline DHT")]
#[command(version)]
struct Args {
    /// Torrent info hash, 40 hex characters
    info_hash: String,

    /// UDP address to bind
    #[arg(long, default_value = "0.0.0.0:0")]
    bind: SocketAddrV4,

    /// Bootstrap node (host:port); may be given multiple times.
    /// Defaults to the well-known public routers.
    #[arg(long = "bootstrap", value_name = "HOST:PORT")]
    bootstrap: Vec<String>,

    /// Give up on the lookup after this many seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    /// Announce this TCP port for the info hash after the lookup
    #[arg(long)]
    announce_port: Option<u16>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,
}

#[derive(Copy, Clone, Debug, clap::ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::from(args.log_level))
        .with_target(false)
        .init();

    let Some(info_hash) = InfoHash::from_hex(&args.info_hash) else {
        eprintln!("Error: info hash must be 40 hex characters");
        std::process::exit(1);
    };

    let mut config = DhtConfig {
        bind_addr: args.bind,
        ..DhtConfig::default()
    };
    if !args.bootstrap.is_empty() {
        config.bootstrap_nodes = args.bootstrap;
    }

    let dht = Dht::start(config).await?;
    println!("node {} listening on {}", dht.local_id(), dht.local_addr());
    println!("looking up peers for {}", info_hash);

    let timeout = Duration::from_secs(args.timeout_secs);
    let result = tokio::select! {
        result = dht.bootstrap_by_get_peers(info_hash, None, timeout) => result?,
        _ = tokio::signal::ctrl_c() => {
            println!("interrupted");
            dht.shutdown().await?;
            return Ok(());
        }
    };

    println!(
        "visited {} nodes, found {} peers",
        result.contacts.len(),
        result.peers.len()
    );
    for peer in &result.peers {
        println!("  {peer}");
    }

    if let Some(port) = args.announce_port {
        let mut announced = 0usize;
        for (contact, token) in result.tokens {
            match dht
                .announce_peer(contact.addr, info_hash, port, token, false)
                .await
            {
                Ok(_) => announced += 1,
                Err(error) => warn!(to = %contact.addr, %error, "announce failed"),
            }
        }
        println!("announced port {port} to {announced} nodes");
    }

    dht.shutdown().await?;
    Ok(())
}
