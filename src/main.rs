//! conhub - console-aggregation server.
//!
//! Accepts client connections, performs the line-based handshake, and
//! establishes console sessions for the I/O multiplexer to drive.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conhub::config::Config;
use conhub::console::ConsoleRegistry;
use conhub::server;

/// conhub - console-aggregation server.
///
/// Clients greet with `HELLO USER='<name>'`, then issue one of CONNECT,
/// EXECUTE, MONITOR, or QUERY against the configured console set.
#[derive(Parser, Debug)]
#[command(name = "conhub", version, about, long_about = None)]
struct Cli {
    /// Address to bind the request listener (overrides the config file)
    #[arg(long, env = "CONHUB_BIND")]
    bind: Option<SocketAddr>,

    /// Path to the TOML configuration file
    #[arg(long, default_value = "conhub.toml")]
    config: PathBuf,

    /// Declare a console by name (repeatable; merged with the config file)
    #[arg(long = "console")]
    consoles: Vec<String>,

    /// Cap on concurrently registered socket peers
    #[arg(long)]
    max_sockets: Option<usize>,
}

const DEFAULT_BIND: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 7890);

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "conhub=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?
        .unwrap_or_default();

    let bind = cli.bind.or(config.listen).unwrap_or(DEFAULT_BIND);

    let max_sockets = cli.max_sockets.or(config.max_sockets);
    let registry = match max_sockets {
        Some(max) => ConsoleRegistry::with_max_sockets(Some(max)),
        None => ConsoleRegistry::new(),
    };

    for def in &config.consoles {
        registry
            .add_console(&def.name)
            .with_context(|| format!("registering console {:?}", def.name))?;
    }
    for name in &cli.consoles {
        registry
            .add_console(name)
            .with_context(|| format!("registering console {name:?}"))?;
    }
    tracing::info!(consoles = registry.console_count(), "registry seeded");

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("binding {bind}"))?;

    let cancel = tokio_util::sync::CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            signal_cancel.cancel();
        }
    });

    server::serve(registry, listener, cancel).await?;
    tracing::info!("conhub stopped");
    Ok(())
}
