use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use wanlink::{
    BundleSink, IfaceSelector, Link, LinkConfig, Reflector, RelayListener, AUTO_ASSIGN,
};

#[derive(Parser, Debug)]
#[command(name = "wanlink")]
#[command(author, version, about = "WAN relay link for distributed simulation traffic", long_about = None)]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Run the rendezvous relay.
    Relay {
        /// Address the relay listener binds.
        #[arg(short, long, default_value = "0.0.0.0:4000")]
        bind: SocketAddr,
    },
    /// Join a relay as a site.
    Join {
        /// Relay address (host:port).
        #[arg(short, long)]
        relay: String,

        /// Desired site name; defaults to relay-assigned.
        #[arg(short, long, default_value = AUTO_ASSIGN)]
        site_name: String,

        /// Local send port; 0 for ephemeral.
        #[arg(short = 'p', long, default_value = "0")]
        send_port: u16,

        /// Local interface: any, loopback, or an address.
        #[arg(short, long, default_value = "any")]
        interface: IfaceSelector,

        /// Re-establish the link after a failure.
        #[arg(long)]
        auto_reconnect: bool,
    },
}

/// Sink for a standalone site: counts what arrives, interprets nothing.
struct LogSink;

#[async_trait]
impl BundleSink for LogSink {
    async fn forward(&self, source_link: &str, payload: Vec<u8>) {
        info!(link = source_link, bytes = payload.len(), "received bundle");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    match args.mode {
        Mode::Relay { bind } => run_relay(bind).await,
        Mode::Join { relay, site_name, send_port, interface, auto_reconnect } => {
            run_site(relay, site_name, send_port, interface, auto_reconnect).await
        }
    }
}

async fn run_relay(bind: SocketAddr) -> Result<()> {
    let reflector = Arc::new(Reflector::new());
    let reaper = reflector.spawn_reaper();

    let listener = RelayListener::bind(bind, reflector.clone(), reflector.clone())
        .await
        .with_context(|| format!("failed to start relay listener on {}", bind))?;
    info!(addr = %listener.local_addr(), "relay ready");

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("received shutdown signal, exiting gracefully");

    listener.shutdown().await;
    reflector.down_all().await;
    reaper.abort();
    Ok(())
}

async fn run_site(
    relay: String,
    site_name: String,
    send_port: u16,
    interface: IfaceSelector,
    auto_reconnect: bool,
) -> Result<()> {
    let (address, port) = relay
        .rsplit_once(':')
        .context("relay must be host:port")
        .and_then(|(host, port)| {
            let port: u16 = port.parse().context("invalid relay port")?;
            Ok((host.to_string(), port))
        })?;

    let mut config = LinkConfig::new("wan", site_name, address, port);
    config.send_port = send_port;
    config.interface = interface;
    config.auto_reconnect = auto_reconnect;

    let link = Link::new(config, Arc::new(LogSink));
    match link.up().await {
        Ok(()) => info!(summary = %link.summary(), "joined relay"),
        Err(e) => {
            warn!(error = %e, "failed to join relay");
            anyhow::bail!("join failed: {}", e);
        }
    }

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("received shutdown signal, exiting gracefully");

    link.down().await;
    Ok(())
}
