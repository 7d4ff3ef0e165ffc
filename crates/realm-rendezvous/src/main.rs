//! `realm-rendezvous`: standalone rendezvous service for Realm peers.

use clap::Parser;
use realm_rendezvous::{RendezvousConfig, RendezvousServer};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(
    name = "realm-rendezvous",
    version,
    about = "Rendezvous service for Realm peers (registry, lookup, signaling relay)"
)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8787")]
    listen: SocketAddr,

    /// Shared registration token. Falls back to $REALM_TOKEN.
    #[arg(long)]
    token: Option<String>,

    /// Seconds of silence before a peer is considered gone.
    #[arg(long, default_value_t = 90)]
    peer_ttl_secs: u64,
}

fn init_tracing_stderr() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing_stderr();

    let config = RendezvousConfig {
        listen_addr: cli.listen,
        auth_token: cli
            .token
            .or_else(|| std::env::var("REALM_TOKEN").ok())
            .filter(|t| !t.is_empty()),
        peer_ttl: Duration::from_secs(cli.peer_ttl_secs.max(1)),
    };

    let server = match RendezvousServer::start(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start rendezvous service: {e}");
            std::process::exit(1);
        }
    };
    info!("Rendezvous service ready at {}", server.url());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutting down ({} peers online)", server.online_count());
    server.stop();
}
