//! Realtime relay for local development.
//!
//! Serves the notification and geo channels the Wayfarer clients speak:
//! - `/notifications`: bearer token required; the token is the user id
//! - `/geo`: anonymous allowed; positions are relayed to every other peer
//!
//! Run:
//!   cargo run -p wayfarer-demo-relay --bin wayfarer-relay -- --port 8080
//!
//! Then type `notify <user> <text>` or `read-all <user>` on stdin.

mod server;

use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "wayfarer-relay", about = "Realtime relay for the Wayfarer channels")]
struct Args {
    /// Address to bind
    #[arg(long, env = "WAYFARER_RELAY_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "WAYFARER_RELAY_PORT", default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("wayfarer_relay=info".parse()?))
        .init();

    let args = Args::parse();
    let addr = SocketAddr::new(args.host, args.port);

    tracing::info!("Starting relay on {}", addr);
    server::run(addr).await
}
