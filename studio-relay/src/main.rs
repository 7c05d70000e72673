//! Standalone room relay for studio-sync sessions.
//!
//! Usage: `studio-relay [BIND_ADDR]`. The address falls back to
//! `STUDIO_RELAY_ADDR`, then to `127.0.0.1:9090`. Log filtering follows
//! `RUST_LOG` (default `info`).

use log::info;
use studio_sync::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var("STUDIO_RELAY_ADDR").ok())
    {
        Some(addr) => RelayConfig::with_addr(addr),
        None => RelayConfig::default(),
    };

    info!("Starting studio relay on {}...", config.bind_addr);
    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
