//! Room-based WebSocket Chat Hub - Entry Point
//!
//! Loads configuration, starts the Hub actor and accepts connections.

use std::env;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use movie_chat::{handle_connection, Config, HubHandle};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=movie_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("movie_chat=info")),
        )
        .init();

    let mut config = Config::from_env()?;

    // Bind address from command line overrides the environment
    if let Some(addr) = env::args().nth(1) {
        config.addr = addr;
    }

    // Start TCP listener
    let listener = TcpListener::bind(&config.addr).await?;
    info!("WebSocket Chat Hub listening on {}", config.addr);

    // Create Hub actor and start
    let (hub, handle) = HubHandle::channel(config.hub_channel_size, config.hub.clone());
    tokio::spawn(hub.run());

    info!(
        "Hub actor started (queue size {}, echo to sender: {})",
        config.adapter.outbound_queue_size, config.hub.echo_to_sender
    );

    // Connection accept loop
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("New connection from {}", addr);
                let handle = handle.clone();
                let adapter = config.adapter;

                // Spawn handler task for each connection
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, handle, adapter).await {
                        error!("Connection handler error: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
