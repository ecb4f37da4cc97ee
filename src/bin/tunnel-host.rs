//! Host side of the tunnel: accepts the enclave's inter-VM connection and
//! relays every session it opens to the real network.
//!
//! Environment:
//! - `TUNNEL_LISTEN` - endpoint to listen on (default `unix:/tmp/enclave-tunnel.sock`,
//!   `vsock:any:5000` in production)
//! - `TUNNEL_CONFIG` - optional JSON file with [`TunnelConfig`] fields
//! - `RUST_LOG` - log filter

use std::sync::Arc;

use enclave_tunnel::transport::{Endpoint, VmListener};
use enclave_tunnel::{Channel, HostRelay, Role, Supervisor, TunnelConfig, TunnelMetrics};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting tunnel host relay");

    let endpoint: Endpoint = std::env::var("TUNNEL_LISTEN")
        .unwrap_or_else(|_| "unix:/tmp/enclave-tunnel.sock".to_string())
        .parse()?;

    let config = match std::env::var("TUNNEL_CONFIG") {
        Ok(path) => {
            tracing::info!("Loading config from {}", path);
            TunnelConfig::from_file(&path)?
        }
        Err(_) => TunnelConfig::default(),
    };
    config.validate()?;

    let listener = VmListener::bind(&endpoint).await?;
    tracing::info!("Listening for the enclave on {}", endpoint);

    let relay = HostRelay::new(&config);
    let metrics = Arc::new(TunnelMetrics::new());

    // One enclave, one channel at a time. A failed channel is never
    // reconnected; the enclave dials again.
    loop {
        let (reader, writer) = listener.accept().await?.into_split();
        tracing::info!("Enclave connected");

        let channel = Channel::builder(Role::Host)
            .config(config.clone())
            .metrics(metrics.clone())
            .start(reader, writer)?;
        let supervisor = Supervisor::new(channel);

        relay.run(&supervisor).await;

        match supervisor.stats().to_json() {
            Ok(stats) => tracing::info!("Channel ended: {}", stats),
            Err(e) => tracing::warn!("Channel ended, stats unavailable: {}", e),
        }
    }
}
