//! Enclave-side demo: one plain request/response round trip through the
//! host relay.
//!
//! Usage: `cargo run --example exchange -- example.org 80`
//!
//! `TUNNEL_CONNECT` selects the inter-VM endpoint (default
//! `unix:/tmp/enclave-tunnel.sock`). Real deployments run TLS over a
//! `TunnelStream` instead of sending plaintext.

use enclave_tunnel::transport::{self, Endpoint};
use enclave_tunnel::{exchange, Channel, Role, Supervisor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "example.org".to_string());
    let port: u16 = args.next().map(|p| p.parse::<u16>()).transpose()?.unwrap_or(80);

    let endpoint: Endpoint = std::env::var("TUNNEL_CONNECT")
        .unwrap_or_else(|_| "unix:/tmp/enclave-tunnel.sock".to_string())
        .parse()?;
    let (reader, writer) = transport::connect(&endpoint).await?.into_split();
    let supervisor = Supervisor::new(Channel::builder(Role::Enclave).start(reader, writer)?);
    tracing::info!("Connected to host relay at {}", endpoint);

    let request = format!(
        "GET / HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
        host
    );
    let response = exchange(&supervisor, &host, port, request.as_bytes()).await?;

    let head = String::from_utf8_lossy(&response[..response.len().min(256)]);
    tracing::info!("{} bytes from {}:{}", response.len(), host, port);
    println!("{}", head);

    println!("{}", serde_json::to_string_pretty(&supervisor.stats())?);
    Ok(())
}
