//! Relay server entry point

use clap::Parser;
use pairbox_server::Config;
use std::net::SocketAddr;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// One-to-one WebRTC signaling relay.
#[derive(Parser, Debug)]
#[command(name = "pairbox-server", about = "One-to-one WebRTC signaling relay")]
struct Cli {
    /// Host to bind.
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind.
    #[arg(long, default_value = "3536")]
    port: u16,

    /// Outbound queue length per connection.
    #[arg(long, default_value_t = pairbox_server::config::DEFAULT_OUTBOUND_CAPACITY)]
    outbound_capacity: usize,

    /// Milliseconds a reply or negotiation payload may wait on a full queue.
    #[arg(long, default_value = "500")]
    push_timeout_ms: u64,

    /// Candidates tried per pair request.
    #[arg(long, default_value_t = pairbox_server::config::DEFAULT_PAIR_ATTEMPTS)]
    pair_attempts: usize,

    /// Milliseconds a new connection may spend on the WebSocket upgrade.
    #[arg(long, default_value = "10000")]
    handshake_timeout_ms: u64,
}

impl Cli {
    fn into_config(self) -> Result<Config, std::net::AddrParseError> {
        let bind_address: SocketAddr = format!("{}:{}", self.host, self.port).parse()?;
        Ok(Config {
            bind_address,
            outbound_capacity: self.outbound_capacity,
            push_timeout: Duration::from_millis(self.push_timeout_ms),
            pair_attempts: self.pair_attempts,
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pairbox_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Cli::parse().into_config()?;
    tracing::info!(?config, "starting pairbox server");
    pairbox_server::run(config).await?;
    Ok(())
}
