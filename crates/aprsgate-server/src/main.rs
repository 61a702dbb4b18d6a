//! # aprsgate
//!
//! APRS-IS messaging gateway: keeps one upstream connection and serves
//! stations' clients over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! aprsgate
//!
//! # Run with a config file
//! APRSGATE_CONFIG=/etc/aprsgate/aprsgate.toml aprsgate
//!
//! # Override the listen address
//! APRSGATE_PORT=8080 APRSGATE_HOST=0.0.0.0 aprsgate
//! ```

mod auth;
mod config;
mod directory;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aprsgate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;
    config.validate()?;

    tracing::info!(
        callsign = %config.link.callsign,
        server = %config.link.server,
        "Starting aprsgate on {}:{}",
        config.host,
        config.port
    );

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
