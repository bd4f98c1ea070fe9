//! Polman - yr.no weather forecasts over HTTP
//!
//! Fetches forecast XML from yr.no, caches the parsed result in memory and
//! serves it as HTML, JSON or JSONP.

use clap::Parser;

use polman::cli::{Cli, ServerConfig};
use polman::server::run_server;

/// Sets up `tracing` output, honouring `RUST_LOG` when present
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("polman=info,tower_http=info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = ServerConfig::from_cli(&cli)?;

    init_tracing();
    run_server(config).await?;

    Ok(())
}
