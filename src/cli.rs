//! Command-line interface parsing for the forecast server
//!
//! This module handles parsing of CLI arguments using clap. Every option can
//! also be supplied through an environment variable, and the parsed values are
//! validated into a `ServerConfig` before the server starts.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use clap::Parser;
use reqwest::Url;
use thiserror::Error;

use crate::cache::DEFAULT_TTL;
use crate::data::{DEFAULT_TIMEOUT, DEFAULT_UPSTREAM_BASE};
use crate::sweep::SweepConfig;

/// Error types for CLI argument validation
#[derive(Debug, Error)]
pub enum CliError {
    /// The bind address is not an IP address
    #[error("Invalid bind address: '{0}'. Expected an IP address such as 0.0.0.0 or ::1")]
    InvalidBind(String),

    /// The upstream base is not an http(s) URL
    #[error("Invalid upstream URL: '{0}'. Expected something like https://www.yr.no")]
    InvalidUpstream(String),

    /// A duration option that must be positive was zero
    #[error("Invalid value for --{0}: must be greater than zero")]
    ZeroDuration(&'static str),
}

/// Polman - serve yr.no weather forecasts as HTML, JSON or JSONP
#[derive(Parser, Debug)]
#[command(name = "polman")]
#[command(about = "Serve yr.no weather forecasts as HTML, JSON or JSONP")]
#[command(version)]
pub struct Cli {
    /// Port to listen on
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// IP address to bind
    #[arg(long, env = "POLMAN_BIND", default_value = "0.0.0.0")]
    pub bind: String,

    /// Base URL of the yr.no service
    #[arg(long, env = "POLMAN_UPSTREAM", default_value = DEFAULT_UPSTREAM_BASE)]
    pub upstream: String,

    /// Seconds a fetched forecast is served from memory
    #[arg(long, env = "POLMAN_TTL_SECS", default_value_t = DEFAULT_TTL.as_secs())]
    pub ttl_secs: u64,

    /// Seconds before an upstream request is abandoned
    #[arg(long, env = "POLMAN_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT.as_secs())]
    pub timeout_secs: u64,

    /// Seconds between sweeps of expired cache entries (0 disables the sweep)
    #[arg(long, env = "POLMAN_SWEEP_SECS", default_value_t = 300)]
    pub sweep_secs: u64,

    /// Include the textual forecast block in responses
    #[arg(long, env = "POLMAN_KEEP_TEXT")]
    pub keep_text: bool,
}

/// Validated server configuration derived from CLI arguments
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server listens on
    pub addr: SocketAddr,
    /// Upstream base URL, without trailing slash
    pub upstream: String,
    /// Cache lifetime of a fetched forecast
    pub ttl: Duration,
    /// Upstream request timeout
    pub timeout: Duration,
    /// Expiry sweep settings
    pub sweep: SweepConfig,
    /// Whether to serve the textual forecast block
    pub keep_text: bool,
}

impl ServerConfig {
    /// Creates a ServerConfig from parsed CLI arguments.
    ///
    /// # Returns
    /// * `Ok(ServerConfig)` with validated settings
    /// * `Err(CliError)` if an option is out of range or malformed
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let ip: IpAddr = cli
            .bind
            .parse()
            .map_err(|_| CliError::InvalidBind(cli.bind.clone()))?;

        let upstream = parse_upstream(&cli.upstream)?;

        if cli.ttl_secs == 0 {
            return Err(CliError::ZeroDuration("ttl-secs"));
        }
        if cli.timeout_secs == 0 {
            return Err(CliError::ZeroDuration("timeout-secs"));
        }

        Ok(ServerConfig {
            addr: SocketAddr::new(ip, cli.port),
            upstream,
            ttl: Duration::from_secs(cli.ttl_secs),
            timeout: Duration::from_secs(cli.timeout_secs),
            sweep: SweepConfig {
                interval: Duration::from_secs(cli.sweep_secs),
                enabled: cli.sweep_secs > 0,
            },
            keep_text: cli.keep_text,
        })
    }
}

/// Checks that `raw` is an absolute http(s) URL and trims trailing slashes
pub fn parse_upstream(raw: &str) -> Result<String, CliError> {
    let url = Url::parse(raw).map_err(|_| CliError::InvalidUpstream(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(CliError::InvalidUpstream(raw.to_string()));
    }
    Ok(raw.trim_end_matches('/').to_string())
}
