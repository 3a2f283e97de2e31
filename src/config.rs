use clap::Parser;
use color_eyre::eyre::eyre;
use std::net::SocketAddr;
use std::time::Duration;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Self-maintaining SOCKS5 forwarding proxy",
    long_about = "socks5-pool exposes a local SOCKS5 endpoint and forwards every client\nconnection through one upstream proxy drawn from a scraped, health-checked pool.\n\nThe pool is refreshed periodically and on demand via the status dashboard,\nand the active upstream rotates on a randomized interval and on failure."
)]
pub struct Cli {
    /// Local SOCKS5 listen address
    #[arg(long, default_value = "127.0.0.1:1080", value_name = "HOST:PORT")]
    pub listen: String,

    /// HTTP status dashboard address
    #[arg(long, default_value = "127.0.0.1:8080", value_name = "HOST:PORT")]
    pub status: String,

    /// Proxy list URL to scrape
    #[arg(long, default_value = "https://socks5-proxy.github.io/")]
    pub url: String,

    /// Scrape interval in seconds
    #[arg(long = "scrape-interval", default_value_t = 1800)]
    pub scrape_interval: u64,

    /// Proxy check timeout in seconds
    #[arg(long = "check-timeout", default_value_t = 10)]
    pub check_timeout: u64,

    /// Max concurrent health checks
    #[arg(long = "max-concurrent", default_value_t = 20)]
    pub max_concurrent: usize,
}

/// Runtime configuration resolved from CLI arguments and the environment
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub listen_addr: SocketAddr,
    pub status_addr: SocketAddr,
    pub scrape_url: String,
    pub scrape_interval: Duration,
    pub check_timeout: Duration,
    pub max_concurrent: usize,
}

impl PoolConfig {
    /// Create PoolConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        let (listen, status) =
            apply_cloud_override(args.listen, args.status, std::env::var("PORT").ok().as_deref());

        let listen_addr = listen
            .parse()
            .map_err(|e| eyre!("invalid --listen address {}: {}", listen, e))?;
        let status_addr = status
            .parse()
            .map_err(|e| eyre!("invalid --status address {}: {}", status, e))?;

        Ok(Self {
            listen_addr,
            status_addr,
            scrape_url: args.url,
            scrape_interval: Duration::from_secs(args.scrape_interval),
            check_timeout: Duration::from_secs(args.check_timeout),
            max_concurrent: args.max_concurrent,
        })
    }
}

/// Cloud platforms inject `PORT`; such deployments always expose SOCKS5 on
/// 1080 and the dashboard on 8080, bound to all interfaces.
fn apply_cloud_override(
    listen: String,
    status: String,
    port_env: Option<&str>,
) -> (String, String) {
    match port_env {
        Some(value) if !value.is_empty() => {
            ("0.0.0.0:1080".to_string(), "0.0.0.0:8080".to_string())
        }
        _ => (listen, status),
    }
}
