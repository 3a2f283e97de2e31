//! socks5-pool - self-maintaining SOCKS5 forwarding proxy
//!
//! Exposes a local SOCKS5 endpoint and forwards every client connection
//! through one upstream proxy drawn from a dynamically maintained pool. The
//! pool is replenished by scraping a public proxy list, geo-filtering the
//! candidates, and verifying each with a real SOCKS5 handshake plus an HTTP
//! reachability probe. The active upstream rotates on a randomized interval
//! and on failure.

pub mod checker;
pub mod config;
pub mod connection;
pub mod pool;
pub mod proxy;
pub mod refresh;
pub mod scraper;
pub mod socks;
pub mod status;

pub use checker::{CheckerConfig, ProxyChecker};
pub use config::{Cli, PoolConfig};
pub use pool::ProxyPool;
pub use proxy::Proxy;
pub use socks::Server;
pub use status::StatusServer;
