use crate::proxy::Proxy;
use crate::socks::{self, SocksError, TargetAddr};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

/// Default timeout covering one candidate's whole verification pipeline
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Default number of concurrent verifications
const DEFAULT_MAX_CONCURRENT: usize = 20;

/// Default geolocation endpoint (plain-HTTP CSV API)
const DEFAULT_GEO_ADDR: &str = "ip-api.com:80";

/// Countries whose networks cannot reach the probe endpoint; verifying their
/// proxies would always fail, so they are dropped up front.
const BLOCKED_COUNTRIES: [&str; 2] = ["china", "hong kong"];

const PROBE_HOST: &str = "www.google.com";
const PROBE_PORT: u16 = 80;
const PROBE_REQUEST: &[u8] =
    b"GET /generate_204 HTTP/1.1\r\nHost: www.google.com\r\nConnection: close\r\n\r\n";

/// Geo responses are small; cap the read in case the peer misbehaves.
const GEO_RESPONSE_LIMIT: usize = 1024;

#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error(transparent)]
    Socks(#[from] SocksError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("probe timed out")]
    Timeout,

    #[error("unexpected probe response")]
    BadResponse,
}

impl From<tokio::time::error::Elapsed> for ProbeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ProbeError::Timeout
    }
}

/// Configuration for the proxy checker
#[derive(Debug, Clone)]
pub struct CheckerConfig {
    /// Timeout for each candidate's verification pipeline
    pub timeout: Duration,
    /// Number of verifications in flight at once
    pub max_concurrent: usize,
    /// Geolocation service address
    pub geo_addr: String,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            geo_addr: DEFAULT_GEO_ADDR.to_string(),
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_geo_addr(mut self, geo_addr: String) -> Self {
        self.geo_addr = geo_addr;
        self
    }
}

/// Verifies candidate proxies: geo-tags each one, drops blocked regions, and
/// keeps only candidates that relay a real HTTP request end to end.
pub struct ProxyChecker {
    config: CheckerConfig,
}

impl ProxyChecker {
    pub fn new() -> Self {
        Self::with_config(CheckerConfig::default())
    }

    pub fn with_config(config: CheckerConfig) -> Self {
        Self { config }
    }

    /// Runs the verification pipeline over all candidates with bounded
    /// concurrency. Survivors keep their input order and carry the geo
    /// metadata discovered on the way.
    pub async fn check(&self, candidates: Vec<Proxy>) -> Vec<Proxy> {
        let total = candidates.len();
        let limit = self.config.max_concurrent.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));

        let alive: Vec<Proxy> = stream::iter(candidates)
            .map(|candidate| {
                let semaphore = Arc::clone(&semaphore);
                async move {
                    // Acquire only fails when the semaphore is closed, and it
                    // stays open for the lifetime of this call.
                    let _permit = semaphore.acquire().await.expect("semaphore closed");
                    self.check_one(candidate).await
                }
            })
            .buffered(limit)
            .filter_map(|verified| async move { verified })
            .collect()
            .await;

        info!(
            "{}/{} proxies alive (probe-verified, geo-filtered)",
            alive.len(),
            total
        );
        alive
    }

    /// One candidate through the pipeline: geo lookup, blocked-region
    /// filter, reachability probe. Any failure drops the candidate.
    async fn check_one(&self, mut candidate: Proxy) -> Option<Proxy> {
        let (country, city) = self.lookup_geo(&candidate.ip).await;
        candidate.country = country;
        candidate.city = city;

        if is_blocked(&candidate.country) {
            debug!("{} skipped ({})", candidate.addr(), candidate.country);
            return None;
        }

        match self.probe(&candidate).await {
            Ok(()) => {
                info!(
                    "{} OK ({} {})",
                    candidate.addr(),
                    candidate.country,
                    candidate.city
                );
                Some(candidate)
            }
            Err(e) => {
                debug!("{} rejected: {}", candidate.addr(), e);
                None
            }
        }
    }

    /// Best-effort geolocation; any failure yields `("Unknown", "")` and the
    /// candidate continues through the pipeline.
    async fn lookup_geo(&self, ip: &str) -> (String, String) {
        match self.fetch_geo(ip).await {
            Ok(raw) => parse_geo_response(&raw)
                .unwrap_or_else(|| ("Unknown".to_string(), String::new())),
            Err(_) => ("Unknown".to_string(), String::new()),
        }
    }

    /// Raw-TCP HTTP GET against the CSV geo endpoint, reading until the peer
    /// closes the connection.
    async fn fetch_geo(&self, ip: &str) -> Result<Vec<u8>, ProbeError> {
        let deadline = Instant::now() + self.config.timeout;
        let response = timeout_at(deadline, async {
            let mut conn = TcpStream::connect(&self.config.geo_addr).await?;
            let request = format!(
                "GET /csv/{ip}?fields=country,city HTTP/1.1\r\nHost: ip-api.com\r\nConnection: close\r\n\r\n"
            );
            conn.write_all(request.as_bytes()).await?;

            let mut response = Vec::with_capacity(256);
            let mut chunk = [0u8; 512];
            while response.len() < GEO_RESPONSE_LIMIT {
                let n = conn.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                let room = GEO_RESPONSE_LIMIT - response.len();
                response.extend_from_slice(&chunk[..n.min(room)]);
            }
            Ok::<_, ProbeError>(response)
        })
        .await??;
        Ok(response)
    }

    /// End-to-end reachability: SOCKS5 handshake through the candidate, a
    /// CONNECT to the probe host, then a real HTTP request. The deadline is
    /// absolute across the whole probe, dial included.
    async fn probe(&self, candidate: &Proxy) -> Result<(), ProbeError> {
        let deadline = Instant::now() + self.config.timeout;
        timeout_at(deadline, async {
            let mut conn = TcpStream::connect(candidate.addr()).await?;
            socks::client_handshake(&mut conn).await?;
            socks::send_connect(&mut conn, &TargetAddr::domain(PROBE_HOST, PROBE_PORT)).await?;

            conn.write_all(PROBE_REQUEST).await?;

            let mut response = [0u8; 512];
            let mut filled = 0;
            while filled < 12 {
                let n = conn.read(&mut response[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            // Any HTTP status line will do; 200 and 204 are both fine.
            if filled < 12 || &response[..4] != b"HTTP" {
                return Err(ProbeError::BadResponse);
            }
            Ok(())
        })
        .await?
    }
}

impl Default for ProxyChecker {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-insensitive, whitespace-tolerant blocked-region test.
fn is_blocked(country: &str) -> bool {
    let normalized = country.trim().to_ascii_lowercase();
    BLOCKED_COUNTRIES.contains(&normalized.as_str())
}

/// Splits an HTTP response into `(country, city)`: drop the header at the
/// first blank line, then split the CSV body at its first comma. `None` when
/// the body is empty.
fn parse_geo_response(raw: &[u8]) -> Option<(String, String)> {
    let text = String::from_utf8_lossy(raw);
    let body = match text.find("\r\n\r\n") {
        Some(at) => &text[at + 4..],
        None => text.as_ref(),
    };
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    match body.split_once(',') {
        Some((country, city)) => Some((country.trim().to_string(), city.trim().to_string())),
        None => Some((body.to_string(), String::new())),
    }
}
