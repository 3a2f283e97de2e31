use crate::proxy::Proxy;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use tracing::info;

/// Matches `socks5://ip:port` endpoints in arbitrary page content.
static PROXY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"socks5://(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d+)")
        .expect("proxy list regex")
});

/// Timeout for fetching the proxy list page.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Error type for scrape operations
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("unexpected status: {0}")]
    Status(reqwest::StatusCode),
}

/// Fetches `url` and extracts every unique `socks5://ip:port` endpoint,
/// preserving first-occurrence order.
pub async fn scrape(url: &str) -> Result<Vec<Proxy>, ScrapeError> {
    let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(ScrapeError::Status(response.status()));
    }
    let body = response.text().await?;

    let proxies = extract(&body);
    info!("fetched {} proxies from {}", proxies.len(), url);
    Ok(proxies)
}

/// Pulls candidate proxies out of raw page content. Endpoints that fail
/// address validation are skipped; duplicates keep their first occurrence.
pub fn extract(body: &str) -> Vec<Proxy> {
    let mut seen = HashSet::new();
    let mut proxies = Vec::new();

    for captures in PROXY_REGEX.captures_iter(body) {
        let Ok(proxy) = Proxy::new(&captures[1], &captures[2]) else {
            continue;
        };
        if seen.insert(proxy.addr()) {
            proxies.push(proxy);
        }
    }
    proxies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_socks5_endpoints() {
        let body = r#"
            <li>socks5://1.2.3.4:1080</li>
            plain text socks5://5.6.7.8:9999 inline
            http://9.9.9.9:8080 is not a socks5 endpoint
        "#;
        let proxies = extract(body);
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].addr(), "1.2.3.4:1080");
        assert_eq!(proxies[1].addr(), "5.6.7.8:9999");
    }

    #[test]
    fn deduplicates_keeping_first_occurrence() {
        let body = "socks5://1.1.1.1:1080 socks5://2.2.2.2:1080 socks5://1.1.1.1:1080";
        let proxies = extract(body);
        assert_eq!(proxies.len(), 2);
        assert_eq!(proxies[0].addr(), "1.1.1.1:1080");
        assert_eq!(proxies[1].addr(), "2.2.2.2:1080");
    }

    #[test]
    fn same_ip_different_port_is_distinct() {
        let body = "socks5://1.1.1.1:1080 socks5://1.1.1.1:1081";
        assert_eq!(extract(body).len(), 2);
    }

    #[test]
    fn drops_invalid_addresses() {
        let body = "socks5://999.1.1.1:1080 socks5://1.2.3.4:99999 socks5://1.2.3.4:0";
        assert!(extract(body).is_empty());
    }

    #[test]
    fn empty_body_yields_nothing() {
        assert!(extract("").is_empty());
    }
}
