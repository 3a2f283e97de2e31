use std::fmt;
use std::net::Ipv4Addr;

/// Error type for proxy construction
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("invalid IPv4 address: {0}")]
    InvalidIp(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// A single upstream SOCKS5 proxy.
///
/// `country` and `city` are display metadata discovered during verification;
/// forwarding decisions never depend on them. Two proxies are equal when
/// their `(ip, port)` endpoints match.
#[derive(Debug, Clone)]
pub struct Proxy {
    pub ip: String,
    pub port: u16,
    pub country: String,
    pub city: String,
}

impl Proxy {
    /// Build a proxy from scraped text. The host must be a dotted-quad IPv4
    /// address and the port must parse into 1..=65535.
    pub fn new(ip: &str, port: &str) -> Result<Self, ProxyError> {
        let ip = ip.trim();
        if ip.parse::<Ipv4Addr>().is_err() {
            return Err(ProxyError::InvalidIp(ip.to_string()));
        }
        let port_num: u16 = port
            .trim()
            .parse()
            .map_err(|_| ProxyError::InvalidPort(port.to_string()))?;
        if port_num == 0 {
            return Err(ProxyError::InvalidPort(port.to_string()));
        }
        Ok(Self {
            ip: ip.to_string(),
            port: port_num,
            country: String::new(),
            city: String::new(),
        })
    }

    /// Dial form, `ip:port`.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

impl PartialEq for Proxy {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for Proxy {}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socks5://{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_proxy() {
        let proxy = Proxy::new("1.2.3.4", "1080").unwrap();
        assert_eq!(proxy.ip, "1.2.3.4");
        assert_eq!(proxy.port, 1080);
        assert_eq!(proxy.addr(), "1.2.3.4:1080");
        assert_eq!(proxy.to_string(), "socks5://1.2.3.4:1080");
    }

    #[test]
    fn trims_whitespace() {
        let proxy = Proxy::new(" 1.2.3.4 ", " 80 ").unwrap();
        assert_eq!(proxy.addr(), "1.2.3.4:80");
    }

    #[test]
    fn rejects_bad_ip() {
        assert!(matches!(
            Proxy::new("999.1.1.1", "1080"),
            Err(ProxyError::InvalidIp(_))
        ));
        assert!(matches!(
            Proxy::new("example.com", "1080"),
            Err(ProxyError::InvalidIp(_))
        ));
        assert!(matches!(
            Proxy::new("::1", "1080"),
            Err(ProxyError::InvalidIp(_))
        ));
    }

    #[test]
    fn rejects_bad_port() {
        assert!(matches!(
            Proxy::new("1.2.3.4", "0"),
            Err(ProxyError::InvalidPort(_))
        ));
        assert!(matches!(
            Proxy::new("1.2.3.4", "65536"),
            Err(ProxyError::InvalidPort(_))
        ));
        assert!(matches!(
            Proxy::new("1.2.3.4", "http"),
            Err(ProxyError::InvalidPort(_))
        ));
    }

    #[test]
    fn equality_ignores_geo_metadata() {
        let mut a = Proxy::new("1.2.3.4", "1080").unwrap();
        let b = Proxy::new("1.2.3.4", "1080").unwrap();
        a.country = "Germany".to_string();
        a.city = "Berlin".to_string();
        assert_eq!(a, b);

        let c = Proxy::new("1.2.3.4", "1081").unwrap();
        assert_ne!(a, c);
    }
}
