use crate::connection::ConnectionGuard;
use crate::pool::ProxyPool;
use crate::proxy::Proxy;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

pub const SOCKS5_VERSION: u8 = 0x05;

const CMD_CONNECT: u8 = 0x01;
const METHOD_NO_AUTH: u8 = 0x00;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Dial + handshake budget for one upstream attempt. The relay phase that
/// follows a successful handshake is unbounded.
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream attempts per client request: the active proxy plus two failovers.
const MAX_UPSTREAM_ATTEMPTS: usize = 3;

/// Error type for SOCKS5 operations
#[derive(Debug, thiserror::Error)]
pub enum SocksError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("not a SOCKS5 peer (version {0:#04x})")]
    BadVersion(u8),

    #[error("no acceptable auth method (selected {0:#04x})")]
    BadMethod(u8),

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    BadAddressType(u8),

    #[error("upstream connect failed, status {0:#04x}")]
    ConnectFailed(u8),

    #[error("domain name too long")]
    DomainTooLong,

    #[error("handshake timed out")]
    Timeout,
}

impl From<tokio::time::error::Elapsed> for SocksError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SocksError::Timeout
    }
}

/// Result type for SOCKS5 operations
pub type SocksResult<T> = Result<T, SocksError>;

/// Destination requested by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub host: TargetHost,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHost {
    Ip(IpAddr),
    Domain(String),
}

impl TargetAddr {
    pub fn domain(name: &str, port: u16) -> Self {
        Self {
            host: TargetHost::Domain(name.to_string()),
            port,
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            TargetHost::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            TargetHost::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            TargetHost::Domain(name) => write!(f, "{}:{}", name, self.port),
        }
    }
}

/// Inbound SOCKS5 server. Every accepted connection is forwarded through the
/// pool's active upstream, failing over within the request when an upstream
/// cannot be reached.
pub struct Server {
    listen_addr: SocketAddr,
    pool: Arc<ProxyPool>,
}

impl Server {
    pub fn new(listen_addr: SocketAddr, pool: Arc<ProxyPool>) -> Self {
        Self { listen_addr, pool }
    }

    /// Binds the listen address and serves until the process exits. Only the
    /// bind itself is fatal.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        info!("SOCKS5 proxy listening on {}", self.listen_addr);
        self.serve(listener).await
    }

    async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let pool = Arc::clone(&self.pool);
                    tokio::spawn(async move {
                        if let Err(e) = handle_conn(stream, pool).await {
                            debug!("connection from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("accept error: {} (continuing)", e);
                    continue;
                }
            }
        }
    }
}

/// Drives one client connection: negotiation, request parse, upstream
/// selection with failover, then the relay.
async fn handle_conn(mut client: TcpStream, pool: Arc<ProxyPool>) -> SocksResult<()> {
    // Method negotiation. The offered methods are consumed but not
    // inspected; the server always selects "no authentication". Malformed
    // greetings close the connection without a reply.
    let mut greeting = [0u8; 2];
    client.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS5_VERSION {
        return Err(SocksError::BadVersion(greeting[0]));
    }
    let mut methods = vec![0u8; greeting[1] as usize];
    client.read_exact(&mut methods).await?;
    client
        .write_all(&[SOCKS5_VERSION, METHOD_NO_AUTH])
        .await?;

    // Request header: VER CMD RSV ATYP.
    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    if request[1] != CMD_CONNECT {
        send_reply(&mut client, REP_COMMAND_NOT_SUPPORTED).await?;
        return Err(SocksError::UnsupportedCommand(request[1]));
    }

    let target = match read_target(&mut client, request[3]).await {
        Ok(target) => target,
        Err(e) => {
            send_reply(&mut client, REP_HOST_UNREACHABLE).await?;
            return Err(e);
        }
    };
    debug!("request for {}", target);

    // Try the active upstream first, then switch for the remaining attempts.
    for attempt in 0..MAX_UPSTREAM_ATTEMPTS {
        let picked = if attempt == 0 {
            pool.current()
        } else {
            pool.switch_next()
        };
        let Some(upstream) = picked else {
            warn!("no upstream proxies available");
            send_reply(&mut client, REP_GENERAL_FAILURE).await?;
            return Ok(());
        };

        match connect_upstream(&upstream, &target, UPSTREAM_TIMEOUT).await {
            Ok(mut remote) => {
                send_reply(&mut client, REP_SUCCESS).await?;
                relay(&mut client, &mut remote).await;
                return Ok(());
            }
            Err(e) => {
                warn!("upstream {} failed: {}, switching...", upstream.addr(), e);
            }
        }
    }

    send_reply(&mut client, REP_GENERAL_FAILURE).await?;
    Ok(())
}

/// Reads the ATYP-specific address bytes and the port that follow a request
/// header. The request may arrive in any number of segments.
async fn read_target<S>(stream: &mut S, atyp: u8) -> SocksResult<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            TargetHost::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            TargetHost::Domain(String::from_utf8_lossy(&name).into_owned())
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            TargetHost::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        other => return Err(SocksError::BadAddressType(other)),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(TargetAddr {
        host,
        port: u16::from_be_bytes(port),
    })
}

/// Minimal SOCKS5 reply. The bound address is always `0.0.0.0:0`; clients
/// only act on the status byte.
async fn send_reply<S>(stream: &mut S, status: u8) -> SocksResult<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        SOCKS5_VERSION,
        status,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    Ok(())
}

/// Opens a connection to `target` through `upstream`, acting as a SOCKS5
/// client. The deadline covers the dial and the whole handshake; the
/// returned stream carries no deadline into the relay phase.
pub async fn connect_upstream(
    upstream: &Proxy,
    target: &TargetAddr,
    timeout: Duration,
) -> SocksResult<TcpStream> {
    let deadline = Instant::now() + timeout;
    let conn = timeout_at(deadline, async {
        let mut conn = TcpStream::connect(upstream.addr()).await?;
        client_handshake(&mut conn).await?;
        send_connect(&mut conn, target).await?;
        Ok::<_, SocksError>(conn)
    })
    .await??;
    Ok(conn)
}

/// Greets a SOCKS5 server offering only "no authentication" and validates
/// the selected method.
pub(crate) async fn client_handshake<S>(stream: &mut S) -> SocksResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(&[SOCKS5_VERSION, 1, METHOD_NO_AUTH])
        .await?;
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;
    if choice[0] != SOCKS5_VERSION {
        return Err(SocksError::BadVersion(choice[0]));
    }
    if choice[1] != METHOD_NO_AUTH {
        return Err(SocksError::BadMethod(choice[1]));
    }
    Ok(())
}

/// Sends a CONNECT request for `target` and waits for a success reply.
/// Domain hosts that happen to be IP literals are sent with the matching
/// address type.
pub(crate) async fn send_connect<S>(stream: &mut S, target: &TargetAddr) -> SocksResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0x00];

    let effective = match &target.host {
        TargetHost::Ip(ip) => TargetHost::Ip(*ip),
        TargetHost::Domain(name) => match name.parse::<IpAddr>() {
            Ok(ip) => TargetHost::Ip(ip),
            Err(_) => TargetHost::Domain(name.clone()),
        },
    };

    match &effective {
        TargetHost::Ip(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        TargetHost::Ip(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        TargetHost::Domain(name) => {
            let len = u8::try_from(name.len()).map_err(|_| SocksError::DomainTooLong)?;
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(name.as_bytes());
        }
    }
    request.extend_from_slice(&target.port.to_be_bytes());

    stream.write_all(&request).await?;
    read_connect_reply(stream).await
}

/// Parses a full SOCKS5 reply rather than assuming it arrives in one
/// segment, and drains the bound address so the stream starts at the
/// payload.
async fn read_connect_reply<S>(stream: &mut S) -> SocksResult<()>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(SocksError::BadVersion(header[0]));
    }
    if header[1] != REP_SUCCESS {
        return Err(SocksError::ConnectFailed(header[1]));
    }

    let addr_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => return Err(SocksError::BadAddressType(other)),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

/// Relays bytes both ways until the connection winds down. An EOF in one
/// direction is forwarded to the peer as a write-side shutdown (TCP
/// half-close); the relay completes once the reverse direction finishes
/// too. Neither direction carries a deadline.
async fn relay(client: &mut TcpStream, remote: &mut TcpStream) {
    let _guard = ConnectionGuard::new();
    match tokio::io::copy_bidirectional(client, remote).await {
        Ok((up, down)) => debug!(
            "relay done: {}\u{2191} {}\u{2193} bytes, {} active",
            up,
            down,
            ConnectionGuard::active_count()
        ),
        Err(e) => debug!("relay ended: {}", e),
    }
}
