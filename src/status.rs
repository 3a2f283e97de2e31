use crate::pool::ProxyPool;
use crate::refresh::{RefreshHandle, ScrapeTiming};
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Dashboard timestamps are rendered in UTC+8, the deployment's local time.
const DASHBOARD_UTC_OFFSET_SECS: i32 = 8 * 3600;

/// Snapshot served on `/api/status` and rendered on the dashboard.
#[derive(Debug, Serialize)]
pub struct StatusData {
    total: usize,
    active_proxy: String,
    active_region: String,
    last_scrape: String,
    next_scrape: String,
    proxies: Vec<ProxyStatus>,
}

#[derive(Debug, Serialize)]
struct ProxyStatus {
    addr: String,
    country: String,
    city: String,
    active: bool,
}

/// HTTP control surface: pool/timing snapshots, manual refresh, and manual
/// upstream switching.
pub struct StatusServer {
    pool: Arc<ProxyPool>,
    timing: Arc<ScrapeTiming>,
    refresh: RefreshHandle,
}

impl StatusServer {
    pub fn new(pool: Arc<ProxyPool>, timing: Arc<ScrapeTiming>, refresh: RefreshHandle) -> Self {
        Self {
            pool,
            timing,
            refresh,
        }
    }

    /// Binds the status address and serves until the process exits.
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("dashboard at http://{}", addr);
        self.serve(listener).await
    }

    async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("status accept error: {} (continuing)", e);
                    continue;
                }
            };
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |request| {
                    let server = Arc::clone(&server);
                    async move { server.route(request).await }
                });
                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    debug!("status connection error: {}", e);
                }
            });
        }
    }

    async fn route(&self, request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let response = match (request.method(), request.uri().path()) {
            (&Method::GET, "/api/status") => json(StatusCode::OK, &self.status_data()),
            (&Method::GET, "/api/refresh") => {
                self.refresh.trigger();
                raw_json(StatusCode::OK, r#"{"status":"refresh triggered"}"#)
            }
            (&Method::GET, "/api/switch") => self.handle_switch(request.uri().query()),
            (&Method::GET, "/") => html(render_dashboard(&self.status_data())),
            _ => raw_json(StatusCode::NOT_FOUND, r#"{"status":"not found"}"#),
        };
        Ok(response)
    }

    fn handle_switch(&self, query: Option<&str>) -> Response<Full<Bytes>> {
        match parse_index(query) {
            IndexParam::Given(index) => match self.pool.switch_to(index) {
                Some(_) => raw_json(StatusCode::OK, r#"{"status":"ok"}"#),
                None => raw_json(StatusCode::BAD_REQUEST, r#"{"status":"index out of range"}"#),
            },
            IndexParam::Invalid => {
                raw_json(StatusCode::BAD_REQUEST, r#"{"status":"invalid index"}"#)
            }
            IndexParam::Absent => match self.pool.switch_next() {
                Some(_) => raw_json(StatusCode::OK, r#"{"status":"ok"}"#),
                None => raw_json(
                    StatusCode::SERVICE_UNAVAILABLE,
                    r#"{"status":"no proxies available"}"#,
                ),
            },
        }
    }

    fn status_data(&self) -> StatusData {
        let (proxies, active_index) = self.pool.snapshot();
        let (last, next) = self.timing.snapshot();

        let list = proxies
            .iter()
            .enumerate()
            .map(|(i, proxy)| ProxyStatus {
                addr: proxy.addr(),
                country: proxy.country.clone(),
                city: proxy.city.clone(),
                active: i == active_index,
            })
            .collect();

        let (active_proxy, active_region) = match proxies.get(active_index) {
            Some(proxy) => {
                let mut region = proxy.country.clone();
                if !proxy.city.is_empty() {
                    region.push_str(", ");
                    region.push_str(&proxy.city);
                }
                (proxy.addr(), region)
            }
            None => ("None".to_string(), "-".to_string()),
        };

        StatusData {
            total: proxies.len(),
            active_proxy,
            active_region,
            last_scrape: format_time(last),
            next_scrape: format_time(next),
            proxies: list,
        }
    }
}

enum IndexParam {
    Given(usize),
    Invalid,
    Absent,
}

/// Pulls `index=N` out of a query string. A missing or empty value means
/// "advance to the next proxy".
fn parse_index(query: Option<&str>) -> IndexParam {
    let Some(query) = query else {
        return IndexParam::Absent;
    };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("index=") {
            if value.is_empty() {
                return IndexParam::Absent;
            }
            return match value.parse::<usize>() {
                Ok(index) => IndexParam::Given(index),
                Err(_) => IndexParam::Invalid,
            };
        }
    }
    IndexParam::Absent
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    let Some(time) = time else {
        return String::new();
    };
    match FixedOffset::east_opt(DASHBOARD_UTC_OFFSET_SECS) {
        Some(zone) => time
            .with_timezone(&zone)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => String::new(),
    }
}

fn json<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, "application/json", body.into()),
        Err(e) => {
            warn!("status serialization failed: {}", e);
            raw_json(
                StatusCode::INTERNAL_SERVER_ERROR,
                r#"{"status":"serialization error"}"#,
            )
        }
    }
}

fn raw_json(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    response(status, "application/json", Bytes::from_static(body.as_bytes()))
}

fn html(body: String) -> Response<Full<Bytes>> {
    response(StatusCode::OK, "text/html; charset=utf-8", body.into())
}

fn response(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static(content_type),
    );
    response
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Human dashboard. Auto-refreshes, shows the active upstream and scrape
/// times, and lets the operator switch proxies or trigger a refresh.
fn render_dashboard(data: &StatusData) -> String {
    let mut page = String::with_capacity(4096);
    page.push_str(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>SOCKS5 Pool Status</title>
<meta name="viewport" content="width=device-width,initial-scale=1">
<meta http-equiv="refresh" content="30">
<style>
*{margin:0;padding:0;box-sizing:border-box}
body{font-family:system-ui,-apple-system,sans-serif;background:#0f172a;color:#e2e8f0;padding:12px}
.container{max-width:800px;margin:0 auto}
h1{font-size:1.3rem;color:#38bdf8}
.current{background:#1e293b;border-radius:8px;padding:12px 16px;margin:12px 0}
.current .addr{color:#4ade80;font-family:monospace;font-weight:bold}
.current .region{color:#94a3b8;font-size:0.8rem}
.badge{background:#065f46;color:#4ade80;padding:2px 8px;border-radius:4px;font-size:0.75rem;font-weight:bold}
.times{background:#1e293b;border-radius:8px;padding:12px 16px;margin:8px 0;display:flex;justify-content:space-between;align-items:center;flex-wrap:wrap;gap:8px}
.times div{font-size:0.8rem;color:#94a3b8}
.times span{color:#e2e8f0;font-family:monospace}
.btn{background:#38bdf8;color:#0f172a;border:none;padding:6px 14px;border-radius:6px;cursor:pointer;font-weight:bold;font-size:0.8rem}
.proxy{background:#1e293b;border-radius:8px;padding:12px 16px;margin:6px 0;cursor:pointer;display:flex;justify-content:space-between;align-items:center;border:2px solid transparent}
.proxy:hover{background:#334155}
.proxy.active{border-color:#4ade80}
.proxy .idx{color:#64748b;font-size:0.8rem;margin-right:10px}
.proxy .addr{font-family:monospace;font-size:0.85rem}
.proxy .loc{color:#94a3b8;font-size:0.8rem}
.proxy .state{font-size:0.75rem;font-weight:bold;color:#64748b}
.proxy.active .state{color:#4ade80}
.empty{text-align:center;padding:40px;color:#64748b}
.total{color:#94a3b8;font-size:0.85rem}
</style>
</head>
<body>
<div class="container">
"#,
    );

    page.push_str(&format!(
        "<div style=\"display:flex;justify-content:space-between;align-items:center\">\
         <h1>SOCKS5 Proxy Pool</h1><span class=\"total\">{} proxies</span></div>\n",
        data.total
    ));
    page.push_str(&format!(
        "<div class=\"current\"><span class=\"badge\">IN USE</span> \
         <span class=\"addr\">{}</span> <span class=\"region\">{}</span></div>\n",
        escape(&data.active_proxy),
        escape(&data.active_region)
    ));
    page.push_str(&format!(
        "<div class=\"times\"><div>Last: <span>{}</span><br>Next: <span>{}</span></div>\
         <button class=\"btn\" onclick=\"doRefresh(this)\">Refresh Pool</button></div>\n",
        if data.last_scrape.is_empty() { "N/A" } else { &data.last_scrape },
        if data.next_scrape.is_empty() { "N/A" } else { &data.next_scrape },
    ));

    if data.proxies.is_empty() {
        page.push_str(
            "<p class=\"empty\">No proxies available. Waiting for next scrape cycle...</p>\n",
        );
    } else {
        for (i, proxy) in data.proxies.iter().enumerate() {
            let location = if proxy.city.is_empty() {
                proxy.country.clone()
            } else {
                format!("{}, {}", proxy.country, proxy.city)
            };
            page.push_str(&format!(
                "<div class=\"proxy{active}\" onclick=\"doSwitch({i})\">\
                 <div><span class=\"idx\">{i}</span><span class=\"addr\">{addr}</span> \
                 <span class=\"loc\">{loc}</span></div>\
                 <span class=\"state\">{state}</span></div>\n",
                active = if proxy.active { " active" } else { "" },
                addr = escape(&proxy.addr),
                loc = escape(&location),
                state = if proxy.active { "IN USE" } else { "standby" },
            ));
        }
    }

    page.push_str(
        r#"<script>
function doSwitch(idx) {
  fetch('/api/switch?index=' + idx).then(function(res) {
    if (res.ok) { location.reload(); } else { alert('Switch failed'); }
  });
}
function doRefresh(btn) {
  btn.disabled = true;
  btn.textContent = 'Refreshing...';
  fetch('/api/refresh').then(function() {
    setTimeout(function() { location.reload(); }, 15000);
  });
}
</script>
</body>
</html>"#,
    );
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::Proxy;
    use crate::refresh::refresh_channel;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;

    fn pool_with(n: usize) -> Arc<ProxyPool> {
        let pool = Arc::new(ProxyPool::new());
        let proxies: Vec<Proxy> = (0..n)
            .map(|i| {
                let mut proxy = Proxy::new(&format!("10.0.0.{}", i + 1), "1080").unwrap();
                proxy.country = "Germany".to_string();
                proxy.city = "Berlin".to_string();
                proxy
            })
            .collect();
        pool.update(proxies);
        pool
    }

    fn server_with(pool: Arc<ProxyPool>) -> (Arc<StatusServer>, mpsc::Receiver<()>) {
        let (handle, rx) = refresh_channel();
        let server = Arc::new(StatusServer::new(
            pool,
            Arc::new(ScrapeTiming::new()),
            handle,
        ));
        (server, rx)
    }

    async fn spawn_status(server: Arc<StatusServer>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });
        addr
    }

    async fn http_get(addr: SocketAddr, path: &str) -> (u16, String) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut raw = Vec::new();
        stream.read_to_end(&mut raw).await.unwrap();
        let text = String::from_utf8_lossy(&raw).into_owned();

        let status = text
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap_or(0);
        let body = text
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default();
        (status, body)
    }

    #[test]
    fn status_data_for_empty_pool() {
        let (server, _rx) = server_with(Arc::new(ProxyPool::new()));
        let data = server.status_data();
        assert_eq!(data.total, 0);
        assert_eq!(data.active_proxy, "None");
        assert_eq!(data.active_region, "-");
        assert_eq!(data.last_scrape, "");
        assert_eq!(data.next_scrape, "");
        assert!(data.proxies.is_empty());
    }

    #[test]
    fn status_data_marks_active_proxy() {
        let pool = pool_with(3);
        pool.switch_to(1);
        let (server, _rx) = server_with(pool);

        let data = server.status_data();
        assert_eq!(data.total, 3);
        assert_eq!(data.active_proxy, "10.0.0.2:1080");
        assert_eq!(data.active_region, "Germany, Berlin");
        let flags: Vec<bool> = data.proxies.iter().map(|p| p.active).collect();
        assert_eq!(flags, vec![false, true, false]);
    }

    #[test]
    fn parse_index_variants() {
        assert!(matches!(parse_index(None), IndexParam::Absent));
        assert!(matches!(parse_index(Some("")), IndexParam::Absent));
        assert!(matches!(parse_index(Some("index=")), IndexParam::Absent));
        assert!(matches!(parse_index(Some("index=3")), IndexParam::Given(3)));
        assert!(matches!(
            parse_index(Some("other=1&index=2")),
            IndexParam::Given(2)
        ));
        assert!(matches!(parse_index(Some("index=abc")), IndexParam::Invalid));
        assert!(matches!(parse_index(Some("index=-1")), IndexParam::Invalid));
    }

    #[test]
    fn format_time_renders_utc_plus_8() {
        let time = DateTime::parse_from_rfc3339("2024-06-01T00:30:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_time(Some(time)), "2024-06-01 08:30:00");
        assert_eq!(format_time(None), "");
    }

    #[tokio::test]
    async fn api_status_returns_snapshot_json() {
        let (server, _rx) = server_with(pool_with(2));
        let addr = spawn_status(server).await;

        let (status, body) = http_get(addr, "/api/status").await;
        assert_eq!(status, 200);

        let value: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["total"], 2);
        assert_eq!(value["active_proxy"], "10.0.0.1:1080");
        assert_eq!(value["proxies"][0]["active"], true);
        assert_eq!(value["proxies"][1]["active"], false);
    }

    #[tokio::test]
    async fn api_refresh_signals_orchestrator() {
        let (server, mut rx) = server_with(pool_with(1));
        let addr = spawn_status(server).await;

        let (status, body) = http_get(addr, "/api/refresh").await;
        assert_eq!(status, 200);
        assert!(body.contains("refresh triggered"));

        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn api_switch_advances_and_validates() {
        let pool = pool_with(3);
        let (server, _rx) = server_with(Arc::clone(&pool));
        let addr = spawn_status(server).await;

        let (status, _) = http_get(addr, "/api/switch").await;
        assert_eq!(status, 200);
        assert_eq!(pool.current_index(), 1);

        let (status, _) = http_get(addr, "/api/switch?index=0").await;
        assert_eq!(status, 200);
        assert_eq!(pool.current_index(), 0);

        let (status, body) = http_get(addr, "/api/switch?index=9").await;
        assert_eq!(status, 400);
        assert!(body.contains("out of range"));
        assert_eq!(pool.current_index(), 0);

        let (status, body) = http_get(addr, "/api/switch?index=abc").await;
        assert_eq!(status, 400);
        assert!(body.contains("invalid index"));
    }

    #[tokio::test]
    async fn api_switch_on_empty_pool_is_unavailable() {
        let (server, _rx) = server_with(Arc::new(ProxyPool::new()));
        let addr = spawn_status(server).await;

        let (status, body) = http_get(addr, "/api/switch").await;
        assert_eq!(status, 503);
        assert!(body.contains("no proxies available"));
    }

    #[tokio::test]
    async fn dashboard_lists_proxies() {
        let (server, _rx) = server_with(pool_with(2));
        let addr = spawn_status(server).await;

        let (status, body) = http_get(addr, "/").await;
        assert_eq!(status, 200);
        assert!(body.contains("SOCKS5 Proxy Pool"));
        assert!(body.contains("10.0.0.1:1080"));
        assert!(body.contains("10.0.0.2:1080"));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (server, _rx) = server_with(pool_with(1));
        let addr = spawn_status(server).await;

        let (status, _) = http_get(addr, "/nope").await;
        assert_eq!(status, 404);
    }
}
