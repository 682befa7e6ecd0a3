//! Per-session reverse proxies with IDE-specific HTTP/WS rewriting (§4.I).
//! The richest subsystem in the broker: every other component either feeds
//! this one a port (TunnelManager, via PortRegistry) or reads its activity
//! signal (IdleReaper, via the activity callback).

pub mod jupyter;
pub mod port_forward;
pub mod rstudio;
pub mod vscode;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;

use crate::model::{Ide, SessionKey};
use crate::port::PortRegistry;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

const HOP_BY_HOP_HEADERS: &[&str] =
    &["connection", "keep-alive", "proxy-authenticate", "proxy-authorization", "te", "trailers", "transfer-encoding", "upgrade", "host"];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

fn extract_cookie<'a>(cookie_header: &'a str, name: &str) -> Option<&'a str> {
    cookie_header.split(';').map(|kv| kv.trim()).find_map(|kv| kv.strip_prefix(name).and_then(|rest| rest.strip_prefix('=')))
}

fn html_error(status: StatusCode, message: &str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(axum::http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(format!("<html><body><h1>{status}</h1><p>{message}</p></body></html>")))
        .unwrap_or_else(|_| Response::new(Body::from("proxy error")))
}

/// A proxy error never disturbs session state (§4.K failure handling): the
/// caller always gets a 502 page back, never a propagated `BrokerError`.
fn bad_gateway(message: &str) -> Response<Body> {
    html_error(StatusCode::BAD_GATEWAY, message)
}

fn redirect(location: &str, cookies: &[String]) -> Response<Body> {
    let mut builder = Response::builder().status(StatusCode::FOUND).header(axum::http::header::LOCATION, location);
    for cookie in cookies {
        builder = builder.header(axum::http::header::SET_COOKIE, cookie);
    }
    builder.body(Body::empty()).unwrap_or_else(|_| bad_gateway("failed to build redirect"))
}

type TokenLookup = Arc<dyn Fn(&SessionKey) -> Option<String> + Send + Sync>;
type ActivityCallback = Arc<dyn Fn(&SessionKey) + Send + Sync>;

/// One reverse-proxy binding: a session key, the IDE that decides its
/// rewriting rules, and its currently-allocated local port.
pub struct Proxy {
    pub session_key: SessionKey,
    pub ide: Ide,
    port: AtomicU16,
    client: reqwest::Client,
}

impl Proxy {
    fn new(session_key: SessionKey, ide: Ide, port: u16, client: reqwest::Client) -> Proxy {
        Proxy { session_key, ide, port: AtomicU16::new(port), client }
    }

    pub fn port(&self) -> u16 {
        self.port.load(Ordering::SeqCst)
    }

    /// Forwards one HTTP request to `127.0.0.1:<port>`, applying this
    /// proxy's IDE-specific request/response rewriting. `external_host` is
    /// only consulted by the rstudio `Location` rewrite.
    async fn forward_http(&self, req: Request<Body>, token: Option<&str>, external_host: &str) -> Result<Response<Body>, String> {
        let (parts, body) = req.into_parts();
        let method = parts.method.clone();
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().unwrap_or("").to_string();
        let headers = parts.headers.clone();

        let cookie_token =
            headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()).and_then(|raw| extract_cookie(raw, vscode::COOKIE_NAME)).map(str::to_string);

        let (path, query) = match self.ide {
            Ide::Vscode => {
                let rewritten_path = vscode::rewrite_path(&path).unwrap_or(path);
                match token {
                    Some(token) if vscode::needs_token_redirect(&rewritten_path, cookie_token.as_deref(), token) => vscode::token_redirect_target(token),
                    _ => (rewritten_path, query),
                }
            }
            Ide::Jupyter => {
                let rewritten_path = jupyter::rewrite_path(&path).unwrap_or(path);
                let rewritten_query = token.map(|t| jupyter::inject_token(&query, t)).unwrap_or(query);
                (rewritten_path, rewritten_query)
            }
            Ide::Rstudio => (path, query),
        };

        let mut url = format!("http://127.0.0.1:{}{}", self.port(), path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }

        let body_bytes = axum::body::to_bytes(body, usize::MAX).await.map_err(|err| err.to_string())?;

        let mut builder = self.client.request(method, url.as_str()).body(body_bytes);
        for (name, value) in headers.iter() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            builder = builder.header(name, value);
        }
        if self.ide == Ide::Rstudio {
            builder = builder.header(rstudio::ROOT_PATH_HEADER.0, rstudio::ROOT_PATH_HEADER.1);
        }
        let timeout = if self.ide == Ide::Rstudio { rstudio::LONG_POLL_TIMEOUT } else { DEFAULT_TIMEOUT };

        let upstream = builder.timeout(timeout).send().await.map_err(|err| err.to_string())?;
        let status = upstream.status();
        let is_403_with_stale_cookie = self.ide == Ide::Vscode && status == reqwest::StatusCode::FORBIDDEN && token.is_some() && cookie_token.as_deref() != token;

        let mut response_headers: Vec<(String, String)> = Vec::new();
        let mut set_cookies: Vec<String> = Vec::new();
        for (name, value) in upstream.headers().iter() {
            let name_str = name.as_str();
            if is_hop_by_hop(name_str) {
                continue;
            }
            if self.ide == Ide::Rstudio && rstudio::STRIPPED_RESPONSE_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name_str)) {
                continue;
            }
            let Ok(value_str) = value.to_str() else { continue };
            if name_str.eq_ignore_ascii_case("set-cookie") {
                set_cookies.push(value_str.to_string());
                continue;
            }
            if name_str.eq_ignore_ascii_case("location") && self.ide == Ide::Rstudio {
                response_headers.push(("location".to_string(), rstudio::rewrite_location(value_str, self.port(), external_host)));
                continue;
            }
            response_headers.push((name_str.to_string(), value_str.to_string()));
        }

        if is_403_with_stale_cookie {
            let mut cookies = vscode::expired_cookie_headers();
            cookies.extend(set_cookies);
            return Ok(redirect(vscode::REAUTH_REDIRECT_PATH, &cookies));
        }

        let body_bytes = upstream.bytes().await.map_err(|err| err.to_string())?;
        let mut response = Response::builder().status(status.as_u16());
        for (name, value) in &response_headers {
            response = response.header(name.as_str(), value.as_str());
        }
        for cookie in &set_cookies {
            let rewritten = match self.ide {
                Ide::Vscode => vscode::rewrite_success_cookie(cookie),
                Ide::Rstudio => rstudio::rewrite_cookie(cookie),
                Ide::Jupyter => cookie.clone(),
            };
            response = response.header(axum::http::header::SET_COOKIE, rewritten);
        }
        response.body(Body::from(body_bytes)).map_err(|err| err.to_string())
    }

    /// Splices raw bytes between the inbound connection and a fresh TCP
    /// connection to the backend (§4.I: WebSocket upgrades follow the same
    /// path-prefix routing as regular requests and require a running
    /// session).
    async fn forward_websocket(&self, req: &mut Request<Body>) -> Response<Body> {
        splice_websocket(self.port(), req).await
    }
}

/// Splices raw bytes between the inbound connection and a fresh TCP
/// connection to the backend on `port`, after manually replaying the
/// original HTTP/1.1 request line and forwarding the backend's handshake
/// response headers back to the caller. Shared by the per-session IDE
/// proxies and the fixed-port dev-server forward (§4.I "port" row), which
/// has no session and therefore no [`Proxy`] to hang this off of.
async fn splice_websocket(port: u16, req: &mut Request<Body>) -> Response<Body> {
    let method = req.method().clone();
    let path_and_query = req.uri().path_and_query().map(|p| p.as_str().to_string()).unwrap_or_else(|| "/".to_string());
    let headers = req.headers().clone();

    let mut stream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(stream) => stream,
        Err(err) => return bad_gateway(&format!("websocket backend connect failed: {err}")),
    };

    let mut raw_request = format!("{method} {path_and_query} HTTP/1.1\r\n").into_bytes();
    for (name, value) in headers.iter() {
        if name.as_str().eq_ignore_ascii_case("host") {
            continue;
        }
        raw_request.extend_from_slice(name.as_str().as_bytes());
        raw_request.extend_from_slice(b": ");
        raw_request.extend_from_slice(value.as_bytes());
        raw_request.extend_from_slice(b"\r\n");
    }
    raw_request.extend_from_slice(format!("Host: 127.0.0.1:{port}\r\n\r\n").as_bytes());

    if let Err(err) = stream.write_all(&raw_request).await {
        return bad_gateway(&format!("websocket handshake write failed: {err}"));
    }

    let head = match read_response_head(&mut stream).await {
        Ok(head) => head,
        Err(err) => return bad_gateway(&format!("websocket handshake read failed: {err}")),
    };

    let on_upgrade = hyper::upgrade::on(req);
    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                if let Err(err) = tokio::io::copy_bidirectional(&mut client_io, &mut stream).await {
                    tracing::debug!(error = %err, "websocket splice ended");
                }
            }
            Err(err) => tracing::warn!(error = %err, "client-side websocket upgrade failed"),
        }
    });

    let mut response = Response::builder().status(head.status);
    for (name, value) in &head.headers {
        if is_hop_by_hop(name) && !name.eq_ignore_ascii_case("upgrade") && !name.eq_ignore_ascii_case("connection") {
            continue;
        }
        response = response.header(name.as_str(), value.as_str());
    }
    response.body(Body::empty()).unwrap_or_else(|_| bad_gateway("failed to build websocket response"))
}

/// Plain HTTP pass-through for the fixed-port dev-server forward (§4.I
/// "port" row): no IDE-specific rewriting, no token, no cookie rewriting —
/// just headers and body, forwarded verbatim to `127.0.0.1:<port>`.
async fn forward_plain_http(client: &reqwest::Client, port: u16, req: Request<Body>) -> Result<Response<Body>, String> {
    let (parts, body) = req.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().unwrap_or("").to_string();
    let headers = parts.headers.clone();

    let mut url = format!("http://127.0.0.1:{port}{path}");
    if !query.is_empty() {
        url.push('?');
        url.push_str(&query);
    }

    let body_bytes = axum::body::to_bytes(body, usize::MAX).await.map_err(|err| err.to_string())?;
    let mut builder = client.request(method, url.as_str()).body(body_bytes);
    for (name, value) in headers.iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }

    let upstream = builder.timeout(DEFAULT_TIMEOUT).send().await.map_err(|err| err.to_string())?;
    let status = upstream.status();
    let mut response_headers: Vec<(String, String)> = Vec::new();
    for (name, value) in upstream.headers().iter() {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        let Ok(value_str) = value.to_str() else { continue };
        response_headers.push((name.as_str().to_string(), value_str.to_string()));
    }
    let body_bytes = upstream.bytes().await.map_err(|err| err.to_string())?;
    let mut response = Response::builder().status(status.as_u16());
    for (name, value) in &response_headers {
        response = response.header(name.as_str(), value.as_str());
    }
    response.body(Body::from(body_bytes)).map_err(|err| err.to_string())
}

struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

/// Reads an HTTP/1.1 response head (status line + headers) off a raw
/// socket, one byte at a time until the terminating blank line — simple
/// rather than fast, since a handshake response is a few hundred bytes.
async fn read_response_head(stream: &mut TcpStream) -> std::io::Result<ResponseHead> {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        raw.push(byte[0]);
        if raw.len() >= 4 && &raw[raw.len() - 4..] == b"\r\n\r\n" {
            break;
        }
    }
    let text = String::from_utf8_lossy(&raw);
    let mut lines = text.split("\r\n").filter(|l| !l.is_empty());
    let status_line = lines.next().unwrap_or("HTTP/1.1 502 Bad Gateway");
    let status = status_line.split_whitespace().nth(1).and_then(|s| s.parse().ok()).unwrap_or(502);
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();
    Ok(ResponseHead { status, headers })
}

/// Owns every live proxy, keyed by `SessionKey`, plus the fixed-port
/// dev-server forwards (§4.I "port" row) named up front by
/// `ADDITIONAL_PORTS` — those are shared across sessions and never go
/// through `PortRegistry`.
pub struct ProxyRegistry {
    proxies: RwLock<HashMap<SessionKey, Arc<Proxy>>>,
    ports: Arc<PortRegistry>,
    port_forwards: Vec<port_forward::PortForward>,
    client: reqwest::Client,
    token_lookup: RwLock<Option<TokenLookup>>,
    activity: RwLock<Option<ActivityCallback>>,
}

impl ProxyRegistry {
    pub fn new(ports: Arc<PortRegistry>, port_forwards: Vec<port_forward::PortForward>) -> ProxyRegistry {
        ProxyRegistry {
            proxies: RwLock::new(HashMap::new()),
            ports,
            port_forwards,
            client: reqwest::Client::builder().pool_idle_timeout(Duration::from_secs(90)).build().expect("valid reqwest client configuration"),
            token_lookup: RwLock::new(None),
            activity: RwLock::new(None),
        }
    }

    fn is_port_configured(&self, port: u16) -> bool {
        self.port_forwards.iter().any(|f| f.port == port)
    }

    /// Forwards one HTTP request to a configured dev-server port (§4.I
    /// "port" row). Unlike [`Self::forward`] this is not session-keyed: any
    /// port outside `ADDITIONAL_PORTS` is refused with a 502 rather than
    /// dialed, since this path carries no auth of its own.
    pub async fn forward_port(&self, port: u16, req: Request<Body>) -> Response<Body> {
        if !self.is_port_configured(port) {
            return bad_gateway("port not in configured forward list");
        }
        match forward_plain_http(&self.client, port, req).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(port, error = %err, "port-forward request failed");
                bad_gateway(&err)
            }
        }
    }

    pub async fn forward_port_websocket(&self, port: u16, mut req: Request<Body>) -> Response<Body> {
        if !self.is_port_configured(port) {
            return bad_gateway("port not in configured forward list");
        }
        splice_websocket(port, &mut req).await
    }

    pub async fn set_token_lookup(&self, lookup: TokenLookup) {
        *self.token_lookup.write().await = Some(lookup);
    }

    pub async fn set_activity_callback(&self, callback: ActivityCallback) {
        *self.activity.write().await = Some(callback);
    }

    pub async fn create(&self, session_key: SessionKey, ide: Ide, port: u16) -> Arc<Proxy> {
        let proxy = Arc::new(Proxy::new(session_key.clone(), ide, port, self.client.clone()));
        self.proxies.write().await.insert(session_key, proxy.clone());
        proxy
    }

    /// Stale-port-drift detection (§4.I): a proxy whose recorded port no
    /// longer matches `PortRegistry` (the tunnel was restarted and a new
    /// port allocated) is destroyed here rather than served.
    pub async fn get(&self, session_key: &SessionKey) -> Option<Arc<Proxy>> {
        let proxy = self.proxies.read().await.get(session_key).cloned()?;
        let current_port = self.ports.get(session_key).await;
        if current_port != Some(proxy.port()) {
            self.destroy(session_key).await;
            return None;
        }
        Some(proxy)
    }

    pub async fn destroy(&self, session_key: &SessionKey) {
        self.proxies.write().await.remove(session_key);
    }

    pub async fn destroy_all(&self) {
        self.proxies.write().await.clear();
    }

    async fn notify_activity(&self, session_key: &SessionKey) {
        if let Some(callback) = self.activity.read().await.as_ref() {
            callback(session_key);
        }
    }

    async fn token_for(&self, session_key: &SessionKey) -> Option<String> {
        self.token_lookup.read().await.as_ref().and_then(|lookup| lookup(session_key))
    }

    /// Forwards one HTTP request for a session. A missing or stale proxy,
    /// or an upstream failure, both resolve to a 502 page rather than
    /// disturbing session state (§4.K).
    pub async fn forward(&self, session_key: &SessionKey, req: Request<Body>, external_host: &str) -> Response<Body> {
        let Some(proxy) = self.get(session_key).await else {
            return bad_gateway("no active proxy for this session");
        };
        let token = self.token_for(session_key).await;
        self.notify_activity(session_key).await;
        match proxy.forward_http(req, token.as_deref(), external_host).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(session_key = %session_key, error = %err, "proxy request failed");
                bad_gateway(&err)
            }
        }
    }

    pub async fn forward_websocket(&self, session_key: &SessionKey, mut req: Request<Body>) -> Response<Body> {
        let Some(proxy) = self.get(session_key).await else {
            return bad_gateway("no active proxy for this session");
        };
        self.notify_activity(session_key).await;
        proxy.forward_websocket(&mut req).await
    }
}
