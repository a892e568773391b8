use crate::error::{json_error_response, ProxyErrorCode};
use crate::lifecycle::{InFlightGuard, LifecycleController, LifecycleState};
use crate::pool::ConnectionPool;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Body, Bytes, Frame, Incoming, SizeHint};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Where and how requests are forwarded
#[derive(Debug, Clone)]
pub struct BackendRoute {
    /// host:port of the backend
    pub authority: String,
    /// Path prefix removed before forwarding
    pub strip_prefix: Option<String>,
    /// Max time to wait for the backend to answer
    pub request_timeout: Duration,
}

/// The activity-driven reverse proxy
pub struct ProxyServer {
    bind_addr: SocketAddr,
    controller: Arc<LifecycleController>,
    pool: Arc<ConnectionPool>,
    route: Arc<BackendRoute>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<LifecycleController>,
        pool: Arc<ConnectionPool>,
        route: BackendRoute,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            controller,
            pool,
            route: Arc::new(route),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, backend = %self.route.authority, "Proxy server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let controller = Arc::clone(&self.controller);
                            let pool = Arc::clone(&self.pool);
                            let route = Arc::clone(&self.route);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, controller, pool, route).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    controller: Arc<LifecycleController>,
    pool: Arc<ConnectionPool>,
    route: Arc<BackendRoute>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let controller = Arc::clone(&controller);
        let pool = Arc::clone(&pool);
        let route = Arc::clone(&route);
        async move { handle_request(req, controller, pool, route, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    controller: Arc<LifecycleController>,
    pool: Arc<ConnectionPool>,
    route: Arc<BackendRoute>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // X-Forwarded-* are overwritten, not appended: this proxy is the first trusted hop
    let headers = req.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    if let Some(ref prefix) = route.strip_prefix {
        rewrite_prefix(&mut req, prefix);
    }

    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    if controller.settings().auto_start_enabled {
        if let Err(e) = controller.ensure_running().await {
            error!(error = %e, request_id, "Backend unavailable");
            return Ok(json_error_response(
                ProxyErrorCode::for_lifecycle_error(&e),
                e.to_string(),
            ));
        }
    } else if controller.state() != LifecycleState::Running {
        return Ok(json_error_response(
            ProxyErrorCode::BackendNotRunning,
            "Backend is stopped and auto-start is disabled",
        ));
    }

    if is_upgrade_request(&req) {
        return handle_upgrade(req, controller, route, request_id).await;
    }

    // Atomically verifies the backend is still running
    let Some(guard) = controller.begin_request() else {
        return Ok(json_error_response(
            ProxyErrorCode::BackendShuttingDown,
            "Backend is shutting down, please retry",
        ));
    };

    let result = tokio::time::timeout(
        route.request_timeout,
        pool.send_request(req, &route.authority),
    )
    .await;

    match result {
        Ok(Ok(response)) => {
            let (parts, body) = response.into_parts();
            let body = TrackedBody {
                inner: body,
                guard: Some(guard),
                controller,
            };
            Ok(Response::from_parts(parts, body.boxed()))
        }
        Ok(Err(e)) => {
            error!(backend = %route.authority, error = %e, request_id, "Failed to forward request");
            Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Failed to connect to backend",
            ))
        }
        Err(_) => {
            warn!(
                backend = %route.authority,
                timeout_secs = route.request_timeout.as_secs(),
                request_id,
                "Request timed out"
            );
            Ok(json_error_response(
                ProxyErrorCode::RequestTimeout,
                format!(
                    "Request timed out after {} seconds",
                    route.request_timeout.as_secs()
                ),
            ))
        }
    }
}

/// Response body that keeps the request in flight until it is fully sent,
/// and counts a completed body as activity
struct TrackedBody {
    inner: BoxBody<Bytes, hyper::Error>,
    guard: Option<InFlightGuard>,
    controller: Arc<LifecycleController>,
}

impl TrackedBody {
    fn finish(&mut self, completed: bool) {
        if let Some(guard) = self.guard.take() {
            if completed {
                self.controller.record_activity();
            }
            drop(guard);
        }
    }
}

impl Body for TrackedBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        match poll {
            Poll::Ready(None) => this.finish(true),
            Poll::Ready(Some(Err(_))) => this.finish(false),
            _ => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TrackedBody {
    fn drop(&mut self) {
        // Empty bodies may never be polled
        let completed = self.inner.is_end_stream();
        self.finish(completed);
    }
}

/// Remove `prefix` from the request path. Paths outside the prefix are left alone.
fn rewrite_prefix<B>(req: &mut Request<B>, prefix: &str) {
    let Some(pq) = req.uri().path_and_query().map(|pq| pq.as_str().to_string()) else {
        return;
    };
    if let Some(stripped) = strip_path_prefix(&pq, prefix) {
        match stripped.parse::<Uri>() {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => debug!(error = %e, "Could not rewrite request path"),
        }
    }
}

fn strip_path_prefix(path_and_query: &str, prefix: &str) -> Option<String> {
    let (path, query) = match path_and_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_and_query, None),
    };

    let rest = path.strip_prefix(prefix)?;
    let new_path = if rest.is_empty() {
        "/"
    } else if rest.starts_with('/') {
        rest
    } else {
        // "/comfyuix" does not match "/comfyui"
        return None;
    };

    Some(match query {
        Some(q) => format!("{}?{}", new_path, q),
        None => new_path.to_string(),
    })
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

async fn forward_bidirectional(client: Upgraded, backend: TcpStream, request_id: &str) {
    let mut client_io = TokioIo::new(client);
    let mut backend_io = backend;

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(
                request_id,
                client_to_backend, backend_to_client, "Upgraded connection closed normally"
            );
        }
        Err(e) => {
            debug!(request_id, error = %e, "Upgraded connection closed with error");
        }
    }
}

/// Build the raw HTTP upgrade request to send to the backend
fn build_upgrade_request<B>(req: &Request<B>, authority: &str) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n\r\n", authority));
    request.into_bytes()
}

/// Parse the backend's response head, e.g. `HTTP/1.1 101 Switching Protocols`
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let head = std::str::from_utf8(data).ok()?;
    let mut lines = head.lines();

    let status_line = lines.next()?;
    let code: u16 = status_line.splitn(3, ' ').nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers))
}

fn empty_response(status: StatusCode, headers: &[(String, String)], skip_framing: bool) -> Response<BoxBody<Bytes, hyper::Error>> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    for (name, value) in headers {
        let lower = name.to_ascii_lowercase();
        if skip_framing && (lower == "content-length" || lower == "transfer-encoding") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            hyper::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
}

/// Tunnel a WebSocket (or other HTTP/1.1 upgrade) to the backend.
/// The tunnel counts as one in-flight request until either side closes.
async fn handle_upgrade(
    req: Request<Incoming>,
    controller: Arc<LifecycleController>,
    route: Arc<BackendRoute>,
    request_id: String,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let upgrade_type = req
        .headers()
        .get(hyper::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string());
    debug!(request_id, upgrade_type, "Handling upgrade request");

    let raw_request = build_upgrade_request(&req, &route.authority);

    let mut backend_stream = match TcpStream::connect(&route.authority).await {
        Ok(stream) => stream,
        Err(e) => {
            error!(backend = %route.authority, error = %e, "Failed to connect to backend for upgrade");
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to connect to backend: {}", e),
            ));
        }
    };

    if let Err(e) = backend_stream.write_all(&raw_request).await {
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            format!("Failed to send upgrade request: {}", e),
        ));
    }

    let mut response_buf = vec![0u8; 4096];
    let n = match backend_stream.read(&mut response_buf).await {
        Ok(n) if n > 0 => n,
        Ok(_) => {
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                "Backend closed connection",
            ));
        }
        Err(e) => {
            return Ok(json_error_response(
                ProxyErrorCode::ConnectionFailed,
                format!("Failed to read backend response: {}", e),
            ));
        }
    };

    let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
        return Ok(json_error_response(
            ProxyErrorCode::ConnectionFailed,
            "Invalid upgrade response from backend",
        ));
    };

    if status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(status = %status, request_id, "Backend rejected upgrade request");
        return Ok(empty_response(status, &response_headers, false));
    }

    let Some(guard) = controller.begin_request() else {
        return Ok(json_error_response(
            ProxyErrorCode::BackendShuttingDown,
            "Backend is shutting down, please retry",
        ));
    };

    info!(request_id, upgrade_type, "Upgrade successful");
    let response = empty_response(StatusCode::SWITCHING_PROTOCOLS, &response_headers, true);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                forward_bidirectional(upgraded, backend_stream, &request_id).await;
                controller.record_activity();
            }
            Err(e) => {
                error!(request_id, error = %e, "Failed to upgrade client connection");
            }
        }
        drop(guard);
    });

    Ok(response)
}
