//! Connection pool for backend HTTP connections
//!
//! One pooled client carries proxied traffic, a second one carries readiness
//! and queue probes so that probe traffic never competes with user requests
//! for idle connections.

use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, CONNECTION, HOST};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Headers that only apply to a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest probe response body that will be parsed
const MAX_PROBE_BODY: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
}

/// Statistics for the connection pool
#[derive(Debug, Default)]
pub struct PoolStats {
    pub total_requests: AtomicU64,
    pub probes: AtomicU64,
}

impl PoolStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_probe(&self) {
        self.probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// A connection pool for HTTP connections to the backend
pub struct ConnectionPool {
    client: Client<HttpConnector, Incoming>,
    probe_client: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector.clone());

        let probe_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Self {
            client,
            probe_client,
            stats: Arc::new(PoolStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to `authority` (host:port), dropping hop-by-hop headers
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        authority: &str,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", authority, path);

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        // The client derives Host from the backend URI
        headers.remove(HOST);

        let mut backend_req = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;
        *backend_req.headers_mut() = headers;

        self.stats.record_request();

        let response = self.client.request(backend_req).await?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// GET `path` and report whether the backend answered with a 2xx status
    pub async fn check_backend(&self, authority: &str, path: &str, timeout: Duration) -> bool {
        let Ok(req) = probe_request(authority, path) else {
            return false;
        };
        self.stats.record_probe();

        match tokio::time::timeout(timeout, self.probe_client.request(req)).await {
            Ok(Ok(response)) => response.status().is_success(),
            _ => false,
        }
    }

    /// GET `path` and parse a successful JSON response
    pub async fn get_json(
        &self,
        authority: &str,
        path: &str,
        timeout: Duration,
    ) -> Option<serde_json::Value> {
        let req = probe_request(authority, path).ok()?;
        self.stats.record_probe();

        let fetch = async {
            let response = self.probe_client.request(req).await.ok()?;
            if !response.status().is_success() {
                return None;
            }
            let body = response.into_body().collect().await.ok()?.to_bytes();
            if body.len() > MAX_PROBE_BODY {
                return None;
            }
            serde_json::from_slice(&body).ok()
        };

        tokio::time::timeout(timeout, fetch).await.ok().flatten()
    }
}

fn probe_request(authority: &str, path: &str) -> Result<Request<Empty<Bytes>>, hyper::http::Error> {
    Request::builder()
        .method("GET")
        .uri(format!("http://{}{}", authority, path))
        .header("Connection", "keep-alive")
        .body(Empty::<Bytes>::new())
}

/// Remove hop-by-hop headers, including any named in `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::HeaderValue;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn test_pool_stats() {
        let stats = PoolStats::default();
        stats.record_request();
        stats.record_request();
        stats.record_probe();
        assert_eq!(stats.get_total_requests(), 2);
        assert_eq!(stats.get_probes(), 1);
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-session-hint"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session-hint", HeaderValue::from_static("abc"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("cookie", HeaderValue::from_static("session=1"));
        headers.insert("content-type", HeaderValue::from_static("application/json"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-session-hint").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("cookie").unwrap(), "session=1");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
    }

    #[tokio::test]
    async fn test_check_backend_unreachable() {
        let pool = ConnectionPool::new(PoolConfig::default());
        // Port 1 is reserved and nothing listens there
        assert!(
            !pool
                .check_backend("127.0.0.1:1", "/health", Duration::from_secs(2))
                .await
        );
        assert_eq!(pool.stats().get_probes(), 1);
    }

    #[tokio::test]
    async fn test_get_json_unreachable() {
        let pool = ConnectionPool::new(PoolConfig::default());
        assert!(pool
            .get_json("127.0.0.1:1", "/queue", Duration::from_secs(2))
            .await
            .is_none());
    }
}
