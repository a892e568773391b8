//! Admin API: status, manual start/stop, runtime settings, activity log,
//! backend logs and a server-sent-events feed.

use crate::activity::{ActivityEntry, DEFAULT_QUERY_LIMIT};
use crate::config::SettingsUpdate;
use crate::error::{LifecycleError, TargetError};
use crate::lifecycle::LifecycleController;
use crate::target::DEFAULT_LOG_TAIL;
use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, Limited, StreamBody};
use hyper::body::{Bytes, Frame, Incoming};
use hyper::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

type AdminBody = UnsyncBoxBody<Bytes, Infallible>;

fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<AdminBody> {
    let mut response = Response::new(Full::new(body.into()).boxed_unsync());
    *response.status_mut() = status;
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<AdminBody> {
    let body = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut response = response(status, body);
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response<AdminBody> {
    json_response(
        status,
        &serde_json::json!({ "success": false, "error": message.into() }),
    )
}

pub struct AdminServer {
    bind_addr: SocketAddr,
    controller: Arc<LifecycleController>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<Option<String>>,
    push_interval: Duration,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        controller: Arc<LifecycleController>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: Option<String>,
    ) -> Self {
        Self {
            bind_addr,
            controller,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
            push_interval: Duration::from_secs(2),
        }
    }

    /// Interval between status events on `/api/events`
    pub fn with_push_interval(mut self, interval: Duration) -> Self {
        self.push_interval = interval;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        if self.auth_token.is_none() {
            warn!(addr = %addr, "Admin API has no token; write endpoints are unauthenticated");
        }
        info!(addr = %addr, "Admin API server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let controller = Arc::clone(&self.controller);
                            let auth_token = Arc::clone(&self.auth_token);
                            let push_interval = self.push_interval;

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, controller, auth_token, push_interval).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    controller: Arc<LifecycleController>,
    auth_token: Arc<Option<String>>,
    push_interval: Duration,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let controller = Arc::clone(&controller);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, controller, token, push_interval).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

/// Requires `Authorization: Bearer <token>`. Always passes when no token is configured.
fn check_auth<B>(req: &Request<B>, expected_token: Option<&str>) -> bool {
    let Some(expected) = expected_token else {
        return true;
    };
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_compare(token, expected))
}

/// Constant-time string comparison to prevent timing attacks
fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

/// Numeric query parameter, falling back to `default` when absent or malformed
fn query_usize(query: Option<&str>, name: &str, default: usize) -> usize {
    query
        .into_iter()
        .flat_map(|q| q.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == name)
        .and_then(|(_, value)| value.parse::<usize>().ok())
        .unwrap_or(default)
}

async fn handle_admin_request(
    req: Request<Incoming>,
    controller: Arc<LifecycleController>,
    auth_token: Arc<Option<String>>,
    push_interval: Duration,
) -> Result<Response<AdminBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Admin API request");

    let needs_auth = matches!(method, Method::POST | Method::PUT);
    if needs_auth && !check_auth(&req, auth_token.as_deref()) {
        warn!(%path, "Unauthorized admin API request");
        return Ok(json_error(StatusCode::UNAUTHORIZED, "unauthorized"));
    }

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => json_response(
            StatusCode::OK,
            &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
        ),

        (&Method::GET, "/api/status") => json_response(StatusCode::OK, &controller.snapshot()),

        (&Method::POST, "/api/start") => match controller.ensure_running().await {
            Ok(outcome) => json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "success": true,
                    "message": "Backend is running",
                    "outcome": outcome,
                    "status": controller.snapshot(),
                }),
            ),
            Err(e) => lifecycle_error_response(&e),
        },

        (&Method::POST, "/api/stop") => {
            match controller.request_stop("Stopped via admin API").await {
                Ok(outcome) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({
                        "success": true,
                        "message": "Backend is stopped",
                        "outcome": outcome,
                        "status": controller.snapshot(),
                    }),
                ),
                Err(e) => lifecycle_error_response(&e),
            }
        }

        (&Method::GET, "/api/config") => json_response(StatusCode::OK, &controller.settings()),

        (&Method::PUT, "/api/config") => {
            let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return Ok(json_error(
                        StatusCode::BAD_REQUEST,
                        format!("invalid request body: {}", e),
                    ))
                }
            };

            match serde_json::from_slice::<SettingsUpdate>(&body) {
                Err(e) => json_error(StatusCode::BAD_REQUEST, format!("invalid JSON: {}", e)),
                Ok(update) => match controller.update_settings(&update) {
                    Ok(settings) => json_response(
                        StatusCode::OK,
                        &serde_json::json!({ "success": true, "config": settings }),
                    ),
                    Err(e) => json_error(StatusCode::BAD_REQUEST, e.to_string()),
                },
            }
        }

        (&Method::GET, "/api/activity") => {
            let limit = query_usize(req.uri().query(), "limit", DEFAULT_QUERY_LIMIT);
            let entries = controller.activity().recent(limit);
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "count": entries.len(), "entries": entries }),
            )
        }

        (&Method::GET, "/api/logs") => {
            let tail = query_usize(req.uri().query(), "tail", DEFAULT_LOG_TAIL);
            match controller.logs(tail).await {
                Ok(lines) => json_response(
                    StatusCode::OK,
                    &serde_json::json!({ "count": lines.len(), "logs": lines }),
                ),
                Err(TargetError::NotFound(name)) => {
                    json_error(StatusCode::NOT_FOUND, format!("backend '{}' not found", name))
                }
                Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }

        (&Method::POST, "/api/reset-idle") => {
            controller.reset_idle();
            json_response(
                StatusCode::OK,
                &serde_json::json!({ "success": true, "status": controller.snapshot() }),
            )
        }

        (&Method::GET, "/api/events") => event_stream(controller, push_interval),

        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

fn lifecycle_error_response(err: &LifecycleError) -> Response<AdminBody> {
    let status = match err {
        LifecycleError::TargetNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    json_error(status, err.to_string())
}

fn sse_event<T: Serialize>(event: &str, data: &T) -> Bytes {
    let json = serde_json::to_string(data).unwrap_or_else(|_| "null".to_string());
    Bytes::from(format!("event: {}\ndata: {}\n\n", event, json))
}

struct EventStreamState {
    controller: Arc<LifecycleController>,
    activity: broadcast::Receiver<ActivityEntry>,
    ticker: tokio::time::Interval,
}

/// `status` events every push interval (first one immediately) and an
/// `activity` event for every new log entry
fn event_stream(controller: Arc<LifecycleController>, push_interval: Duration) -> Response<AdminBody> {
    let mut ticker = tokio::time::interval(push_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let state = EventStreamState {
        activity: controller.activity().subscribe(),
        controller,
        ticker,
    };

    let events = stream::unfold(state, |mut state| async move {
        let chunk = tokio::select! {
            _ = state.ticker.tick() => sse_event("status", &state.controller.snapshot()),
            received = state.activity.recv() => match received {
                Ok(entry) => sse_event("activity", &entry),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    Bytes::from(format!(": skipped {} activity events\n\n", skipped))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            },
        };
        Some((Ok::<_, Infallible>(Frame::data(chunk)), state))
    });

    let mut response = Response::new(StreamBody::new(events).boxed_unsync());
    let headers = response.headers_mut();
    headers.insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(CACHE_CONTROL, hyper::header::HeaderValue::from_static("no-cache"));
    response
}
