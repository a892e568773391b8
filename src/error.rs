//! Error types for the lifecycle and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Failure reported by a target implementation
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("failed to launch target: {0}")]
    Spawn(String),
    #[error("target '{0}' does not exist")]
    NotFound(String),
    #[error("failed to stop target: {0}")]
    Stop(String),
    #[error("target runtime error: {0}")]
    Runtime(String),
}

/// Failure of a lifecycle transition.
///
/// Cloneable so every caller that joined an in-progress start observes the
/// same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("backend failed to launch: {0}")]
    Spawn(String),
    #[error("backend did not become ready within {0}s")]
    ReadinessTimeout(u64),
    #[error("backend exited during startup")]
    TargetExited,
    #[error("backend '{0}' not found")]
    TargetNotFound(String),
    #[error("backend failed to stop: {0}")]
    Stop(String),
}

impl From<TargetError> for LifecycleError {
    fn from(err: TargetError) -> Self {
        match err {
            TargetError::Spawn(msg) | TargetError::Runtime(msg) => LifecycleError::Spawn(msg),
            TargetError::NotFound(name) => LifecycleError::TargetNotFound(name),
            TargetError::Stop(msg) => LifecycleError::Stop(msg),
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Backend is stopped and auto-start is disabled
    BackendNotRunning,
    /// Backend container does not exist
    BackendNotFound,
    /// Backend is shutting down
    BackendShuttingDown,
    /// Backend failed to start
    BackendStartFailed,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::BackendNotRunning
            | ProxyErrorCode::BackendNotFound
            | ProxyErrorCode::BackendShuttingDown
            | ProxyErrorCode::BackendStartFailed
            | ProxyErrorCode::ConnectionFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::BackendNotRunning => "BACKEND_NOT_RUNNING",
            ProxyErrorCode::BackendNotFound => "BACKEND_NOT_FOUND",
            ProxyErrorCode::BackendShuttingDown => "BACKEND_SHUTTING_DOWN",
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
        }
    }

    /// Map a failed start to the code the proxy reports
    pub fn for_lifecycle_error(err: &LifecycleError) -> Self {
        match err {
            LifecycleError::TargetNotFound(_) => ProxyErrorCode::BackendNotFound,
            LifecycleError::Stop(_) => ProxyErrorCode::BackendShuttingDown,
            _ => ProxyErrorCode::BackendStartFailed,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let mut response = Response::new(Full::new(Bytes::from(error.to_json())).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    let headers = response.headers_mut();
    headers.insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        "X-Proxy-Error",
        hyper::header::HeaderValue::from_static(code.as_header_value()),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::BackendNotRunning.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::BackendStartFailed.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_header_value_matches_json_code() {
        for code in [
            ProxyErrorCode::BackendNotRunning,
            ProxyErrorCode::BackendNotFound,
            ProxyErrorCode::BackendShuttingDown,
            ProxyErrorCode::BackendStartFailed,
            ProxyErrorCode::RequestTimeout,
            ProxyErrorCode::ConnectionFailed,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_header_value()));
            assert!(code.status_code().is_server_error());
        }
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(
            ProxyErrorCode::BackendStartFailed,
            "backend did not become ready within 10s",
        );
        let json = error.to_json();

        assert!(json.contains("\"code\":\"BACKEND_START_FAILED\""));
        assert!(json.contains("\"message\":\"backend did not become ready within 10s\""));
        assert!(json.contains("\"status\":503"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "REQUEST_TIMEOUT"
        );
    }

    #[test]
    fn test_lifecycle_error_mapping() {
        assert!(matches!(
            ProxyErrorCode::for_lifecycle_error(&LifecycleError::TargetNotFound("comfyui".into())),
            ProxyErrorCode::BackendNotFound
        ));
        assert!(matches!(
            ProxyErrorCode::for_lifecycle_error(&LifecycleError::ReadinessTimeout(10)),
            ProxyErrorCode::BackendStartFailed
        ));
    }

    #[test]
    fn test_target_error_conversion() {
        let err: LifecycleError = TargetError::NotFound("comfyui".into()).into();
        assert_eq!(err, LifecycleError::TargetNotFound("comfyui".into()));

        let err: LifecycleError = TargetError::Spawn("No such file".into()).into();
        assert_eq!(err.to_string(), "backend failed to launch: No such file");
    }
}
