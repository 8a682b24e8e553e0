//! Startup errors and JSON error responses for the front door

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Errors that prevent the front door from starting
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("pool must contain at least one backend")]
    EmptyPool,

    #[error("backend {index}: invalid address '{address}' (expected host:port)")]
    InvalidAddress { index: usize, address: String },

    #[error("instance_count is {instance_count} but {addresses} addresses are listed")]
    CountMismatch {
        instance_count: usize,
        addresses: usize,
    },

    #[error("backend {index}: port base {base_port} + {index} is out of range")]
    PortOutOfRange { base_port: u16, index: usize },
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Request cannot be expressed as a backend request
    MalformedRequest,
    /// Lifecycle manager could not bring the backend up
    BackendStartFailed,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MalformedRequest => StatusCode::BAD_REQUEST,
            ProxyErrorCode::BackendStartFailed => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MalformedRequest => "MALFORMED_REQUEST",
            ProxyErrorCode::BackendStartFailed => "BACKEND_START_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Machine-readable code, also sent as `X-Proxy-Error`
    pub code: ProxyErrorCode,
    /// Short description; never includes backend error detail
    pub message: String,
    /// HTTP status code, repeated for clients that only see the body
    pub status: u16,
}

impl ErrorResponse {
    /// Build a body for `code`; the status is derived from the code
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Serialize to a JSON string. Falls back to hand formatting, escaping
    /// backslashes and quotes in the message, if serialization fails.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                escape_json_str(&self.message),
                self.status
            )
        })
    }
}

fn escape_json_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out
}

/// Create a JSON error response with X-Proxy-Error header.
///
/// Every error the front door produces itself goes through here, so clients
/// can tell proxy errors from backend responses by the header alone.
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
