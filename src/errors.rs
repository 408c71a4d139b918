//! Error taxonomy for backend invocation and router-level failures.
//!
//! This module classifies failures talking to a backend worker into the
//! categories the placement, dispatch, and observability layers all key off
//! of, and defines the top-level error types surfaced internally (never to
//! the caller of [`crate::router::Router::generate`] — see `SPEC_FULL.md`
//! §7 for the "every path resolves" principle).

use std::fmt;

/// Categories of errors that can occur while invoking a backend worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// HTTP 4xx errors (client errors)
    ClientError,

    /// HTTP 5xx errors (server errors)
    ServerError,

    /// Network connectivity errors (DNS, connection refused, etc.)
    NetworkError,

    /// Request timeout / cancellation errors
    TimeoutError,

    /// Malformed or empty response body
    MalformedResponse,

    /// Other/unknown errors
    OtherError,
}

impl ErrorCategory {
    /// Categorize an HTTP status code.
    ///
    /// Returns `None` for success responses (2xx/3xx).
    pub fn from_status_code(status_code: u16) -> Option<Self> {
        match status_code {
            200..=399 => None,
            400..=499 => Some(ErrorCategory::ClientError),
            500..=599 => Some(ErrorCategory::ServerError),
            _ => Some(ErrorCategory::OtherError),
        }
    }

    /// Categorize a reqwest error.
    pub fn from_reqwest_error(error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            ErrorCategory::TimeoutError
        } else if error.is_connect() {
            ErrorCategory::NetworkError
        } else if error.is_request() {
            ErrorCategory::NetworkError
        } else if error.is_body() || error.is_decode() {
            ErrorCategory::MalformedResponse
        } else {
            let msg = error.to_string().to_lowercase();
            if msg.contains("timeout") {
                ErrorCategory::TimeoutError
            } else if msg.contains("dns") || msg.contains("resolve") || msg.contains("connect") {
                ErrorCategory::NetworkError
            } else {
                ErrorCategory::OtherError
            }
        }
    }

    /// Prometheus label for this error category.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "client_error",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::NetworkError => "network_error",
            ErrorCategory::TimeoutError => "timeout_error",
            ErrorCategory::MalformedResponse => "malformed_response",
            ErrorCategory::OtherError => "other_error",
        }
    }

    /// Human-readable description of this error category.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCategory::ClientError => "HTTP 4xx Client Errors",
            ErrorCategory::ServerError => "HTTP 5xx Server Errors",
            ErrorCategory::NetworkError => "Network/Connection Errors",
            ErrorCategory::TimeoutError => "Request Timeout/Cancellation",
            ErrorCategory::MalformedResponse => "Malformed Backend Response",
            ErrorCategory::OtherError => "Other/Unknown Errors",
        }
    }

    /// All error categories in a consistent order.
    pub fn all() -> Vec<ErrorCategory> {
        vec![
            ErrorCategory::ClientError,
            ErrorCategory::ServerError,
            ErrorCategory::NetworkError,
            ErrorCategory::TimeoutError,
            ErrorCategory::MalformedResponse,
            ErrorCategory::OtherError,
        ]
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Detailed error information with categorization, attached to a specific worker.
#[derive(Debug, Clone)]
pub struct CategorizedError {
    pub category: ErrorCategory,
    pub status_code: Option<u16>,
    pub message: String,
    pub worker_id: Option<String>,
}

impl CategorizedError {
    pub fn from_status(status_code: u16, message: String, worker_id: Option<String>) -> Option<Self> {
        ErrorCategory::from_status_code(status_code).map(|category| Self {
            category,
            status_code: Some(status_code),
            message,
            worker_id,
        })
    }

    pub fn from_reqwest(error: &reqwest::Error, worker_id: Option<String>) -> Self {
        Self {
            category: ErrorCategory::from_reqwest_error(error),
            status_code: error.status().map(|s| s.as_u16()),
            message: error.to_string(),
            worker_id,
        }
    }

    pub fn new(category: ErrorCategory, message: String) -> Self {
        Self {
            category,
            status_code: None,
            message,
            worker_id: None,
        }
    }
}

impl fmt::Display for CategorizedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(status) => write!(f, "[{}] HTTP {}: {}", self.category.label(), status, self.message),
            None => write!(f, "[{}] {}", self.category.label(), self.message),
        }
    }
}

/// Helper to name common HTTP status codes for display/logging.
pub fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown Status",
    }
}

/// Failure talking to a single backend worker (transport, HTTP, or content).
///
/// Every variant is handled internally per `SPEC_FULL.md` §7: the dispatcher
/// either retries, re-routes, or substitutes a sentinel response. None of
/// these ever reach [`crate::router::Router::generate`]'s caller directly.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transport failure contacting {worker_id}: {source}")]
    Transport {
        worker_id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{worker_id} returned HTTP {status} after exhausting fallbacks")]
    Http { worker_id: String, status: u16 },

    #[error("{worker_id} returned an empty or malformed response")]
    MalformedResponse { worker_id: String },

    #[error("request to {worker_id} was cancelled")]
    Cancelled { worker_id: String },
}

impl BackendError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BackendError::Transport { source, .. } => ErrorCategory::from_reqwest_error(source),
            BackendError::Http { status, .. } => {
                ErrorCategory::from_status_code(*status).unwrap_or(ErrorCategory::OtherError)
            }
            BackendError::MalformedResponse { .. } => ErrorCategory::MalformedResponse,
            BackendError::Cancelled { .. } => ErrorCategory::TimeoutError,
        }
    }

    pub fn worker_id(&self) -> &str {
        match self {
            BackendError::Transport { worker_id, .. }
            | BackendError::Http { worker_id, .. }
            | BackendError::MalformedResponse { worker_id, .. }
            | BackendError::Cancelled { worker_id, .. } => worker_id,
        }
    }
}

/// Router-wide failures that occur outside the per-request path (startup,
/// configuration, model changes).
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("no backend workers are reachable and OLLAMA_REQUIRED is set")]
    NoWorkersReachable,

    #[error("model change to '{model}' failed: no worker reported a usable TPS")]
    ModelChangeFailed { model: String },

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}
