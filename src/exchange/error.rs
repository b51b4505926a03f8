use serde::Deserialize;
use std::fmt;

/// Provider-independent error categories the engine reasons about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    RateLimited,
    AuthFailed,
    InvalidRequest,
    InsufficientFunds,
    OrderNotFound,
    PositionNotFound,
    OrderPlacementFailed,
    OrderCancelFailed,
    Timeout,
    ConnectionFailed,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::AuthFailed => "auth-failed",
            ErrorKind::InvalidRequest => "invalid-request",
            ErrorKind::InsufficientFunds => "insufficient-funds",
            ErrorKind::OrderNotFound => "order-not-found",
            ErrorKind::PositionNotFound => "position-not-found",
            ErrorKind::OrderPlacementFailed => "order-placement-failed",
            ErrorKind::OrderCancelFailed => "order-cancel-failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionFailed => "connection-failed",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical exchange error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct ExchangeError {
    pub kind: ErrorKind,
    pub operation: String,
    pub message: String,
    /// Provider code, kept for logs only
    pub code: Option<i64>,
}

impl ExchangeError {
    pub fn new(kind: ErrorKind, operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
            message: message.into(),
            code: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_order_not_found(&self) -> bool {
        self.kind == ErrorKind::OrderNotFound
    }
}

/// Error body returned by the exchange REST API
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Map an HTTP status and optional API error body to a canonical error.
///
/// `fallback` is the kind used when the code is unrecognized but the operation
/// semantics are known (e.g. order placement or cancellation).
pub fn map_api_error(
    operation: &str,
    http_status: Option<u16>,
    body: Option<&ApiErrorBody>,
    fallback: ErrorKind,
) -> ExchangeError {
    let kind = match (http_status, body.map(|b| b.code)) {
        (Some(429) | Some(418), _) => ErrorKind::RateLimited,
        (_, Some(code)) => kind_for_code(code).unwrap_or(fallback),
        (Some(401) | Some(403), None) => ErrorKind::AuthFailed,
        (Some(408) | Some(504), None) => ErrorKind::Timeout,
        (Some(status), None) if (400..500).contains(&status) => ErrorKind::InvalidRequest,
        _ => fallback,
    };

    let message = match (body, http_status) {
        (Some(b), _) => b.msg.clone(),
        (None, Some(status)) => format!("HTTP {}", status),
        (None, None) => "no response body".to_string(),
    };

    ExchangeError {
        kind,
        operation: operation.to_string(),
        message,
        code: body.map(|b| b.code),
    }
}

fn kind_for_code(code: i64) -> Option<ErrorKind> {
    let kind = match code {
        -1003 | -1015 => ErrorKind::RateLimited,
        -1022 | -2008 | -2014 | -2015 => ErrorKind::AuthFailed,
        -2018 | -2019 => ErrorKind::InsufficientFunds,
        -2011 | -2013 => ErrorKind::OrderNotFound,
        -1007 => ErrorKind::Timeout,
        -1001 => ErrorKind::ConnectionFailed,
        -1021 => ErrorKind::InvalidRequest,
        -1199..=-1100 => ErrorKind::InvalidRequest,
        -2010 | -2021 | -2022 | -4164 => ErrorKind::OrderPlacementFailed,
        _ => return None,
    };
    Some(kind)
}

/// Map a transport failure (deadline, reset, refused) through the same boundary
pub fn map_transport_error(operation: &str, err: &reqwest::Error) -> ExchangeError {
    let kind = if err.is_timeout() {
        ErrorKind::Timeout
    } else if err.is_connect() || err.is_request() {
        ErrorKind::ConnectionFailed
    } else if err.is_decode() || err.is_body() {
        ErrorKind::InvalidRequest
    } else if let Some(status) = err.status() {
        return map_api_error(operation, Some(status.as_u16()), None, ErrorKind::Unknown);
    } else {
        ErrorKind::Unknown
    };

    ExchangeError::new(kind, operation, err.to_string())
}

/// Map a websocket transport failure
pub fn map_ws_error(
    operation: &str,
    err: &tokio_tungstenite::tungstenite::Error,
) -> ExchangeError {
    use tokio_tungstenite::tungstenite::Error as WsError;

    let kind = match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Io(_) => {
            ErrorKind::ConnectionFailed
        }
        WsError::Url(_) => ErrorKind::ConnectionFailed,
        WsError::Http(response) => match response.status().as_u16() {
            429 | 418 => ErrorKind::RateLimited,
            401 | 403 => ErrorKind::AuthFailed,
            _ => ErrorKind::ConnectionFailed,
        },
        WsError::Protocol(_) | WsError::Utf8 => ErrorKind::InvalidRequest,
        _ => ErrorKind::Unknown,
    };

    ExchangeError::new(kind, operation, err.to_string())
}

/// Deadline exceeded on an operation we wrapped with `tokio::time::timeout`
pub fn deadline_exceeded(operation: &str) -> ExchangeError {
    ExchangeError::new(ErrorKind::Timeout, operation, "deadline exceeded")
}
