//! Raw transport results and their classification.

use std::collections::HashMap;

/// A response as seen by the delivery layer. Header names are lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// The request never produced a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Connection(String),
    /// Base URL could not be parsed or joined with an endpoint path
    InvalidUrl(String),
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Connection(msg) => write!(f, "connection failed: {}", msg),
            TransportError::InvalidUrl(msg) => write!(f, "invalid url: {}", msg),
            TransportError::Other(msg) => write!(f, "transport error: {}", msg),
        }
    }
}

impl std::error::Error for TransportError {}

/// Classified result of a collector request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiResponse {
    /// 2xx
    Success { body: Vec<u8>, etag: Option<String> },
    /// 304
    NotModified,
    /// 413
    PayloadTooLarge,
    /// 429, with the Retry-After header in seconds when present and numeric
    TooManyRequests { retry_after_secs: Option<u64> },
    /// Any other status
    Failure { status: u16 },
    /// No response was received
    Incomplete(TransportError),
}

impl ApiResponse {
    pub fn classify(result: Result<HttpResponse, TransportError>) -> Self {
        let response = match result {
            Ok(response) => response,
            Err(e) => return ApiResponse::Incomplete(e),
        };

        match response.status {
            200..=299 => ApiResponse::Success {
                etag: response.header("etag").map(str::to_string),
                body: response.body,
            },
            304 => ApiResponse::NotModified,
            413 => ApiResponse::PayloadTooLarge,
            429 => ApiResponse::TooManyRequests {
                retry_after_secs: response
                    .header("retry-after")
                    .and_then(|v| v.trim().parse::<u64>().ok()),
            },
            status => ApiResponse::Failure { status },
        }
    }
}
