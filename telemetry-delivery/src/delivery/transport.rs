use async_trait::async_trait;
use telemetry_types::Endpoint;

use super::response::{HttpResponse, TransportError};

/// Moves bytes to and from the collector.
///
/// Implementations only report what happened on the wire; classification,
/// retries and rate limiting live in the delivery service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST an uncompressed payload to an endpoint.
    async fn post(&self, endpoint: Endpoint, payload: &[u8]) -> Result<HttpResponse, TransportError>;

    /// Conditional GET, sending `etag` as `If-None-Match` when present.
    async fn get(&self, endpoint: Endpoint, etag: Option<&str>) -> Result<HttpResponse, TransportError>;
}
