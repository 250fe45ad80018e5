use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::Client;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, IF_NONE_MATCH};
use std::io::Write;
use std::time::Duration;
use telemetry_types::Endpoint;
use url::Url;

use super::response::{HttpResponse, TransportError};
use super::transport::Transport;

/// reqwest-backed transport. Request bodies are gzip-compressed.
///
/// `Client::clone()` is an `Arc` increment, so cloning the transport shares
/// the connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .pool_max_idle_per_host(5)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Other(format!("failed to create HTTP client: {}", e)))?;
        Self::with_client(client, base_url)
    }

    /// Use an existing client, e.g. one configured with a proxy.
    pub fn with_client(client: Client, base_url: &str) -> Result<Self, TransportError> {
        // Url::join replaces the last segment unless the base ends in '/'
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let base_url = Url::parse(&normalized).map_err(|e| TransportError::InvalidUrl(format!("{}: {}", base_url, e)))?;
        Ok(Self { client, base_url })
    }

    pub fn url_for(&self, endpoint: Endpoint) -> Result<Url, TransportError> {
        self.base_url
            .join(endpoint.path())
            .map_err(|e| TransportError::InvalidUrl(format!("{}: {}", endpoint.path(), e)))
    }

    async fn read_response(response: reqwest::Response) -> Result<HttpResponse, TransportError> {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await.map_err(map_reqwest_error)?.to_vec();
        Ok(HttpResponse { status, headers, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, endpoint: Endpoint, payload: &[u8]) -> Result<HttpResponse, TransportError> {
        let url = self.url_for(endpoint)?;
        let body = gzip(payload).map_err(|e| TransportError::Other(format!("failed to compress body: {}", e)))?;

        log::debug!("[HTTP] POST {} ({} bytes, {} compressed)", url, payload.len(), body.len());

        let response = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(CONTENT_ENCODING, "gzip")
            .body(body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        Self::read_response(response).await
    }

    async fn get(&self, endpoint: Endpoint, etag: Option<&str>) -> Result<HttpResponse, TransportError> {
        let url = self.url_for(endpoint)?;
        log::debug!("[HTTP] GET {}", url);

        let mut request = self.client.get(url);
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send().await.map_err(map_reqwest_error)?;

        Self::read_response(response).await
    }
}

fn gzip(payload: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    encoder.finish()
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() {
        TransportError::Connection(e.to_string())
    } else {
        TransportError::Other(e.to_string())
    }
}
