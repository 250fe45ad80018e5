use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use strum::Display;
use telemetry_types::Endpoint;
use uuid::Uuid;

use crate::config::DeliveryConfig;
use crate::storage::StoredTelemetryMetadata;

/// Orders deliveries created within the same millisecond
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A payload waiting to be accepted by the collector.
///
/// Persisted as JSON (payload base64-encoded) before any send attempt, and
/// removed only once the collector accepts it or it is dropped for good.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingDelivery {
    pub id: String,
    pub endpoint: Endpoint,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub created_at_ms: i64,
    #[serde(default)]
    pub sequence: u64,
    pub retry_count: u32,
    pub last_attempt_ms: Option<i64>,
}

impl PendingDelivery {
    pub fn new(endpoint: Endpoint, payload: Vec<u8>, now_ms: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            endpoint,
            payload,
            created_at_ms: now_ms,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            retry_count: 0,
            last_attempt_ms: None,
        }
    }

    /// Storage key for this delivery. `None` for fetch-only endpoints.
    pub fn metadata(&self) -> Option<StoredTelemetryMetadata> {
        let kind = self.endpoint.kind()?;
        StoredTelemetryMetadata::new(self.created_at_ms, self.id.clone(), kind).ok()
    }

    /// Position in the retry queue: creation time, then creation order.
    pub fn queue_order(&self) -> (i64, u64) {
        (self.created_at_ms, self.sequence)
    }

    /// Too old or retried too often to be worth sending.
    pub fn is_stale(&self, now_ms: i64, config: &DeliveryConfig) -> bool {
        now_ms.saturating_sub(self.created_at_ms) > config.max_pending_age_ms
            || self.retry_count >= config.max_retry_count
    }
}

mod payload_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Last known network reachability. Only `NotReachable` suppresses sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NetworkStatus {
    Unknown,
    Reachable,
    NotReachable,
}

/// Why a delivery stayed in the retry queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum QueueReason {
    Offline,
    RateLimited,
    RetryScheduled,
}

/// Why a delivery was discarded without being accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DropReason {
    PayloadTooLarge,
    /// Collector rejected the request with this client error status
    Rejected(u16),
    /// Exceeded the age or retry ceiling
    Stale,
    /// Fetch-only endpoints do not accept payloads
    UnsupportedEndpoint,
}

/// Result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Queued(QueueReason),
    Dropped(DropReason),
    /// The entry was already delivered or removed by another attempt
    Skipped,
}

/// Result of a conditional fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched { body: Vec<u8>, etag: Option<String> },
    NotModified,
    RateLimited,
    Offline,
    Failed(String),
}

/// Notification published on the delivery event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    Delivered { endpoint: Endpoint, id: String },
    Queued { endpoint: Endpoint, id: String, reason: QueueReason },
    Dropped { endpoint: Endpoint, id: String, reason: DropReason },
    RateLimited { endpoint: Endpoint, until_ms: i64 },
}
