//! Delivery Service
//!
//! Sends payloads to the collector with at-least-once semantics:
//! - every payload is persisted in the retry queue before any network work
//! - sending is skipped while offline or while the endpoint is rate limited
//! - a queue entry is removed only when the collector accepts it or it is
//!   dropped for good (payload too large, rejected, stale)
//! - transient failures are retried with exponential backoff
//!
//! Attempts on one endpoint are serialized through endpoint lanes, and every
//! attempt re-reads its entry under the lane, so no entry is posted twice at
//! the same time.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::join_all;
use parking_lot::RwLock;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use telemetry_types::{Endpoint, SnapshotType, TelemetryEnvelope};
use tokio::sync::broadcast;

use super::lanes::EndpointLanes;
use super::rate_limit::RateLimitHandler;
use super::response::ApiResponse;
use super::retry_queue::RetryQueue;
use super::transport::Transport;
use super::types::{DeliveryEvent, DropReason, FetchOutcome, NetworkStatus, PendingDelivery, QueueReason, SendOutcome};
use super::worker::WorkerPool;
use crate::clock::Clock;
use crate::config::DeliveryConfig;
use crate::diagnostics::{DiagnosticKind, DiagnosticsSink};
use crate::storage::{PayloadStore, StoredTelemetryMetadata};

/// Buffered delivery events per subscriber before the oldest are dropped
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long a finalized envelope id is remembered to discard late snapshots
const FINALIZED_RETENTION_MS: i64 = 10 * 60 * 1000;

/// Accepts finished envelopes and snapshots from the session orchestrator.
///
/// Implementations must return quickly; network and file work happens in
/// the background.
pub trait EnvelopeDelivery: Send + Sync {
    fn send_envelope(&self, envelope: Arc<TelemetryEnvelope>, snapshot_type: SnapshotType);
}

/// Collaborators of the delivery service.
pub struct DeliveryParts {
    pub transport: Arc<dyn Transport>,
    pub queue: RetryQueue,
    /// Store for periodic and crash-time envelope snapshots
    pub snapshots: Arc<PayloadStore>,
    pub rate_limiter: RateLimitHandler,
    pub workers: WorkerPool,
    pub clock: Arc<dyn Clock>,
    pub diagnostics: Arc<dyn DiagnosticsSink>,
}

#[derive(Clone)]
pub struct DeliveryService {
    config: Arc<DeliveryConfig>,
    transport: Arc<dyn Transport>,
    queue: RetryQueue,
    snapshots: Arc<PayloadStore>,
    rate_limiter: RateLimitHandler,
    lanes: EndpointLanes,
    workers: WorkerPool,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    network: Arc<RwLock<NetworkStatus>>,
    events: broadcast::Sender<DeliveryEvent>,
    /// Envelope ids whose final form was handed over (id → time)
    finalized: Arc<DashMap<String, i64>>,
    /// Earliest scheduled replay per endpoint
    scheduled_replays: Arc<DashMap<Endpoint, i64>>,
}

impl DeliveryService {
    pub fn new(config: DeliveryConfig, parts: DeliveryParts) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            transport: parts.transport,
            queue: parts.queue,
            snapshots: parts.snapshots,
            rate_limiter: parts.rate_limiter,
            lanes: EndpointLanes::new(),
            workers: parts.workers,
            clock: parts.clock,
            diagnostics: parts.diagnostics,
            network: Arc::new(RwLock::new(NetworkStatus::Unknown)),
            events,
            finalized: Arc::new(DashMap::new()),
            scheduled_replays: Arc::new(DashMap::new()),
        }
    }

    /// Receive delivery events. Slow subscribers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    pub fn queue(&self) -> &RetryQueue {
        &self.queue
    }

    pub fn rate_limiter(&self) -> &RateLimitHandler {
        &self.rate_limiter
    }

    pub fn network_status(&self) -> NetworkStatus {
        *self.network.read()
    }

    fn is_offline(&self) -> bool {
        self.network_status() == NetworkStatus::NotReachable
    }

    fn emit(&self, event: DeliveryEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    /// Record a reachability change. Becoming reachable flushes the queue.
    pub fn on_network_status_changed(&self, status: NetworkStatus) {
        let previous = std::mem::replace(&mut *self.network.write(), status);
        if previous == status {
            return;
        }
        log::info!("[DELIVERY] Network status {} -> {}", previous, status);

        if status == NetworkStatus::Reachable {
            let service = self.clone();
            self.workers.spawn(async move {
                service.flush_queue_on_reconnect().await;
            });
        }
    }

    // =====================================================
    // Envelopes
    // =====================================================

    /// Handle an envelope from the orchestrator and wait for the outcome.
    ///
    /// Periodic snapshots only update the snapshot cache and return `None`.
    pub async fn deliver_envelope(
        &self,
        envelope: Arc<TelemetryEnvelope>,
        snapshot_type: SnapshotType,
    ) -> Option<SendOutcome> {
        if !snapshot_type.is_terminal() {
            self.cache_snapshot(envelope).await;
            return None;
        }

        self.mark_finalized(&envelope);
        let service = self.clone();
        let finished = envelope.clone();
        let persisted = self
            .workers
            .run_blocking(move || service.persist_final(&finished))
            .await;
        match persisted {
            Some((pending, durable)) => Some(self.send_final(envelope, pending, durable).await),
            None => Some(SendOutcome::Skipped),
        }
    }

    /// Put the final form of an envelope in the retry queue.
    ///
    /// The cached snapshot is deleted only once the queue entry is on disk.
    /// Otherwise the final form replaces the snapshot, so the next start can
    /// still resurrect it.
    fn persist_final(&self, envelope: &TelemetryEnvelope) -> (PendingDelivery, bool) {
        let (pending, durable) = self.enqueue(envelope.endpoint(), envelope.body.clone());
        if durable {
            self.delete_snapshot(envelope);
        } else {
            self.store_snapshot(envelope);
        }
        (pending, durable)
    }

    /// Send a finalized envelope. Without a durable queue entry its snapshot
    /// stays cached until the collector accepts or rejects the payload.
    async fn send_final(
        &self,
        envelope: Arc<TelemetryEnvelope>,
        pending: PendingDelivery,
        durable: bool,
    ) -> SendOutcome {
        let outcome = self.attempt(pending).await;
        if !durable && matches!(outcome, SendOutcome::Delivered | SendOutcome::Dropped(_)) {
            let service = self.clone();
            self.workers
                .run_blocking(move || service.delete_snapshot(&envelope))
                .await;
        }
        outcome
    }

    async fn cache_snapshot(&self, envelope: Arc<TelemetryEnvelope>) {
        if self.is_finalized(&envelope.id) {
            log::debug!("[DELIVERY] Discarding snapshot of finalized envelope {}", envelope.id);
            return;
        }
        let service = self.clone();
        self.workers
            .run_blocking(move || service.write_snapshot(&envelope))
            .await;
    }

    fn write_snapshot(&self, envelope: &TelemetryEnvelope) {
        // Finalization may have raced with this write
        if self.store_snapshot(envelope) && self.is_finalized(&envelope.id) {
            self.delete_snapshot(envelope);
        }
    }

    fn store_snapshot(&self, envelope: &TelemetryEnvelope) -> bool {
        let Some(metadata) = self.snapshot_metadata(envelope) else {
            return false;
        };
        self.snapshots
            .store(&metadata, |out| serde_json::to_writer(out, envelope).map_err(io::Error::from))
            .is_ok()
    }

    fn delete_snapshot(&self, envelope: &TelemetryEnvelope) {
        if let Some(metadata) = self.snapshot_metadata(envelope) {
            self.snapshots.delete(&metadata);
        }
    }

    fn snapshot_metadata(&self, envelope: &TelemetryEnvelope) -> Option<StoredTelemetryMetadata> {
        match StoredTelemetryMetadata::new(envelope.start_time_ms, envelope.id.clone(), envelope.kind) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                self.diagnostics.report(
                    DiagnosticKind::InvalidStorageKey,
                    &format!("Cannot cache envelope {}", envelope.id),
                    Some(&e),
                );
                None
            }
        }
    }

    fn mark_finalized(&self, envelope: &TelemetryEnvelope) {
        let now = self.clock.now_ms();
        self.finalized
            .retain(|_, finalized_at| now.saturating_sub(*finalized_at) < FINALIZED_RETENTION_MS);
        self.finalized.insert(envelope.id.clone(), now);
    }

    fn is_finalized(&self, envelope_id: &str) -> bool {
        self.finalized.contains_key(envelope_id)
    }

    /// Queue snapshots left behind by a previous process for delivery and
    /// delete the ones that made it to disk. Returns how many were queued;
    /// they are sent by the next flush.
    pub async fn resurrect_cached_snapshots(&self) -> usize {
        let service = self.clone();
        let queued = self
            .workers
            .run_blocking(move || service.requeue_cached_snapshots())
            .await
            .unwrap_or_default();
        if queued > 0 {
            log::info!("[DELIVERY] Queued {} snapshots from a previous run", queued);
        }
        queued
    }

    fn requeue_cached_snapshots(&self) -> usize {
        let mut queued = 0;
        for metadata in self.snapshots.stored() {
            if self.is_finalized(&metadata.uuid) {
                continue;
            }
            match self.snapshots.load_bytes(&metadata) {
                Ok(Some(bytes)) => match serde_json::from_slice::<TelemetryEnvelope>(&bytes) {
                    Ok(envelope) => {
                        let (_, durable) = self.enqueue(envelope.endpoint(), envelope.body);
                        queued += 1;
                        if !durable {
                            // keep the snapshot for the next start
                            continue;
                        }
                    }
                    Err(e) => self.diagnostics.report(
                        DiagnosticKind::PayloadResurrectionFail,
                        &format!("Undecodable snapshot {}", metadata.filename()),
                        Some(&e),
                    ),
                },
                Ok(None) => continue,
                Err(e) => self.diagnostics.report(
                    DiagnosticKind::PayloadResurrectionFail,
                    &format!("Unreadable snapshot {}", metadata.filename()),
                    Some(&e),
                ),
            }
            self.snapshots.delete(&metadata);
        }
        queued
    }

    // =====================================================
    // Sending
    // =====================================================

    /// Persist a payload in the retry queue, then try to send it.
    pub async fn send_and_queue(&self, endpoint: Endpoint, payload: Vec<u8>) -> SendOutcome {
        if endpoint.kind().is_none() {
            self.diagnostics.report(
                DiagnosticKind::DeliveryDataLoss,
                &format!("{} does not accept payloads", endpoint),
                None,
            );
            return SendOutcome::Dropped(DropReason::UnsupportedEndpoint);
        }

        let service = self.clone();
        let pending = self
            .workers
            .run_blocking(move || service.enqueue(endpoint, payload).0)
            .await;
        match pending {
            Some(pending) => self.attempt(pending).await,
            None => SendOutcome::Skipped,
        }
    }

    /// Queue a payload. The flag tells whether the entry reached disk.
    fn enqueue(&self, endpoint: Endpoint, payload: Vec<u8>) -> (PendingDelivery, bool) {
        let pending = PendingDelivery::new(endpoint, payload, self.clock.now_ms());
        match self.queue.save(&pending) {
            Ok(()) => (pending, true),
            Err(e) => {
                log::warn!("[DELIVERY] Sending {} without a durable copy: {}", pending.id, e);
                (pending, false)
            }
        }
    }

    fn suppressed(&self, pending: &PendingDelivery) -> Option<SendOutcome> {
        let endpoint = pending.endpoint;
        let reason = if self.is_offline() {
            QueueReason::Offline
        } else if let Some(until) = self.rate_limiter.limited_until_ms(endpoint) {
            self.schedule_replay(endpoint, until);
            QueueReason::RateLimited
        } else {
            return None;
        };

        log::debug!("[DELIVERY] Holding {} for {}: {}", pending.id, endpoint, reason);
        self.emit(DeliveryEvent::Queued {
            endpoint,
            id: pending.id.clone(),
            reason,
        });
        Some(SendOutcome::Queued(reason))
    }

    async fn attempt(&self, pending: PendingDelivery) -> SendOutcome {
        if let Some(outcome) = self.suppressed(&pending) {
            return outcome;
        }

        let endpoint = pending.endpoint;
        let _lane = self.lanes.acquire(endpoint).await;

        // Another attempt may have finished with this entry while we waited
        let Some(current) = self.queue.get(endpoint, &pending.id) else {
            return SendOutcome::Skipped;
        };
        if let Some(outcome) = self.suppressed(&current) {
            return outcome;
        }

        let response = ApiResponse::classify(self.transport.post(endpoint, &current.payload).await);
        self.handle_send_response(current, response).await
    }

    async fn handle_send_response(&self, delivery: PendingDelivery, response: ApiResponse) -> SendOutcome {
        let endpoint = delivery.endpoint;
        match response {
            ApiResponse::Success { .. } => {
                self.rate_limiter.clear(endpoint);
                let id = delivery.id.clone();
                self.remove(delivery).await;
                log::debug!("[DELIVERY] Delivered {} to {}", id, endpoint);
                self.emit(DeliveryEvent::Delivered { endpoint, id });
                SendOutcome::Delivered
            }
            ApiResponse::TooManyRequests { retry_after_secs } => {
                let until = self.rate_limiter.on_too_many_requests(endpoint, retry_after_secs);
                self.emit(DeliveryEvent::RateLimited { endpoint, until_ms: until });
                self.schedule_replay(endpoint, until);
                self.emit(DeliveryEvent::Queued {
                    endpoint,
                    id: delivery.id,
                    reason: QueueReason::RateLimited,
                });
                SendOutcome::Queued(QueueReason::RateLimited)
            }
            ApiResponse::PayloadTooLarge => self.drop_delivery(delivery, DropReason::PayloadTooLarge).await,
            ApiResponse::Failure { status } if (400..500).contains(&status) => {
                self.drop_delivery(delivery, DropReason::Rejected(status)).await
            }
            failed @ (ApiResponse::NotModified | ApiResponse::Failure { .. } | ApiResponse::Incomplete(_)) => {
                self.retry_later(delivery, &failed).await
            }
        }
    }

    async fn retry_later(&self, delivery: PendingDelivery, failure: &ApiResponse) -> SendOutcome {
        let endpoint = delivery.endpoint;
        let now = self.clock.now_ms();

        let service = self.clone();
        let failed = delivery.clone();
        let updated = self
            .workers
            .run_blocking(move || service.queue.record_failure(&failed, now))
            .await
            .unwrap_or(delivery);

        if updated.retry_count >= self.config.max_retry_count {
            return self.drop_delivery(updated, DropReason::Stale).await;
        }

        let delay_ms = self.config.retry_delay_ms(updated.retry_count);
        log::warn!(
            "[DELIVERY] {} to {} failed ({:?}), retry #{} in {}ms",
            updated.id,
            endpoint,
            failure,
            updated.retry_count,
            delay_ms
        );
        self.schedule_replay(endpoint, now.saturating_add(delay_ms as i64));
        self.emit(DeliveryEvent::Queued {
            endpoint,
            id: updated.id,
            reason: QueueReason::RetryScheduled,
        });
        SendOutcome::Queued(QueueReason::RetryScheduled)
    }

    async fn drop_delivery(&self, delivery: PendingDelivery, reason: DropReason) -> SendOutcome {
        let endpoint = delivery.endpoint;
        let id = delivery.id.clone();
        let diagnostic = match reason {
            DropReason::Stale => DiagnosticKind::StaleDeliveryDropped,
            _ => DiagnosticKind::DeliveryDataLoss,
        };
        self.diagnostics.report(
            diagnostic,
            &format!("Dropped delivery {} to {}: {}", id, endpoint, reason),
            None,
        );

        self.remove(delivery).await;
        self.emit(DeliveryEvent::Dropped { endpoint, id, reason });
        SendOutcome::Dropped(reason)
    }

    async fn remove(&self, delivery: PendingDelivery) {
        let queue = self.queue.clone();
        self.workers.run_blocking(move || queue.remove(&delivery)).await;
    }

    /// Make sure the endpoint is replayed at `at_ms`. An earlier pending
    /// replay covers a later one.
    fn schedule_replay(&self, endpoint: Endpoint, at_ms: i64) {
        match self.scheduled_replays.entry(endpoint) {
            Entry::Occupied(mut scheduled) => {
                if *scheduled.get() <= at_ms {
                    return;
                }
                scheduled.insert(at_ms);
            }
            Entry::Vacant(slot) => {
                slot.insert(at_ms);
            }
        }

        let delay_ms = at_ms.saturating_sub(self.clock.now_ms()).max(0) as u64;
        let service = self.clone();
        self.workers.spawn_after(Duration::from_millis(delay_ms), async move {
            service
                .scheduled_replays
                .remove_if(&endpoint, |_, scheduled| *scheduled == at_ms);
            service.replay_endpoint(endpoint).await;
        });
    }

    // =====================================================
    // Replay
    // =====================================================

    /// Replay one endpoint oldest-first until something stops it.
    async fn replay_endpoint(&self, endpoint: Endpoint) -> usize {
        let mut delivered = 0;
        for pending in self.queue.pending(endpoint) {
            if pending.is_stale(self.clock.now_ms(), &self.config) {
                self.drop_delivery(pending, DropReason::Stale).await;
                continue;
            }
            match self.attempt(pending).await {
                SendOutcome::Delivered => delivered += 1,
                SendOutcome::Dropped(_) | SendOutcome::Skipped => {}
                SendOutcome::Queued(_) => break,
            }
        }
        delivered
    }

    /// Replay every endpoint with pending entries. Endpoints run
    /// concurrently; returns how many entries were delivered.
    pub async fn flush_queue_on_reconnect(&self) -> usize {
        if self.is_offline() {
            return 0;
        }
        let endpoints = self.queue.endpoints_with_pending();
        if endpoints.is_empty() {
            return 0;
        }
        log::info!("[DELIVERY] Flushing {} pending deliveries", self.queue.len());

        let delivered: usize = join_all(endpoints.into_iter().map(|endpoint| self.replay_endpoint(endpoint)))
            .await
            .into_iter()
            .sum();
        log::info!("[DELIVERY] Flush delivered {} entries", delivered);
        delivered
    }

    // =====================================================
    // Fetching
    // =====================================================

    /// Conditional GET that honours offline state and rate limits.
    pub async fn fetch(&self, endpoint: Endpoint, etag: Option<&str>) -> FetchOutcome {
        if self.is_offline() {
            return FetchOutcome::Offline;
        }
        if self.rate_limiter.is_rate_limited(endpoint) {
            return FetchOutcome::RateLimited;
        }

        match ApiResponse::classify(self.transport.get(endpoint, etag).await) {
            ApiResponse::Success { body, etag } => {
                self.rate_limiter.clear(endpoint);
                FetchOutcome::Fetched { body, etag }
            }
            ApiResponse::NotModified => {
                self.rate_limiter.clear(endpoint);
                FetchOutcome::NotModified
            }
            ApiResponse::TooManyRequests { retry_after_secs } => {
                let until = self.rate_limiter.on_too_many_requests(endpoint, retry_after_secs);
                self.emit(DeliveryEvent::RateLimited { endpoint, until_ms: until });
                FetchOutcome::RateLimited
            }
            ApiResponse::PayloadTooLarge => FetchOutcome::Failed("HTTP 413".to_string()),
            ApiResponse::Failure { status } => FetchOutcome::Failed(format!("HTTP {}", status)),
            ApiResponse::Incomplete(e) => FetchOutcome::Failed(e.to_string()),
        }
    }
}

impl EnvelopeDelivery for DeliveryService {
    fn send_envelope(&self, envelope: Arc<TelemetryEnvelope>, snapshot_type: SnapshotType) {
        if snapshot_type == SnapshotType::JvmCrash {
            // The process is going down: persist on the calling thread
            self.mark_finalized(&envelope);
            let (pending, durable) = self.persist_final(&envelope);
            let service = self.clone();
            self.workers.spawn(async move {
                service.send_final(envelope, pending, durable).await;
            });
            return;
        }

        let service = self.clone();
        self.workers.spawn(async move {
            service.deliver_envelope(envelope, snapshot_type).await;
        });
    }
}
