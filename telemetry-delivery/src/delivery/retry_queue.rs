//! Durable queue of deliveries the collector has not yet accepted.
//!
//! Every entry is written to the pending payload store before it is visible
//! in memory, so a process that dies mid-send leaves it on disk for the next
//! start to reload. The in-memory index is one oldest-first deque per
//! endpoint.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::Arc;
use telemetry_types::Endpoint;

use super::types::PendingDelivery;
use crate::diagnostics::{DiagnosticKind, DiagnosticsSink};
use crate::storage::{PayloadStore, PayloadStoreError, StoredTelemetryMetadata};

/// What reloading one stored entry found.
enum StoredEntry {
    Loaded(PendingDelivery),
    /// Deleted since it was listed
    Missing,
    /// Not a pending delivery; it would fail the same way on every reload
    Corrupt,
}

#[derive(Clone)]
pub struct RetryQueue {
    store: Arc<PayloadStore>,
    entries: Arc<DashMap<Endpoint, VecDeque<PendingDelivery>>>,
    diagnostics: Arc<dyn DiagnosticsSink>,
}

impl RetryQueue {
    pub fn new(store: Arc<PayloadStore>, diagnostics: Arc<dyn DiagnosticsSink>) -> Self {
        Self {
            store,
            entries: Arc::new(DashMap::new()),
            diagnostics,
        }
    }

    /// Reload entries persisted by a previous process. Entries already in
    /// memory are kept. Returns how many entries were loaded.
    pub fn load_from_disk(&self) -> usize {
        let mut loaded = 0;
        for metadata in self.store.stored() {
            match self.read_entry(&metadata) {
                Ok(StoredEntry::Loaded(delivery)) => {
                    if !self.contains(delivery.endpoint, &delivery.id) {
                        self.insert_in_memory(delivery);
                        loaded += 1;
                    }
                }
                Ok(StoredEntry::Missing) => {}
                Ok(StoredEntry::Corrupt) => self.store.delete(&metadata),
                Err(e) => {
                    log::warn!(
                        "[RETRY_QUEUE] Keeping {} for the next reload: {}",
                        metadata.filename(),
                        e
                    );
                }
            }
        }
        if loaded > 0 {
            log::info!("[RETRY_QUEUE] Reloaded {} pending deliveries from disk", loaded);
        }
        loaded
    }

    /// Read one stored entry. I/O failures are returned so the entry is
    /// kept; only content that cannot be decoded counts as corrupt.
    fn read_entry(&self, metadata: &StoredTelemetryMetadata) -> Result<StoredEntry, PayloadStoreError> {
        let Some(mut reader) = self.store.load(metadata)? else {
            return Ok(StoredEntry::Missing);
        };
        let mut json = Vec::new();
        if let Err(e) = reader.read_to_end(&mut json) {
            let corrupt = matches!(
                e.kind(),
                io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof
            );
            let message = if corrupt {
                format!("Corrupt pending delivery {}", metadata.filename())
            } else {
                format!("Failed to read pending delivery {}", metadata.filename())
            };
            self.diagnostics
                .report(DiagnosticKind::PayloadLoadFail, &message, Some(&e));
            return if corrupt {
                Ok(StoredEntry::Corrupt)
            } else {
                Err(PayloadStoreError::io("read pending delivery", e))
            };
        }
        match serde_json::from_slice::<PendingDelivery>(&json) {
            Ok(delivery) => Ok(StoredEntry::Loaded(delivery)),
            Err(e) => {
                self.diagnostics.report(
                    DiagnosticKind::PayloadLoadFail,
                    &format!("Undecodable pending delivery {}", metadata.filename()),
                    Some(&e),
                );
                Ok(StoredEntry::Corrupt)
            }
        }
    }

    /// Persist a delivery and index it in memory.
    ///
    /// The entry is indexed even when persisting fails, so the current
    /// process still attempts it. Entries evicted by the store quota are
    /// dropped from memory too.
    pub fn save(&self, delivery: &PendingDelivery) -> Result<(), PayloadStoreError> {
        let result = match delivery.metadata() {
            Some(metadata) => self
                .store
                .store(&metadata, |out| serde_json::to_writer(out, delivery).map_err(std::io::Error::from)),
            None => Ok(Vec::new()),
        };

        self.insert_in_memory(delivery.clone());

        match result {
            Ok(pruned) => {
                for metadata in pruned {
                    self.forget(metadata.kind.endpoint(), &metadata.uuid);
                }
                Ok(())
            }
            Err(e) => {
                log::error!("[RETRY_QUEUE] Failed to persist delivery {}: {}", delivery.id, e);
                Err(e)
            }
        }
    }

    /// Remove a delivery from disk and memory.
    pub fn remove(&self, delivery: &PendingDelivery) {
        if let Some(metadata) = delivery.metadata() {
            self.store.delete(&metadata);
        }
        self.forget(delivery.endpoint, &delivery.id);
    }

    /// Count a failed attempt and persist the new count.
    pub fn record_failure(&self, delivery: &PendingDelivery, now_ms: i64) -> PendingDelivery {
        let mut updated = delivery.clone();
        updated.retry_count = updated.retry_count.saturating_add(1);
        updated.last_attempt_ms = Some(now_ms);
        let _ = self.save(&updated);
        updated
    }

    pub fn contains(&self, endpoint: Endpoint, id: &str) -> bool {
        self.get(endpoint, id).is_some()
    }

    pub fn get(&self, endpoint: Endpoint, id: &str) -> Option<PendingDelivery> {
        self.entries
            .get(&endpoint)
            .and_then(|queue| queue.iter().find(|d| d.id == id).cloned())
    }

    /// Snapshot of one endpoint's entries, oldest first.
    pub fn pending(&self, endpoint: Endpoint) -> Vec<PendingDelivery> {
        self.entries
            .get(&endpoint)
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn endpoints_with_pending(&self) -> Vec<Endpoint> {
        let mut endpoints: Vec<Endpoint> = self
            .entries
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect();
        endpoints.sort();
        endpoints
    }

    pub fn len(&self) -> usize {
        self.entries.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_in_memory(&self, delivery: PendingDelivery) {
        let mut queue = self.entries.entry(delivery.endpoint).or_default();
        if let Some(existing) = queue.iter_mut().find(|d| d.id == delivery.id) {
            *existing = delivery;
            return;
        }
        let position = queue
            .iter()
            .position(|d| d.queue_order() > delivery.queue_order())
            .unwrap_or(queue.len());
        queue.insert(position, delivery);
    }

    fn forget(&self, endpoint: Endpoint, id: &str) {
        if let Some(mut queue) = self.entries.get_mut(&endpoint) {
            queue.retain(|d| d.id != id);
        }
    }
}
