//! On-disk payload storage shared by the retry queue and the snapshot cache.

pub mod metadata;
pub mod payload_store;

pub use metadata::{KeyError, StoredTelemetryMetadata};
pub use payload_store::{PayloadReader, PayloadStore, PayloadStoreError};
