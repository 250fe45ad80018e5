//! Telemetry delivery core.
//!
//! Decides when session and background-activity envelopes end, keeps
//! outbound payloads in a bounded on-disk store, and delivers them to the
//! collector with retries, rate limiting and offline queueing.

pub mod clock;
pub mod config;
pub mod delivery;
pub mod diagnostics;
pub mod runtime;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;

pub use clock::{Clock, SystemClock};
pub use config::DeliveryConfig;
pub use delivery::{DeliveryEvent, DeliveryService, EnvelopeDelivery, NetworkStatus, SendOutcome, Transport};
pub use diagnostics::{DiagnosticKind, DiagnosticsSink, LogDiagnostics};
pub use runtime::{CoreCollaborators, CoreError, TelemetryCore};
pub use session::{BoundaryDelegate, EnvelopeBuilder, SessionOrchestrator, SessionProperties, TransitionOutcome};
pub use storage::{PayloadStore, StoredTelemetryMetadata};
pub use telemetry_types::{Endpoint, ProcessState, SnapshotType, TelemetryEnvelope, TelemetryKind};
