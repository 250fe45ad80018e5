//! Session lifecycle: deciding when envelopes start and end.

pub mod boundary;
pub mod builder;
pub mod cacher;
pub mod orchestrator;

pub use boundary::{BoundaryDelegate, BoundaryError, SessionProperties};
pub use builder::{BuildError, EndReason, EnvelopeBuilder, FinalEnvelopeParams, InitialEnvelopeParams};
pub use cacher::PeriodicCacher;
pub use orchestrator::{OrchestratorParts, SessionOrchestrator, TransitionOutcome};
