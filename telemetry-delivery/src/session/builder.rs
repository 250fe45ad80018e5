use std::sync::Arc;
use telemetry_types::{ProcessState, TelemetryEnvelope};

/// Inputs for starting a new session or background activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialEnvelopeParams {
    pub start_time_ms: i64,
    pub process_state: ProcessState,
    /// First foreground session of the process
    pub cold_start: bool,
    /// 1-based count of envelopes of this process state in this process
    pub sequence_number: u32,
}

/// Why an envelope is being closed or snapshotted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Foreground/background transition
    StateChange,
    /// Ended by the host application
    Manual,
    Crash { crash_id: String },
    /// Mid-life snapshot; the envelope stays active
    PeriodicSnapshot,
}

/// Inputs for building the final (or snapshot) form of the active envelope.
#[derive(Debug, Clone)]
pub struct FinalEnvelopeParams {
    pub envelope: Arc<TelemetryEnvelope>,
    pub end_time_ms: i64,
    pub end_reason: EndReason,
}

/// The envelope builder could not produce an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildError {
    pub message: String,
}

impl BuildError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "envelope build failed: {}", self.message)
    }
}

impl std::error::Error for BuildError {}

/// Produces envelopes from captured data. Owned by the SDK layer that
/// collects telemetry; the orchestrator only decides when to call it.
pub trait EnvelopeBuilder: Send + Sync {
    fn build_initial(&self, params: &InitialEnvelopeParams) -> Result<TelemetryEnvelope, BuildError>;

    fn build_final(&self, params: &FinalEnvelopeParams) -> Result<TelemetryEnvelope, BuildError>;
}
