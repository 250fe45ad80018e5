//! Shared types for the telemetry delivery core and the SDK components that feed it.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

// =====================================================
// Telemetry Kinds
// =====================================================

/// The kind of a telemetry unit.
///
/// Declaration order is the storage priority order: when the payload store
/// exceeds its budget, kinds declared earlier survive pruning first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum TelemetryKind {
    Crash,
    Session,
    Log,
    Network,
}

impl TelemetryKind {
    /// The endpoint that accepts this kind of telemetry.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            TelemetryKind::Crash => Endpoint::Crashes,
            TelemetryKind::Session => Endpoint::Sessions,
            TelemetryKind::Log => Endpoint::Logs,
            TelemetryKind::Network => Endpoint::Network,
        }
    }
}

/// Whether the host process was in the foreground or background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum ProcessState {
    Foreground,
    Background,
}

/// Why an envelope is being persisted or sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SnapshotType {
    /// Clean termination of a session or background activity
    NormalEnd,
    /// Flush while the process is crashing
    JvmCrash,
    /// Mid-life checkpoint that overwrites the previous one
    PeriodicCache,
}

impl SnapshotType {
    /// Terminal snapshots are sent; periodic ones are only cached.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SnapshotType::PeriodicCache)
    }
}

// =====================================================
// Endpoints
// =====================================================

/// Remote collector endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "lowercase")]
pub enum Endpoint {
    Sessions,
    Logs,
    Crashes,
    Network,
    /// Fetch-only endpoint for remote configuration
    Config,
}

impl Endpoint {
    /// URL path relative to the collector base URL.
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Sessions => "v2/sessions",
            Endpoint::Logs => "v2/logs",
            Endpoint::Crashes => "v2/crashes",
            Endpoint::Network => "v2/network",
            Endpoint::Config => "v2/config",
        }
    }

    /// The telemetry kind stored for deliveries to this endpoint.
    pub fn kind(&self) -> Option<TelemetryKind> {
        match self {
            Endpoint::Sessions => Some(TelemetryKind::Session),
            Endpoint::Logs => Some(TelemetryKind::Log),
            Endpoint::Crashes => Some(TelemetryKind::Crash),
            Endpoint::Network => Some(TelemetryKind::Network),
            Endpoint::Config => None,
        }
    }
}

// =====================================================
// Envelopes
// =====================================================

/// An immutable, fully built unit of telemetry.
///
/// Envelopes are created by an envelope builder at transition time and then
/// shared as `Arc<TelemetryEnvelope>`; nothing mutates them afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    /// Unique identifier (session id, background activity id, or batch id)
    pub id: String,
    pub kind: TelemetryKind,
    pub start_time_ms: i64,
    /// Absent while the envelope is still the active one
    pub end_time_ms: Option<i64>,
    pub process_state: ProcessState,
    /// Opaque serialized body, produced by the builder
    pub body: Vec<u8>,
}

impl TelemetryEnvelope {
    pub fn endpoint(&self) -> Endpoint {
        self.kind.endpoint()
    }

    pub fn is_background(&self) -> bool {
        self.process_state == ProcessState::Background
    }
}
