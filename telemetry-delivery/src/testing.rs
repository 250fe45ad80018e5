//! Fakes shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use telemetry_types::{Endpoint, ProcessState, SnapshotType, TelemetryEnvelope, TelemetryKind};

use crate::clock::Clock;
use crate::delivery::response::{HttpResponse, TransportError};
use crate::delivery::service::EnvelopeDelivery;
use crate::delivery::transport::Transport;
use crate::diagnostics::{DiagnosticKind, DiagnosticsSink};
use crate::session::builder::{BuildError, EndReason, EnvelopeBuilder, FinalEnvelopeParams, InitialEnvelopeParams};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// An envelope whose body is its id.
pub fn envelope(id: &str, kind: TelemetryKind, process_state: ProcessState, start_time_ms: i64) -> TelemetryEnvelope {
    TelemetryEnvelope {
        id: id.to_string(),
        kind,
        start_time_ms,
        end_time_ms: None,
        process_state,
        body: id.as_bytes().to_vec(),
    }
}

// =====================================================
// Clock
// =====================================================

pub struct FakeClock {
    now_ms: AtomicI64,
}

impl FakeClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

// =====================================================
// Diagnostics
// =====================================================

#[derive(Debug, Clone)]
pub struct Report {
    pub kind: DiagnosticKind,
    pub message: String,
    pub cause: Option<String>,
}

#[derive(Default)]
pub struct RecordingDiagnostics {
    reports: Mutex<Vec<Report>>,
}

impl RecordingDiagnostics {
    pub fn reports(&self) -> Vec<Report> {
        self.reports.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    pub fn count_of(&self, kind: DiagnosticKind) -> usize {
        self.reports.lock().iter().filter(|r| r.kind == kind).count()
    }
}

impl DiagnosticsSink for RecordingDiagnostics {
    fn report(&self, kind: DiagnosticKind, message: &str, cause: Option<&(dyn Error + 'static)>) {
        self.reports.lock().push(Report {
            kind,
            message: message.to_string(),
            cause: cause.map(|c| c.to_string()),
        });
    }
}

// =====================================================
// Transport
// =====================================================

/// Replays queued responses in order, answering 200 once the script runs out.
#[derive(Default)]
pub struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    posts: Mutex<Vec<(Endpoint, Vec<u8>)>>,
    gets: Mutex<Vec<(Endpoint, Option<String>)>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, response: Result<HttpResponse, TransportError>) {
        self.responses.lock().push_back(response);
    }

    pub fn posts(&self) -> Vec<(Endpoint, Vec<u8>)> {
        self.posts.lock().clone()
    }

    pub fn post_count(&self) -> usize {
        self.posts.lock().len()
    }

    pub fn gets(&self) -> Vec<(Endpoint, Option<String>)> {
        self.gets.lock().clone()
    }

    fn next_response(&self) -> Result<HttpResponse, TransportError> {
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(HttpResponse::new(200)))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn post(&self, endpoint: Endpoint, payload: &[u8]) -> Result<HttpResponse, TransportError> {
        self.posts.lock().push((endpoint, payload.to_vec()));
        self.next_response()
    }

    async fn get(&self, endpoint: Endpoint, etag: Option<&str>) -> Result<HttpResponse, TransportError> {
        self.gets.lock().push((endpoint, etag.map(str::to_string)));
        self.next_response()
    }
}

// =====================================================
// Session collaborators
// =====================================================

/// How the fake builder should misbehave on its next calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BuilderFault {
    #[default]
    None,
    FailInitial,
    FailFinal,
    PanicInitial,
}

/// Builds envelopes with ids like `session-1` / `background-2`. Final and
/// snapshot envelopes keep the active envelope's id.
#[derive(Default)]
pub struct FakeEnvelopeBuilder {
    fault: Mutex<BuilderFault>,
    initial_calls: Mutex<Vec<InitialEnvelopeParams>>,
    final_calls: Mutex<Vec<(String, EndReason)>>,
}

impl FakeEnvelopeBuilder {
    pub fn set_fault(&self, fault: BuilderFault) {
        *self.fault.lock() = fault;
    }

    pub fn initial_calls(&self) -> Vec<InitialEnvelopeParams> {
        self.initial_calls.lock().clone()
    }

    pub fn final_calls(&self) -> Vec<(String, EndReason)> {
        self.final_calls.lock().clone()
    }
}

impl EnvelopeBuilder for FakeEnvelopeBuilder {
    fn build_initial(&self, params: &InitialEnvelopeParams) -> Result<TelemetryEnvelope, BuildError> {
        match *self.fault.lock() {
            BuilderFault::FailInitial => return Err(BuildError::new("initial envelope unavailable")),
            BuilderFault::PanicInitial => panic!("builder exploded"),
            _ => {}
        }
        self.initial_calls.lock().push(params.clone());

        let prefix = match params.process_state {
            ProcessState::Foreground => "session",
            ProcessState::Background => "background",
        };
        Ok(envelope(
            &format!("{}-{}", prefix, params.sequence_number),
            TelemetryKind::Session,
            params.process_state,
            params.start_time_ms,
        ))
    }

    fn build_final(&self, params: &FinalEnvelopeParams) -> Result<TelemetryEnvelope, BuildError> {
        if *self.fault.lock() == BuilderFault::FailFinal {
            return Err(BuildError::new("final envelope unavailable"));
        }
        self.final_calls
            .lock()
            .push((params.envelope.id.clone(), params.end_reason.clone()));

        let mut finished = (*params.envelope).clone();
        finished.end_time_ms = Some(params.end_time_ms);
        Ok(finished)
    }
}

/// Records what the orchestrator hands to delivery.
#[derive(Default)]
pub struct RecordingDelivery {
    sent: Mutex<Vec<(Arc<TelemetryEnvelope>, SnapshotType)>>,
}

impl RecordingDelivery {
    pub fn sent(&self) -> Vec<(Arc<TelemetryEnvelope>, SnapshotType)> {
        self.sent.lock().clone()
    }

    pub fn sent_ids(&self) -> Vec<(String, SnapshotType)> {
        self.sent
            .lock()
            .iter()
            .map(|(envelope, snapshot_type)| (envelope.id.clone(), *snapshot_type))
            .collect()
    }
}

impl EnvelopeDelivery for RecordingDelivery {
    fn send_envelope(&self, envelope: Arc<TelemetryEnvelope>, snapshot_type: SnapshotType) {
        self.sent.lock().push((envelope, snapshot_type));
    }
}
