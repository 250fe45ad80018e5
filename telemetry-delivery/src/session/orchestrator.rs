//! Session Orchestrator
//!
//! Reacts to lifecycle signals (foreground, background, manual end, crash)
//! and makes sure each transition ends the active envelope and starts the
//! next one exactly once.
//!
//! A transition runs in four steps under the transition mutex:
//! 1. build the final form of the active envelope
//! 2. reset envelope-scoped state through the boundary delegate
//! 3. build the next envelope, if the target state has one
//! 4. commit the new process state and active envelope
//!
//! A failure in steps 1-3 leaves the committed state as it was. The final
//! envelope is handed to delivery after the mutex is released.

use parking_lot::Mutex;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use telemetry_types::{ProcessState, SnapshotType, TelemetryEnvelope};

use super::boundary::BoundaryDelegate;
use super::builder::{EndReason, EnvelopeBuilder, FinalEnvelopeParams, InitialEnvelopeParams};
use crate::clock::Clock;
use crate::config::DeliveryConfig;
use crate::delivery::EnvelopeDelivery;
use crate::diagnostics::{DiagnosticKind, DiagnosticsSink, run_guarded};

const HINT_FOREGROUND: u8 = 0;
const HINT_BACKGROUND: u8 = 1;

fn encode_state(state: ProcessState) -> u8 {
    match state {
        ProcessState::Foreground => HINT_FOREGROUND,
        ProcessState::Background => HINT_BACKGROUND,
    }
}

fn decode_state(hint: u8) -> ProcessState {
    if hint == HINT_BACKGROUND {
        ProcessState::Background
    } else {
        ProcessState::Foreground
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Transition {
    Initial { state: ProcessState },
    Foreground { cold_start: bool },
    Background,
    Manual { clear_user_info: bool },
    Crash { crash_id: String },
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Transition::Initial { .. } => "initial",
            Transition::Foreground { .. } => "foreground",
            Transition::Background => "background",
            Transition::Manual { .. } => "manual end",
            Transition::Crash { .. } => "crash",
        }
    }

    /// The transition would do nothing from `state`.
    fn is_redundant(&self, state: ProcessState) -> bool {
        match self {
            Transition::Foreground { .. } => state == ProcessState::Foreground,
            Transition::Background | Transition::Manual { .. } => state == ProcessState::Background,
            Transition::Initial { .. } | Transition::Crash { .. } => false,
        }
    }

    fn target_state(&self, current: ProcessState) -> ProcessState {
        match self {
            Transition::Initial { state } => *state,
            Transition::Foreground { .. } => ProcessState::Foreground,
            Transition::Background => ProcessState::Background,
            Transition::Manual { .. } | Transition::Crash { .. } => current,
        }
    }

    fn end_reason(&self) -> EndReason {
        match self {
            Transition::Manual { .. } => EndReason::Manual,
            Transition::Crash { crash_id } => EndReason::Crash {
                crash_id: crash_id.clone(),
            },
            _ => EndReason::StateChange,
        }
    }

    fn snapshot_type(&self) -> SnapshotType {
        match self {
            Transition::Crash { .. } => SnapshotType::JvmCrash,
            _ => SnapshotType::NormalEnd,
        }
    }

    fn starts_new_envelope(&self) -> bool {
        !matches!(self, Transition::Crash { .. })
    }

    fn clear_user_info(&self) -> bool {
        matches!(self, Transition::Manual { clear_user_info: true })
    }

    fn cold_start(&self) -> bool {
        match self {
            Transition::Initial { state } => *state == ProcessState::Foreground,
            Transition::Foreground { cold_start } => *cold_start,
            _ => false,
        }
    }
}

/// What a lifecycle call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Completed,
    /// Redundant or not allowed in the current state
    Skipped,
    /// A collaborator failed; the previous state was kept
    Failed,
}

struct OrchestratorState {
    process_state: ProcessState,
    active: Option<Arc<TelemetryEnvelope>>,
    session_count: u32,
    background_activity_count: u32,
}

/// Collaborators of the orchestrator.
pub struct OrchestratorParts {
    pub builder: Arc<dyn EnvelopeBuilder>,
    pub delivery: Arc<dyn EnvelopeDelivery>,
    pub boundary: Arc<dyn BoundaryDelegate>,
    pub clock: Arc<dyn Clock>,
    pub diagnostics: Arc<dyn DiagnosticsSink>,
}

pub struct SessionOrchestrator {
    /// Lock-free copy of the committed process state, read before locking
    state_hint: AtomicU8,
    state: Mutex<OrchestratorState>,
    builder: Arc<dyn EnvelopeBuilder>,
    delivery: Arc<dyn EnvelopeDelivery>,
    boundary: Arc<dyn BoundaryDelegate>,
    clock: Arc<dyn Clock>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    min_manual_session_ms: i64,
    background_activity_enabled: bool,
}

impl SessionOrchestrator {
    /// Create the orchestrator and run the initial transition into
    /// `initial_state`.
    pub fn new(parts: OrchestratorParts, config: &DeliveryConfig, initial_state: ProcessState) -> Self {
        let orchestrator = Self {
            state_hint: AtomicU8::new(encode_state(initial_state)),
            state: Mutex::new(OrchestratorState {
                process_state: initial_state,
                active: None,
                session_count: 0,
                background_activity_count: 0,
            }),
            builder: parts.builder,
            delivery: parts.delivery,
            boundary: parts.boundary,
            clock: parts.clock,
            diagnostics: parts.diagnostics,
            min_manual_session_ms: config.min_manual_session_ms,
            background_activity_enabled: config.background_activity_enabled,
        };

        let now = orchestrator.clock.now_ms();
        orchestrator.transition(Transition::Initial { state: initial_state }, now);
        orchestrator
    }

    pub fn process_state(&self) -> ProcessState {
        self.state.lock().process_state
    }

    pub fn active_envelope(&self) -> Option<Arc<TelemetryEnvelope>> {
        self.state.lock().active.clone()
    }

    pub fn on_foreground(&self, cold_start: bool, timestamp_ms: i64) -> TransitionOutcome {
        self.transition(Transition::Foreground { cold_start }, timestamp_ms)
    }

    pub fn on_background(&self, timestamp_ms: i64) -> TransitionOutcome {
        self.transition(Transition::Background, timestamp_ms)
    }

    /// End the current session on behalf of the host application and start a
    /// new one. Ignored in the background and for very young sessions.
    pub fn end_manual(&self, clear_user_info: bool) -> TransitionOutcome {
        self.transition(Transition::Manual { clear_user_info }, self.clock.now_ms())
    }

    /// Flush the active envelope as crashed. No new envelope is started.
    pub fn end_with_crash(&self, crash_id: &str) -> TransitionOutcome {
        self.transition(
            Transition::Crash {
                crash_id: crash_id.to_string(),
            },
            self.clock.now_ms(),
        )
    }

    fn transition(&self, transition: Transition, timestamp_ms: i64) -> TransitionOutcome {
        let hinted = decode_state(self.state_hint.load(Ordering::Acquire));
        if transition.is_redundant(hinted) {
            log::debug!("[ORCHESTRATOR] Ignoring {} transition while {}", transition.name(), hinted);
            return TransitionOutcome::Skipped;
        }

        let finished = {
            let mut state = self.state.lock();
            if transition.is_redundant(state.process_state) {
                log::debug!(
                    "[ORCHESTRATOR] Ignoring {} transition while {}",
                    transition.name(),
                    state.process_state
                );
                return TransitionOutcome::Skipped;
            }
            if matches!(transition, Transition::Manual { .. }) && !self.manual_end_allowed(&state, timestamp_ms) {
                return TransitionOutcome::Skipped;
            }

            // 1. final form of the active envelope
            let finished = match state.active.clone() {
                Some(active) => {
                    let params = FinalEnvelopeParams {
                        envelope: active.clone(),
                        end_time_ms: timestamp_ms,
                        end_reason: transition.end_reason(),
                    };
                    let built = self.guarded(
                        DiagnosticKind::EnvelopeBuildFail,
                        &format!("Failed to end envelope {}", active.id),
                        || self.builder.build_final(&params),
                    );
                    match built {
                        Some(envelope) => Some(Arc::new(envelope)),
                        None => return TransitionOutcome::Failed,
                    }
                }
                None => None,
            };

            // 2. reset envelope-scoped state
            let reset = self.guarded(
                DiagnosticKind::BoundaryResetFail,
                &format!("Boundary reset failed during {} transition", transition.name()),
                || {
                    self.boundary
                        .prepare_for_new_envelope(timestamp_ms, transition.clear_user_info())
                },
            );
            if reset.is_none() {
                return TransitionOutcome::Failed;
            }

            // 3. next envelope
            let target = transition.target_state(state.process_state);
            let mut session_count = state.session_count;
            let mut background_activity_count = state.background_activity_count;
            let starts_envelope = transition.starts_new_envelope()
                && (target == ProcessState::Foreground || self.background_activity_enabled);

            let next = if starts_envelope {
                let sequence_number = match target {
                    ProcessState::Foreground => {
                        session_count += 1;
                        session_count
                    }
                    ProcessState::Background => {
                        background_activity_count += 1;
                        background_activity_count
                    }
                };
                let params = InitialEnvelopeParams {
                    start_time_ms: timestamp_ms,
                    process_state: target,
                    cold_start: transition.cold_start(),
                    sequence_number,
                };
                let built = self.guarded(
                    DiagnosticKind::EnvelopeBuildFail,
                    &format!("Failed to start {} envelope", target),
                    || self.builder.build_initial(&params),
                );
                match built {
                    Some(envelope) => Some(Arc::new(envelope)),
                    None => return TransitionOutcome::Failed,
                }
            } else {
                None
            };

            // 4. commit
            log::info!(
                "[ORCHESTRATOR] {} transition: {} -> {} (ended: {}, started: {})",
                transition.name(),
                state.process_state,
                target,
                finished.as_ref().map(|e: &Arc<TelemetryEnvelope>| e.id.as_str()).unwrap_or("none"),
                next.as_ref().map(|e| e.id.as_str()).unwrap_or("none")
            );
            state.process_state = target;
            state.session_count = session_count;
            state.background_activity_count = background_activity_count;
            state.active = next;
            self.state_hint.store(encode_state(target), Ordering::Release);

            finished
        };

        if let Some(envelope) = finished {
            self.delivery.send_envelope(envelope, transition.snapshot_type());
        }
        TransitionOutcome::Completed
    }

    fn manual_end_allowed(&self, state: &OrchestratorState, timestamp_ms: i64) -> bool {
        let Some(active) = state.active.as_ref().filter(|a| !a.is_background()) else {
            log::debug!("[ORCHESTRATOR] Manual end ignored: no active session");
            return false;
        };
        let age_ms = timestamp_ms.saturating_sub(active.start_time_ms);
        if age_ms < self.min_manual_session_ms {
            log::warn!(
                "[ORCHESTRATOR] Manual end ignored: session {} is only {}ms old (minimum {}ms)",
                active.id,
                age_ms,
                self.min_manual_session_ms
            );
            return false;
        }
        true
    }

    /// Cache a snapshot of the active envelope. Returns false when nothing
    /// is active or the snapshot could not be built.
    pub fn cache_active_snapshot(&self) -> bool {
        let Some(active) = self.active_envelope() else {
            return false;
        };
        let params = FinalEnvelopeParams {
            envelope: active.clone(),
            end_time_ms: self.clock.now_ms(),
            end_reason: EndReason::PeriodicSnapshot,
        };
        let snapshot = self.guarded(
            DiagnosticKind::SessionCacheFail,
            &format!("Failed to snapshot envelope {}", active.id),
            || self.builder.build_final(&params),
        );
        match snapshot {
            Some(snapshot) => {
                self.delivery
                    .send_envelope(Arc::new(snapshot), SnapshotType::PeriodicCache);
                true
            }
            None => false,
        }
    }

    /// Background activity data changed; cache it right away instead of
    /// waiting for the next periodic snapshot.
    pub fn report_background_activity_state_change(&self) -> bool {
        let in_background_activity = {
            let state = self.state.lock();
            state.process_state == ProcessState::Background
                && state.active.as_ref().is_some_and(|active| active.is_background())
        };
        in_background_activity && self.cache_active_snapshot()
    }

    /// Run a collaborator call, reporting errors and panics.
    fn guarded<T, E, F>(&self, kind: DiagnosticKind, context: &str, call: F) -> Option<T>
    where
        E: Error + 'static,
        F: FnOnce() -> Result<T, E>,
    {
        match run_guarded(call) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                self.diagnostics.report(kind, context, Some(&e));
                None
            }
            Err(panic) => {
                self.diagnostics.report(kind, context, Some(&panic));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::boundary::{BoundaryError, SessionProperties};
    use crate::testing::{BuilderFault, FakeClock, FakeEnvelopeBuilder, RecordingDelivery, RecordingDiagnostics};
    use std::collections::HashSet;

    struct Fixture {
        orchestrator: SessionOrchestrator,
        builder: Arc<FakeEnvelopeBuilder>,
        delivery: Arc<RecordingDelivery>,
        properties: Arc<SessionProperties>,
        clock: Arc<FakeClock>,
        diagnostics: Arc<RecordingDiagnostics>,
    }

    fn fixture_with(initial_state: ProcessState, config: DeliveryConfig, boundary: Option<Arc<dyn BoundaryDelegate>>) -> Fixture {
        let builder = Arc::new(FakeEnvelopeBuilder::default());
        let delivery = Arc::new(RecordingDelivery::default());
        let properties = Arc::new(SessionProperties::default());
        let clock = Arc::new(FakeClock::new(0));
        let diagnostics = Arc::new(RecordingDiagnostics::default());

        let orchestrator = SessionOrchestrator::new(
            OrchestratorParts {
                builder: builder.clone(),
                delivery: delivery.clone(),
                boundary: boundary.unwrap_or_else(|| properties.clone() as Arc<dyn BoundaryDelegate>),
                clock: clock.clone(),
                diagnostics: diagnostics.clone(),
            },
            &config,
            initial_state,
        );
        Fixture {
            orchestrator,
            builder,
            delivery,
            properties,
            clock,
            diagnostics,
        }
    }

    fn fixture(initial_state: ProcessState) -> Fixture {
        fixture_with(initial_state, DeliveryConfig::default(), None)
    }

    fn active_id(f: &Fixture) -> Option<String> {
        f.orchestrator.active_envelope().map(|e| e.id.clone())
    }

    struct FailingBoundary;

    impl BoundaryDelegate for FailingBoundary {
        fn prepare_for_new_envelope(&self, _: i64, _: bool) -> Result<(), BoundaryError> {
            Err(BoundaryError("properties locked".to_string()))
        }
    }

    #[test]
    fn test_initial_foreground_starts_cold_session() {
        let f = fixture(ProcessState::Foreground);

        assert_eq!(active_id(&f).as_deref(), Some("session-1"));
        let calls = f.builder.initial_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].cold_start);
        assert!(f.delivery.sent().is_empty());
    }

    #[test]
    fn test_background_activities_are_numbered() {
        let f = fixture(ProcessState::Background);
        assert_eq!(active_id(&f).as_deref(), Some("background-1"));

        assert_eq!(f.orchestrator.on_foreground(false, 30_000), TransitionOutcome::Completed);
        assert_eq!(active_id(&f).as_deref(), Some("session-1"));

        assert_eq!(f.orchestrator.on_background(60_000), TransitionOutcome::Completed);
        assert_eq!(active_id(&f).as_deref(), Some("background-2"));

        assert_eq!(
            f.delivery.sent_ids(),
            vec![
                ("background-1".to_string(), SnapshotType::NormalEnd),
                ("session-1".to_string(), SnapshotType::NormalEnd),
            ]
        );
        let background_numbers: Vec<u32> = f
            .builder
            .initial_calls()
            .iter()
            .filter(|p| p.process_state == ProcessState::Background)
            .map(|p| p.sequence_number)
            .collect();
        assert_eq!(background_numbers, vec![1, 2]);
    }

    #[test]
    fn test_final_envelope_carries_end_time() {
        let f = fixture(ProcessState::Foreground);
        f.orchestrator.on_background(42_000);

        let sent = f.delivery.sent();
        let (ended, _) = &sent[0];
        assert_eq!(ended.end_time_ms, Some(42_000));
        assert_eq!(f.builder.final_calls(), vec![("session-1".to_string(), EndReason::StateChange)]);
    }

    #[test]
    fn test_redundant_transitions_are_skipped() {
        let f = fixture(ProcessState::Foreground);

        assert_eq!(f.orchestrator.on_foreground(false, 1000), TransitionOutcome::Skipped);
        assert_eq!(f.builder.initial_calls().len(), 1);
        assert!(f.delivery.sent().is_empty());

        f.orchestrator.on_background(2000);
        assert_eq!(f.orchestrator.on_background(3000), TransitionOutcome::Skipped);
        assert_eq!(f.delivery.sent().len(), 1);
    }

    #[test]
    fn test_manual_end_rules() {
        let f = fixture(ProcessState::Foreground);

        f.clock.set(4_999);
        assert_eq!(f.orchestrator.end_manual(false), TransitionOutcome::Skipped);
        assert_eq!(active_id(&f).as_deref(), Some("session-1"));

        f.clock.set(5_000);
        assert_eq!(f.orchestrator.end_manual(false), TransitionOutcome::Completed);
        assert_eq!(active_id(&f).as_deref(), Some("session-2"));
        assert_eq!(
            f.builder.final_calls(),
            vec![("session-1".to_string(), EndReason::Manual)]
        );
        assert_eq!(f.orchestrator.process_state(), ProcessState::Foreground);

        f.orchestrator.on_background(20_000);
        f.clock.set(60_000);
        assert_eq!(f.orchestrator.end_manual(false), TransitionOutcome::Skipped);
    }

    #[test]
    fn test_manual_end_can_clear_user_info() {
        let f = fixture(ProcessState::Foreground);
        f.properties.set_user_id(Some("user-1".to_string()));
        f.properties.add("screen", "home", false);
        f.clock.set(10_000);

        f.orchestrator.end_manual(true);

        assert_eq!(f.properties.user_id(), None);
        assert_eq!(f.properties.get("screen"), None);
        assert_eq!(f.properties.last_boundary_ms(), Some(10_000));
    }

    #[test]
    fn test_crash_ends_without_new_envelope() {
        let f = fixture(ProcessState::Foreground);

        assert_eq!(f.orchestrator.end_with_crash("crash-7"), TransitionOutcome::Completed);

        assert_eq!(f.orchestrator.active_envelope(), None);
        assert_eq!(
            f.delivery.sent_ids(),
            vec![("session-1".to_string(), SnapshotType::JvmCrash)]
        );
        assert_eq!(
            f.builder.final_calls(),
            vec![(
                "session-1".to_string(),
                EndReason::Crash {
                    crash_id: "crash-7".to_string()
                }
            )]
        );

        // nothing left to end on the next transition
        f.orchestrator.on_background(1000);
        assert_eq!(f.delivery.sent().len(), 1);
        assert_eq!(active_id(&f).as_deref(), Some("background-1"));
    }

    #[test]
    fn test_builder_failure_keeps_previous_state() {
        let f = fixture(ProcessState::Foreground);
        f.builder.set_fault(BuilderFault::FailInitial);

        assert_eq!(f.orchestrator.on_background(1000), TransitionOutcome::Failed);
        assert_eq!(f.orchestrator.process_state(), ProcessState::Foreground);
        assert_eq!(active_id(&f).as_deref(), Some("session-1"));
        assert!(f.delivery.sent().is_empty());
        assert_eq!(f.diagnostics.count_of(DiagnosticKind::EnvelopeBuildFail), 1);

        f.builder.set_fault(BuilderFault::None);
        assert_eq!(f.orchestrator.on_background(2000), TransitionOutcome::Completed);
        assert_eq!(active_id(&f).as_deref(), Some("background-1"));
    }

    #[test]
    fn test_final_build_failure_keeps_previous_state() {
        let f = fixture(ProcessState::Foreground);
        f.builder.set_fault(BuilderFault::FailFinal);

        assert_eq!(f.orchestrator.on_background(1000), TransitionOutcome::Failed);
        assert_eq!(active_id(&f).as_deref(), Some("session-1"));
        assert_eq!(f.builder.initial_calls().len(), 1);
    }

    #[test]
    fn test_builder_panic_is_contained() {
        let f = fixture(ProcessState::Foreground);
        f.builder.set_fault(BuilderFault::PanicInitial);

        assert_eq!(f.orchestrator.on_background(1000), TransitionOutcome::Failed);
        assert_eq!(active_id(&f).as_deref(), Some("session-1"));

        let reports = f.diagnostics.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, DiagnosticKind::EnvelopeBuildFail);
        assert!(reports[0].cause.as_deref().unwrap().contains("builder exploded"));
    }

    #[test]
    fn test_boundary_failure_keeps_previous_state() {
        let f = fixture_with(
            ProcessState::Background,
            DeliveryConfig::default(),
            Some(Arc::new(FailingBoundary)),
        );
        // the initial transition also went through the failing boundary
        assert_eq!(f.orchestrator.active_envelope(), None);

        assert_eq!(f.orchestrator.on_foreground(false, 1000), TransitionOutcome::Failed);
        assert_eq!(f.orchestrator.process_state(), ProcessState::Background);
        assert_eq!(f.diagnostics.count_of(DiagnosticKind::BoundaryResetFail), 2);
    }

    #[test]
    fn test_background_activity_can_be_disabled() {
        let config = DeliveryConfig {
            background_activity_enabled: false,
            ..Default::default()
        };
        let f = fixture_with(ProcessState::Foreground, config, None);

        f.orchestrator.on_background(1000);
        assert_eq!(f.orchestrator.active_envelope(), None);
        assert_eq!(f.orchestrator.process_state(), ProcessState::Background);

        f.orchestrator.on_foreground(false, 2000);
        assert_eq!(active_id(&f).as_deref(), Some("session-2"));
        assert_eq!(
            f.delivery.sent_ids(),
            vec![("session-1".to_string(), SnapshotType::NormalEnd)]
        );
    }

    #[test]
    fn test_periodic_snapshot_keeps_envelope_active() {
        let f = fixture(ProcessState::Foreground);

        assert!(f.orchestrator.cache_active_snapshot());
        assert_eq!(
            f.delivery.sent_ids(),
            vec![("session-1".to_string(), SnapshotType::PeriodicCache)]
        );
        assert_eq!(active_id(&f).as_deref(), Some("session-1"));

        f.orchestrator.end_with_crash("c");
        assert!(!f.orchestrator.cache_active_snapshot());
    }

    #[test]
    fn test_background_activity_change_is_cached_immediately() {
        let f = fixture(ProcessState::Foreground);
        assert!(!f.orchestrator.report_background_activity_state_change());

        f.orchestrator.on_background(1000);
        assert!(f.orchestrator.report_background_activity_state_change());
        assert_eq!(
            f.delivery.sent_ids().last().cloned(),
            Some(("background-1".to_string(), SnapshotType::PeriodicCache))
        );
    }

    #[test]
    fn test_concurrent_transitions_end_each_envelope_once() {
        let f = fixture(ProcessState::Foreground);
        let completed = std::sync::atomic::AtomicUsize::new(0);

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let f = &f;
                let completed = &completed;
                scope.spawn(move || {
                    for i in 0..50 {
                        let outcome = if (worker + i) % 2 == 0 {
                            f.orchestrator.on_background(i as i64)
                        } else {
                            f.orchestrator.on_foreground(false, i as i64)
                        };
                        if outcome == TransitionOutcome::Completed {
                            completed.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        let ended = f.delivery.sent_ids();
        assert_eq!(ended.len(), completed.load(Ordering::SeqCst));
        let unique: HashSet<&String> = ended.iter().map(|(id, _)| id).collect();
        assert_eq!(unique.len(), ended.len());

        let active = active_id(&f).unwrap();
        assert!(!unique.contains(&active));
    }
}
