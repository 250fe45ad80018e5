//! Internal diagnostics reporting.
//!
//! Every failure inside the core ends here instead of propagating into the
//! host application. The default sink writes through the `log` facade; SDKs
//! can plug in a sink that forwards diagnostics to their own telemetry.

use std::any::Any;
use std::error::Error;
use std::panic::{AssertUnwindSafe, catch_unwind};
use strum::Display;

/// Category of an internal diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DiagnosticKind {
    /// Writing a payload to storage failed
    PayloadStoreFail,
    /// Reading a stored payload failed for a reason other than absence
    PayloadLoadFail,
    /// Deleting a stored payload failed
    PayloadDeleteFail,
    /// Entries were deleted to stay within the storage budget
    PayloadPruned,
    /// A stored file name could not be decoded
    InvalidStorageKey,
    /// A payload was dropped without being delivered
    DeliveryDataLoss,
    /// A pending delivery exceeded its age or retry ceiling
    StaleDeliveryDropped,
    /// Resending a snapshot left by a previous process failed
    PayloadResurrectionFail,
    /// The envelope builder failed during a transition
    EnvelopeBuildFail,
    /// The boundary reset hook failed during a transition
    BoundaryResetFail,
    /// Caching a snapshot of the active envelope failed
    SessionCacheFail,
}

/// Receiver of internal diagnostics. Must not block meaningfully and must not panic.
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, kind: DiagnosticKind, message: &str, cause: Option<&(dyn Error + 'static)>);
}

/// Sink that writes diagnostics to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl DiagnosticsSink for LogDiagnostics {
    fn report(&self, kind: DiagnosticKind, message: &str, cause: Option<&(dyn Error + 'static)>) {
        match (kind, cause) {
            (DiagnosticKind::PayloadPruned, _) => {
                log::warn!("[DIAGNOSTICS] {}: {}", kind, message);
            }
            (_, Some(cause)) => {
                log::error!("[DIAGNOSTICS] {}: {} (cause: {})", kind, message, cause);
            }
            (_, None) => {
                log::error!("[DIAGNOSTICS] {}: {}", kind, message);
            }
        }
    }
}

/// A panic caught at a collaborator boundary.
#[derive(Debug, Clone)]
pub struct CaughtPanic(pub String);

impl std::fmt::Display for CaughtPanic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "panicked: {}", self.0)
    }
}

impl Error for CaughtPanic {}

/// Run a collaborator callback, converting a panic into an error value.
pub fn run_guarded<T, F>(f: F) -> Result<T, CaughtPanic>
where
    F: FnOnce() -> T,
{
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| CaughtPanic(panic_message(payload.as_ref())))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
