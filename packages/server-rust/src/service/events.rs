//! Application-facing notifications broadcast by the dispatcher.

use jobrelay_core::{WorkerFault, WorkerLanguage};
use serde::Serialize;

use super::registry::Unavailable;

/// Something the application may want to react to.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatcherEvent {
    /// A worker announced itself and its `INIT` jobs were queued.
    WorkerConnected { language: WorkerLanguage },
    /// A worker connection ended without being asked to.
    WorkerDisconnected {
        language: WorkerLanguage,
        reason: String,
    },
    /// A worker reported an unhandled exception.
    WorkerFaulted {
        language: WorkerLanguage,
        kind: String,
        message: String,
        traceback: String,
    },
    /// A job resolved without a result.
    ServiceUnavailable(Unavailable),
    /// A batch job finished. `function` has no `batch_` prefix.
    BatchDone {
        function: String,
        language: WorkerLanguage,
    },
}

impl DispatcherEvent {
    #[must_use]
    pub fn faulted(language: WorkerLanguage, fault: &WorkerFault) -> Self {
        Self::WorkerFaulted {
            language,
            kind: fault.kind.clone(),
            message: fault.message.clone(),
            traceback: fault.traceback.clone(),
        }
    }
}
