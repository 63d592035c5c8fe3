//! Classification of worker-to-dispatcher responses.

use std::fmt;

use serde_json::Value;

use super::{
    Envelope, BATCH_DONE, BATCH_PREFIX, EXCEPTION, INIT, UNKNOWN_BATCH_SERVICE, UNKNOWN_SERVICE,
};

/// Routing class of a decoded response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseKind {
    /// Acknowledgement of an `INIT` job.
    Init,
    /// The worker hit an unhandled fault and is about to exit.
    Exception(WorkerFault),
    /// The worker has no module registered for the requested function.
    UnknownService,
    /// One streamed result of a batch job. `function` has the prefix removed.
    BatchChunk { function: String },
    /// Terminal sentinel of a batch job. `function` has the prefix removed.
    BatchDone { function: String },
    /// A single-shot result.
    Result,
}

impl ResponseKind {
    /// Returns `true` if this response ends the job it belongs to.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::BatchChunk { .. })
    }
}

impl Envelope {
    /// Classifies a response received from a worker.
    ///
    /// Precedence: `INIT`, `EXCEPTION`, unknown-service replies, batch
    /// frames, then plain results.
    #[must_use]
    pub fn classify(&self) -> ResponseKind {
        if self.function == INIT {
            return ResponseKind::Init;
        }
        if self.function == EXCEPTION {
            return ResponseKind::Exception(WorkerFault::from_data(&self.data));
        }
        if matches!(self.data.as_str(), Some(UNKNOWN_SERVICE | UNKNOWN_BATCH_SERVICE)) {
            return ResponseKind::UnknownService;
        }
        if let Some(function) = self.function.strip_prefix(BATCH_PREFIX) {
            let function = function.to_owned();
            return if self.data.as_str() == Some(BATCH_DONE) {
                ResponseKind::BatchDone { function }
            } else {
                ResponseKind::BatchChunk { function }
            };
        }
        ResponseKind::Result
    }
}

// ---------------------------------------------------------------------------
// WorkerFault
// ---------------------------------------------------------------------------

/// Exception description carried by an `EXCEPTION` response.
///
/// Workers send `[type, value, traceback]`; anything else is kept verbatim
/// in `message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerFault {
    pub kind: String,
    pub message: String,
    pub traceback: String,
}

impl WorkerFault {
    #[must_use]
    pub fn from_data(data: &Value) -> Self {
        let text = |v: Option<&Value>| match v {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        match data {
            Value::Array(parts) => Self {
                kind: text(parts.first()),
                message: text(parts.get(1)),
                traceback: text(parts.get(2)),
            },
            other => Self {
                kind: String::new(),
                message: text(Some(other)),
                traceback: String::new(),
            },
        }
    }
}

impl fmt::Display for WorkerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_empty() {
            f.write_str(&self.message)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}
