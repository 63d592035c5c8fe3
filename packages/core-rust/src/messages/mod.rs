//! Message schemas for the dispatcher <-> worker protocol.
//!
//! Every message body is the JSON array `[function, job_id, data]`
//! ([`Envelope`]). Requests travelling to a worker are additionally tagged
//! with a 6-byte [`MessageType`]; responses travelling back are not.
//!
//! A handful of function names and data values are reserved and change how
//! a response is routed; see [`ResponseKind`].

pub mod envelope;
pub mod request;
pub mod response;

pub use envelope::Envelope;
pub use request::{MessageType, Request};
pub use response::{ResponseKind, WorkerFault};

/// Function name of the module-registration job sent to a fresh worker.
pub const INIT: &str = "INIT";

/// Function name a worker uses to report an unhandled fault.
pub const EXCEPTION: &str = "EXCEPTION";

/// Prefix marking a streaming (batch) function.
pub const BATCH_PREFIX: &str = "batch_";

/// Data value terminating a batch stream.
pub const BATCH_DONE: &str = "__DONE__";

/// Data value a worker returns for a function it has no module for.
pub const UNKNOWN_SERVICE: &str = "Unknown service.";

/// Data value a worker returns for a batch function it has no module for.
pub const UNKNOWN_BATCH_SERVICE: &str = "Unknown batch service.";

/// Strips the batch prefix from a function name, if present.
///
/// ```
/// use jobrelay_core::messages::base_function;
///
/// assert_eq!(base_function("batch_style"), "style");
/// assert_eq!(base_function("style"), "style");
/// ```
#[must_use]
pub fn base_function(function: &str) -> &str {
    function.strip_prefix(BATCH_PREFIX).unwrap_or(function)
}
