//! Dispatcher metrics, recorded through the `metrics` facade.
//!
//! Nothing is exported unless a recorder is installed (the binary installs
//! the Prometheus exporter when asked to).

use jobrelay_core::WorkerLanguage;
use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const JOBS_ENQUEUED: &str = "jobrelay_jobs_enqueued_total";
pub const JOBS_DISPATCHED: &str = "jobrelay_jobs_dispatched_total";
pub const JOBS_UNAVAILABLE: &str = "jobrelay_jobs_unavailable_total";
pub const WORKER_CRASHES: &str = "jobrelay_worker_crashes_total";
pub const PROTOCOL_ERRORS: &str = "jobrelay_protocol_errors_total";
pub const QUEUE_DEPTH: &str = "jobrelay_queue_depth";

/// Registers help text for every metric.
pub fn describe() {
    describe_counter!(JOBS_ENQUEUED, "Jobs accepted into the queue.");
    describe_counter!(JOBS_DISPATCHED, "Jobs written to a worker connection.");
    describe_counter!(JOBS_UNAVAILABLE, "Jobs resolved without a result.");
    describe_counter!(WORKER_CRASHES, "Worker faults and unexpected disconnects.");
    describe_counter!(PROTOCOL_ERRORS, "Connections dropped for undecodable frames.");
    describe_gauge!(QUEUE_DEPTH, "Jobs waiting to be dispatched.");
}

pub(crate) fn job_enqueued(language: &WorkerLanguage) {
    counter!(JOBS_ENQUEUED, "language" => language.to_string()).increment(1);
}

pub(crate) fn job_dispatched(language: &WorkerLanguage) {
    counter!(JOBS_DISPATCHED, "language" => language.to_string()).increment(1);
}

pub(crate) fn job_unavailable(language: &WorkerLanguage) {
    counter!(JOBS_UNAVAILABLE, "language" => language.to_string()).increment(1);
}

pub(crate) fn worker_crashed(language: &WorkerLanguage) {
    counter!(WORKER_CRASHES, "language" => language.to_string()).increment(1);
}

pub(crate) fn protocol_error(language: &WorkerLanguage) {
    counter!(PROTOCOL_ERRORS, "language" => language.to_string()).increment(1);
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn queue_depth(depth: usize) {
    gauge!(QUEUE_DEPTH).set(depth as f64);
}
