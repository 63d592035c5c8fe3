use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::messages::{base_function, Envelope, BATCH_PREFIX, INIT};

// ---------------------------------------------------------------------------
// WorkerLanguage
// ---------------------------------------------------------------------------

/// Opaque identifier of an interpreter family (e.g. `"Python3"`).
///
/// Used as the routing key for worker processes, connections, and service
/// registrations. Two languages are equal iff their strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerLanguage(String);

impl WorkerLanguage {
    /// Creates a language identifier from any string-like value.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerLanguage {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for WorkerLanguage {
    fn from(name: String) -> Self {
        Self(name)
    }
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Key of a service registration: one remote function for one language.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey {
    pub function: String,
    pub language: WorkerLanguage,
}

impl ServiceKey {
    #[must_use]
    pub fn new(function: impl Into<String>, language: impl Into<WorkerLanguage>) -> Self {
        Self {
            function: function.into(),
            language: language.into(),
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.function, self.language)
    }
}

/// De-duplication key of a queued job: `(function, language, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub function: String,
    pub language: WorkerLanguage,
    pub id: String,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} [{}]", self.function, self.language, self.id)
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// One unit of requested work.
///
/// `id` is supplied by the caller (typically a file path) and is echoed back
/// by the worker so results can be attributed. `data` is forwarded to the
/// worker verbatim as the function's arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub function: String,
    pub language: WorkerLanguage,
    pub id: String,
    pub data: Value,
}

impl Job {
    #[must_use]
    pub fn new(
        function: impl Into<String>,
        language: impl Into<WorkerLanguage>,
        id: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            function: function.into(),
            language: language.into(),
            id: id.into(),
            data,
        }
    }

    /// Builds the synthetic `INIT` job that tells a worker to load the module
    /// implementing `function`.
    ///
    /// The worker receives `["INIT", function, [module_path, module_name]]`.
    #[must_use]
    pub fn init(
        language: impl Into<WorkerLanguage>,
        function: impl Into<String>,
        module_path: &str,
        module_name: &str,
    ) -> Self {
        Self::new(
            INIT,
            language,
            function,
            Value::Array(vec![
                Value::String(module_path.to_owned()),
                Value::String(module_name.to_owned()),
            ]),
        )
    }

    #[must_use]
    pub fn key(&self) -> JobKey {
        JobKey {
            function: self.function.clone(),
            language: self.language.clone(),
            id: self.id.clone(),
        }
    }

    /// Returns `true` if `other` has the same `(function, language, id)`.
    #[must_use]
    pub fn same_key(&self, other: &Job) -> bool {
        self.function == other.function && self.language == other.language && self.id == other.id
    }

    /// Key of the registration that handles this job's responses.
    ///
    /// Batch jobs (`batch_<name>`) are served by the `<name>` registration.
    #[must_use]
    pub fn service_key(&self) -> ServiceKey {
        ServiceKey::new(base_function(&self.function), self.language.clone())
    }

    #[must_use]
    pub fn is_init(&self) -> bool {
        self.function == INIT
    }

    #[must_use]
    pub fn is_batch(&self) -> bool {
        self.function.starts_with(BATCH_PREFIX)
    }

    /// Converts the job into the wire envelope `[function, id, data]`.
    #[must_use]
    pub fn to_envelope(&self) -> Envelope {
        Envelope::new(self.function.clone(), self.id.clone(), self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn init_job_carries_module_coordinates() {
        let job = Job::init("Python3", "style", "/plugins/style", "StyleChecker");
        assert!(job.is_init());
        assert_eq!(job.id, "style");
        assert_eq!(job.data, json!(["/plugins/style", "StyleChecker"]));
    }

    #[test]
    fn batch_job_routes_to_base_registration() {
        let job = Job::new("batch_style", "Python3", "", json!([]));
        assert!(job.is_batch());
        assert_eq!(job.service_key(), ServiceKey::new("style", "Python3"));
    }

    #[test]
    fn same_key_ignores_payload() {
        let a = Job::new("lint", "py", "/a.py", json!(["A"]));
        let b = Job::new("lint", "py", "/a.py", json!(["B"]));
        let c = Job::new("lint", "py", "/b.py", json!(["A"]));
        assert!(a.same_key(&b));
        assert!(!a.same_key(&c));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn language_serializes_as_plain_string() {
        let lang = WorkerLanguage::new("Python2");
        assert_eq!(serde_json::to_string(&lang).unwrap(), "\"Python2\"");
        assert_eq!(lang.to_string(), "Python2");
    }

    #[test]
    fn to_envelope_preserves_triple() {
        let job = Job::new("lint", "py", "/a.py", json!(["code..."]));
        let env = job.to_envelope();
        assert_eq!(env.function, "lint");
        assert_eq!(env.job_id, "/a.py");
        assert_eq!(env.data, json!(["code..."]));
    }
}
