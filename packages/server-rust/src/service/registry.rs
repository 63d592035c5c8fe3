use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use jobrelay_core::{Job, ServiceKey, WorkerLanguage};
use serde::Serialize;
use serde_json::Value;

// ---------------------------------------------------------------------------
// Callback types
// ---------------------------------------------------------------------------

/// Why a job could not be served, delivered to `on_unavailable`.
///
/// `function` is the name exactly as enqueued (including any `batch_`
/// prefix).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Unavailable {
    pub function: String,
    pub language: WorkerLanguage,
    pub job_id: String,
    pub reason: String,
}

impl Unavailable {
    #[must_use]
    pub fn for_job(job: &Job, reason: impl Into<String>) -> Self {
        Self {
            function: job.function.clone(),
            language: job.language.clone(),
            job_id: job.id.clone(),
            reason: reason.into(),
        }
    }
}

/// Receives `(job_id, data)` for each result or streamed batch chunk.
pub type ResultCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;
/// Receives the reason a job resolved without a result.
pub type UnavailableCallback = Arc<dyn Fn(&Unavailable) + Send + Sync>;
/// Receives `(function, language)` once a batch job finished.
pub type BatchDoneCallback = Arc<dyn Fn(&str, &WorkerLanguage) + Send + Sync>;

// ---------------------------------------------------------------------------
// ServiceRegistration
// ---------------------------------------------------------------------------

/// One remote function for one language, and where its responses go.
///
/// Callbacks run on the dispatcher's control task and must not block.
#[derive(Clone)]
pub struct ServiceRegistration {
    pub module_path: String,
    pub module_name: String,
    on_result: ResultCallback,
    on_unavailable: Option<UnavailableCallback>,
    on_batch_done: Option<BatchDoneCallback>,
}

impl ServiceRegistration {
    /// Creates a registration that loads `module_name` from `module_path` on
    /// the worker and reports results to `on_result`.
    pub fn new(
        module_path: impl Into<String>,
        module_name: impl Into<String>,
        on_result: impl Fn(&str, &Value) + Send + Sync + 'static,
    ) -> Self {
        Self {
            module_path: module_path.into(),
            module_name: module_name.into(),
            on_result: Arc::new(on_result),
            on_unavailable: None,
            on_batch_done: None,
        }
    }

    #[must_use]
    pub fn on_unavailable(mut self, f: impl Fn(&Unavailable) + Send + Sync + 'static) -> Self {
        self.on_unavailable = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_batch_done(
        mut self,
        f: impl Fn(&str, &WorkerLanguage) + Send + Sync + 'static,
    ) -> Self {
        self.on_batch_done = Some(Arc::new(f));
        self
    }

    /// The `INIT` job announcing this registration to a worker.
    #[must_use]
    pub fn init_job(&self, key: &ServiceKey) -> Job {
        Job::init(
            key.language.clone(),
            key.function.clone(),
            &self.module_path,
            &self.module_name,
        )
    }

    pub fn notify_result(&self, job_id: &str, data: &Value) {
        (self.on_result)(job_id, data);
    }

    pub fn notify_unavailable(&self, notice: &Unavailable) {
        if let Some(f) = &self.on_unavailable {
            f(notice);
        }
    }

    pub fn notify_batch_done(&self, function: &str, language: &WorkerLanguage) {
        if let Some(f) = &self.on_batch_done {
            f(function, language);
        }
    }
}

impl fmt::Debug for ServiceRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceRegistration")
            .field("module_path", &self.module_path)
            .field("module_name", &self.module_name)
            .field("on_unavailable", &self.on_unavailable.is_some())
            .field("on_batch_done", &self.on_batch_done.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Typed map from `(function, language)` to its registration.
///
/// Owned by the dispatcher's control task; never shared.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<ServiceKey, ServiceRegistration>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `registration`, replacing any previous one for `key`.
    pub fn register(&mut self, key: ServiceKey, registration: ServiceRegistration) {
        self.services.insert(key, registration);
    }

    /// Removes the registration for `key`. Its callbacks are dropped with it,
    /// so nothing calls into the owning feature afterwards.
    pub fn unregister(&mut self, key: &ServiceKey) -> Option<ServiceRegistration> {
        self.services.remove(key)
    }

    #[must_use]
    pub fn get(&self, key: &ServiceKey) -> Option<&ServiceRegistration> {
        self.services.get(key)
    }

    /// Registration serving `job`. Batch jobs map to the unprefixed name.
    #[must_use]
    pub fn for_job(&self, job: &Job) -> Option<&ServiceRegistration> {
        self.services.get(&job.service_key())
    }

    /// `INIT` jobs for every registration of `language`, in key order.
    #[must_use]
    pub fn init_jobs_for(&self, language: &WorkerLanguage) -> Vec<Job> {
        let mut keys: Vec<&ServiceKey> = self
            .services
            .keys()
            .filter(|key| &key.language == language)
            .collect();
        keys.sort();
        keys.into_iter()
            .map(|key| self.services[key].init_job(key))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
