//! The dispatch state machine.
//!
//! `Dispatcher` owns the queue, the registry, every worker connection and
//! process, and the single in-flight job. It is driven exclusively by the
//! control task in [`super::runtime`]; nothing here blocks or awaits.
//!
//! Only one job is in flight across all languages at any time. A slow job
//! for one language holds up queued jobs for every other language.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use jobrelay_core::messages::base_function;
use jobrelay_core::{Envelope, Job, Request, ResponseKind, ServiceKey, WorkerFault, WorkerLanguage};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use super::config::LanguageConfig;
use super::events::DispatcherEvent;
use super::metrics;
use super::process::{Launcher, WorkerProcess};
use super::queue::JobQueue;
use super::recovery::FaultChoice;
use super::registry::{ServiceRegistration, ServiceRegistry, Unavailable};
use super::status::{DispatcherStatus, LanguageState};
use crate::network::{
    AnnouncedWorker, CloseReason, ConnectionConfig, ConnectionEvent, ConnectionId, InboundEvent,
    WorkerConnection,
};

/// Reasons handed to `on_unavailable`.
pub mod reasons {
    pub const FAULTED: &str = "An error in the background worker stopped the service.";
    pub const DISCONNECTED: &str = "The background worker disconnected for an unknown reason.";
    pub const RESTARTED: &str = "The background worker was restarted.";
    pub const RECONNECTED: &str = "The background worker reconnected.";
    pub const SHUTTING_DOWN: &str = "The dispatcher is shutting down.";
}

/// A question for the recovery prompt, produced by a fault or disconnect.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Faulted {
        language: WorkerLanguage,
        fault: WorkerFault,
    },
    Disconnected {
        language: WorkerLanguage,
    },
}

#[derive(Debug)]
struct InFlight {
    job: Job,
    conn_id: ConnectionId,
    /// Set by a matching cancel: inbound frames are dropped until the job ends.
    discarding: bool,
}

#[derive(Debug, Default)]
enum DispatchState {
    #[default]
    Idle,
    Busy(InFlight),
}

/// Single-owner dispatcher state.
pub struct Dispatcher {
    queue: JobQueue,
    registry: ServiceRegistry,
    connections: HashMap<WorkerLanguage, WorkerConnection>,
    processes: HashMap<WorkerLanguage, WorkerProcess>,
    interpreters: BTreeMap<WorkerLanguage, String>,
    languages: BTreeMap<WorkerLanguage, LanguageState>,
    state: DispatchState,
    /// Jobs to re-run once the restarted worker for their language connects.
    pending_retry: HashMap<WorkerLanguage, Job>,
    /// Jobs that were running when their worker faulted, awaiting a choice.
    faulted: HashMap<WorkerLanguage, Job>,
    /// Non-forced restarts waiting for the dispatcher to become idle.
    deferred_restarts: BTreeSet<WorkerLanguage>,
    prompts: Vec<Prompt>,
    launcher: Box<dyn Launcher>,
    connection_config: ConnectionConfig,
    inbound: mpsc::UnboundedSender<InboundEvent>,
    events: broadcast::Sender<DispatcherEvent>,
    next_conn_id: u64,
    port: u16,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        launcher: Box<dyn Launcher>,
        connection_config: ConnectionConfig,
        inbound: mpsc::UnboundedSender<InboundEvent>,
        events: broadcast::Sender<DispatcherEvent>,
        port: u16,
    ) -> Self {
        Self {
            queue: JobQueue::new(),
            registry: ServiceRegistry::new(),
            connections: HashMap::new(),
            processes: HashMap::new(),
            interpreters: BTreeMap::new(),
            languages: BTreeMap::new(),
            state: DispatchState::Idle,
            pending_retry: HashMap::new(),
            faulted: HashMap::new(),
            deferred_restarts: BTreeSet::new(),
            prompts: Vec::new(),
            launcher,
            connection_config,
            inbound,
            events,
            next_conn_id: 1,
            port,
        }
    }

    // -----------------------------------------------------------------------
    // Application operations
    // -----------------------------------------------------------------------

    /// Records interpreters and launches every configured language.
    pub fn start(&mut self, languages: &[LanguageConfig]) {
        for config in languages {
            self.interpreters
                .insert(config.language.clone(), config.interpreter.clone());
            self.languages
                .insert(config.language.clone(), LanguageState::Unconfigured);
            self.launch(&config.language);
        }
        self.pump();
    }

    pub fn enqueue(&mut self, job: Job) {
        metrics::job_enqueued(&job.language);
        let (function, language, id) = (job.function.clone(), job.language.clone(), job.id.clone());
        let outcome = self.queue.enqueue(job);
        debug!(%function, %language, job_id = %id, ?outcome, "enqueue");
        self.pump();
    }

    /// Purges queued `(function, language)` jobs, stops callbacks for the
    /// matching in-flight job, and asks the worker to stop early.
    pub fn request_cancel(&mut self, function: &str, language: &WorkerLanguage) {
        let purged = self.queue.remove_all_for(function, language);
        if let DispatchState::Busy(in_flight) = &mut self.state {
            if in_flight.job.function == function && &in_flight.job.language == language {
                in_flight.discarding = true;
            }
        }
        if let Some(conn) = self.connections.get(language) {
            if let Err(err) = conn.try_send(Request::Cancel) {
                debug!(%language, error = %err, "cancel not delivered");
            }
        }
        info!(%function, %language, purged, "cancel requested");
        self.pump();
    }

    /// Stores a registration. A connected worker is told about it right away;
    /// otherwise it learns on connect.
    pub fn register(&mut self, key: ServiceKey, registration: ServiceRegistration) {
        let init = registration.init_job(&key);
        let connected = self.connections.contains_key(&key.language);
        debug!(service = %key, connected, "register");
        self.registry.register(key, registration);
        if connected {
            self.queue.enqueue(init);
        }
        self.pump();
    }

    pub fn unregister(&mut self, key: &ServiceKey) {
        if self.registry.unregister(key).is_some() {
            debug!(service = %key, "unregister");
        }
    }

    /// Restarts the worker for `language`.
    ///
    /// A forced restart tears down immediately, resolving any in-flight job
    /// for that language as unavailable. Otherwise the restart waits until
    /// no job is in flight.
    pub fn restart_service(&mut self, language: &WorkerLanguage, force: bool) {
        if !self.interpreters.contains_key(language) {
            warn!(%language, "restart requested for unknown language");
            return;
        }
        if !force && matches!(self.state, DispatchState::Busy(_)) {
            debug!(%language, "restart deferred until idle");
            self.deferred_restarts.insert(language.clone());
            return;
        }
        self.restart_now(language);
        self.pump();
    }

    /// Replaces interpreters and restarts each listed language.
    pub fn reconfigure(&mut self, languages: Vec<LanguageConfig>) {
        for config in languages {
            info!(language = %config.language, interpreter = %config.interpreter, "reconfigure");
            self.languages
                .entry(config.language.clone())
                .or_insert(LanguageState::Unconfigured);
            self.interpreters
                .insert(config.language.clone(), config.interpreter);
            self.restart_service(&config.language, false);
        }
    }

    // -----------------------------------------------------------------------
    // Prompt answers
    // -----------------------------------------------------------------------

    pub fn apply_fault_choice(&mut self, language: &WorkerLanguage, choice: FaultChoice) {
        let job = self.faulted.remove(language);
        info!(%language, ?choice, "recovering from worker fault");
        match choice {
            FaultChoice::Resume => {
                if let Some(job) = job {
                    self.resolve_unavailable(&job, reasons::FAULTED);
                }
                self.restart_now(language);
            }
            FaultChoice::Retry => {
                if let Some(job) = job.filter(|job| !job.is_init()) {
                    self.pending_retry.insert(language.clone(), job);
                }
                self.restart_now(language);
            }
            FaultChoice::Disable => {
                if let Some(job) = job {
                    self.resolve_unavailable(&job, reasons::FAULTED);
                }
                if let Some(mut process) = self.processes.remove(language) {
                    process.start_kill();
                }
                self.languages
                    .insert(language.clone(), LanguageState::Crashed);
            }
        }
        self.pump();
    }

    pub fn apply_disconnect_choice(&mut self, language: &WorkerLanguage, restart: bool) {
        let crashed = self.languages.get(language) == Some(&LanguageState::Crashed);
        if restart && crashed {
            self.restart_service(language, false);
        }
    }

    /// Questions raised since the last call.
    pub fn take_prompts(&mut self) -> Vec<Prompt> {
        std::mem::take(&mut self.prompts)
    }

    // -----------------------------------------------------------------------
    // Connection lifecycle
    // -----------------------------------------------------------------------

    /// Wraps an announced socket in a connection and attaches it.
    pub fn accept_worker(&mut self, worker: AnnouncedWorker) {
        let id = self.next_connection_id();
        debug!(conn_id = %id, language = %worker.language, peer = %worker.peer, "accepting worker");
        let conn = WorkerConnection::spawn(
            id,
            worker.language,
            worker.stream,
            &self.connection_config,
            self.inbound.clone(),
        );
        self.attach(conn);
    }

    /// Makes `conn` the live connection for its language, replacing any
    /// previous one, and replays that language's registrations.
    pub fn attach(&mut self, conn: WorkerConnection) {
        let language = conn.language.clone();
        if let Some(old) = self.connections.remove(&language) {
            info!(%language, old = %old.id, new = %conn.id, "replacing worker connection");
            self.release_current(old.id, reasons::RECONNECTED);
        }
        info!(%language, conn_id = %conn.id, "worker connected");
        self.connections.insert(language.clone(), conn);
        self.languages
            .insert(language.clone(), LanguageState::Connected);

        for init in self.registry.init_jobs_for(&language).into_iter().rev() {
            self.queue.enqueue(init);
        }
        if let Some(job) = self.pending_retry.remove(&language) {
            if self.queue.position(&job.key()).is_some() {
                debug!(%language, job_id = %job.id, "newer job already queued; dropping retry");
            } else {
                info!(%language, job_id = %job.id, "re-running job after restart");
                self.queue.enqueue(job);
            }
        }
        let _ = self
            .events
            .send(DispatcherEvent::WorkerConnected { language });
        self.pump();
    }

    pub fn on_connection_event(&mut self, inbound: InboundEvent) {
        let InboundEvent {
            conn_id,
            language,
            event,
        } = inbound;
        let current = self.connections.get(&language).map(|conn| conn.id);
        if current != Some(conn_id) {
            debug!(%conn_id, %language, "ignoring event from a stale connection");
            return;
        }
        match event {
            ConnectionEvent::Frame(envelope) => self.route(&language, conn_id, envelope),
            ConnectionEvent::Closed(reason) => self.connection_lost(&language, &reason),
        }
        self.pump();
    }

    /// Checks owned processes for early exit.
    pub fn poll_processes(&mut self) {
        let mut exited = Vec::new();
        for (language, process) in &mut self.processes {
            if let Some(status) = process.poll_exit() {
                exited.push((language.clone(), status));
            }
        }
        for (language, status) in exited {
            self.processes.remove(&language);
            if self.connections.contains_key(&language) {
                debug!(%language, %status, "worker process exited; waiting for its connection to close");
                continue;
            }
            if self.languages.get(&language) != Some(&LanguageState::Starting) {
                debug!(%language, %status, "worker process exited after its connection closed");
                continue;
            }
            warn!(%language, %status, "worker process exited before connecting");
            metrics::worker_crashed(&language);
            self.languages
                .insert(language.clone(), LanguageState::Crashed);
            if let Some(job) = self.pending_retry.remove(&language) {
                self.resolve_unavailable(&job, reasons::DISCONNECTED);
            }
        }
        self.pump();
    }

    /// Closes every connection and hands back the processes to terminate.
    ///
    /// Queued and in-flight jobs resolve as unavailable.
    pub fn shutdown(&mut self) -> Vec<WorkerProcess> {
        info!(
            connections = self.connections.len(),
            processes = self.processes.len(),
            queued = self.queue.len(),
            "shutting down dispatcher"
        );
        if let DispatchState::Busy(in_flight) = std::mem::take(&mut self.state) {
            if !in_flight.discarding && !in_flight.job.is_init() {
                self.resolve_unavailable(&in_flight.job, reasons::SHUTTING_DOWN);
            }
        }
        for job in self.queue.drain() {
            if !job.is_init() {
                self.resolve_unavailable(&job, reasons::SHUTTING_DOWN);
            }
        }
        let retries: Vec<Job> = self.pending_retry.drain().map(|(_, job)| job).collect();
        for job in retries {
            self.resolve_unavailable(&job, reasons::SHUTTING_DOWN);
        }
        self.connections.clear();
        self.deferred_restarts.clear();
        for state in self.languages.values_mut() {
            *state = LanguageState::ShuttingDown;
        }
        metrics::queue_depth(0);
        self.processes.drain().map(|(_, process)| process).collect()
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn status(&self) -> DispatcherStatus {
        DispatcherStatus {
            current: match &self.state {
                DispatchState::Idle => None,
                DispatchState::Busy(in_flight) => Some(in_flight.job.key()),
            },
            queued: self.queue.len(),
            port: self.port,
            languages: self.languages.clone(),
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DispatchState::Idle)
    }

    /// Removes and returns the head job, or nothing while a job is in flight.
    pub fn pop_if_idle(&mut self) -> Option<Job> {
        match self.state {
            DispatchState::Idle => self.queue.pop_front(),
            DispatchState::Busy(_) => None,
        }
    }

    #[must_use]
    pub fn language_state(&self, language: &WorkerLanguage) -> LanguageState {
        self.languages
            .get(language)
            .copied()
            .unwrap_or(LanguageState::Unconfigured)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Sends queued jobs until one is in flight or the queue is empty.
    fn pump(&mut self) {
        if self.is_idle() && !self.deferred_restarts.is_empty() {
            for language in std::mem::take(&mut self.deferred_restarts) {
                self.restart_now(&language);
            }
        }
        while let Some(job) = self.pop_if_idle() {
            self.send(job);
        }
        metrics::queue_depth(self.queue.len());
    }

    fn send(&mut self, job: Job) {
        let Some(conn) = self.connections.get(&job.language) else {
            if !job.is_init() {
                let reason = self.unavailable_reason(&job.language);
                self.resolve_unavailable(&job, &reason);
            }
            return;
        };
        match conn.try_send(Request::Job(job.to_envelope())) {
            Ok(()) => {
                debug!(
                    function = %job.function,
                    language = %job.language,
                    job_id = %job.id,
                    conn_id = %conn.id,
                    "job dispatched"
                );
                metrics::job_dispatched(&job.language);
                self.state = DispatchState::Busy(InFlight {
                    conn_id: conn.id,
                    job,
                    discarding: false,
                });
            }
            Err(err) => {
                warn!(language = %job.language, conn_id = %conn.id, error = %err, "job not dispatched");
                if !job.is_init() {
                    let reason = format!("The background worker is not accepting jobs: {err}.");
                    self.resolve_unavailable(&job, &reason);
                }
            }
        }
    }

    fn unavailable_reason(&self, language: &WorkerLanguage) -> String {
        match self.language_state(language) {
            LanguageState::Unconfigured => format!("{language} not configured."),
            LanguageState::Starting => format!("{language} worker has not connected yet."),
            LanguageState::Connected | LanguageState::Crashed => {
                format!("{language} worker is not running.")
            }
            LanguageState::ShuttingDown => format!("{language} worker is shutting down."),
        }
    }

    fn route(&mut self, language: &WorkerLanguage, conn_id: ConnectionId, envelope: Envelope) {
        let kind = envelope.classify();
        let in_flight = match &self.state {
            DispatchState::Busy(in_flight) if in_flight.conn_id == conn_id => in_flight,
            _ => {
                if let ResponseKind::Exception(fault) = kind {
                    self.worker_faulted(language, None, fault);
                } else {
                    warn!(%language, %conn_id, function = %envelope.function, "dropping frame with no job in flight");
                }
                return;
            }
        };

        if in_flight.discarding {
            match kind {
                ResponseKind::Exception(fault) => {
                    let _ = self.finish_current();
                    self.worker_faulted(language, None, fault);
                }
                kind if kind.is_terminal() => {
                    debug!(%language, function = %envelope.function, "cancelled job finished");
                    let _ = self.finish_current();
                }
                _ => {}
            }
            return;
        }

        match kind {
            ResponseKind::Init => {
                debug!(%language, module = %envelope.job_id, "worker loaded module");
                let _ = self.finish_current();
            }
            ResponseKind::Exception(fault) => {
                let job = self.finish_current();
                self.worker_faulted(language, job, fault);
            }
            ResponseKind::UnknownService => {
                if let Some(job) = self.finish_current() {
                    let reason = envelope.data.as_str().unwrap_or_default().to_string();
                    self.resolve_unavailable(&job, &reason);
                }
            }
            ResponseKind::BatchChunk { function } => {
                let key = ServiceKey::new(function, language.clone());
                match self.registry.get(&key) {
                    Some(registration) => {
                        registration.notify_result(&envelope.job_id, &envelope.data);
                    }
                    None => debug!(service = %key, "no registration for batch chunk"),
                }
            }
            ResponseKind::BatchDone { function } => {
                let _ = self.finish_current();
                let key = ServiceKey::new(function.clone(), language.clone());
                if let Some(registration) = self.registry.get(&key) {
                    registration.notify_batch_done(&function, language);
                }
                let _ = self.events.send(DispatcherEvent::BatchDone {
                    function,
                    language: language.clone(),
                });
            }
            ResponseKind::Result => {
                let _ = self.finish_current();
                let key = ServiceKey::new(base_function(&envelope.function), language.clone());
                match self.registry.get(&key) {
                    Some(registration) => {
                        registration.notify_result(&envelope.job_id, &envelope.data);
                    }
                    None => debug!(service = %key, "no registration for result"),
                }
            }
        }
    }

    /// Clears the in-flight job and returns it.
    fn finish_current(&mut self) -> Option<Job> {
        match std::mem::take(&mut self.state) {
            DispatchState::Busy(in_flight) => Some(in_flight.job),
            DispatchState::Idle => None,
        }
    }

    /// If the in-flight job went to `conn_id`, resolves it as unavailable and
    /// returns to idle.
    fn release_current(&mut self, conn_id: ConnectionId, reason: &str) {
        let owned = matches!(&self.state, DispatchState::Busy(in_flight) if in_flight.conn_id == conn_id);
        if !owned {
            return;
        }
        if let DispatchState::Busy(in_flight) = std::mem::take(&mut self.state) {
            if !in_flight.discarding && !in_flight.job.is_init() {
                self.resolve_unavailable(&in_flight.job, reason);
            }
        }
    }

    fn resolve_unavailable(&self, job: &Job, reason: &str) {
        if job.is_init() {
            return;
        }
        debug!(function = %job.function, language = %job.language, job_id = %job.id, reason, "job unavailable");
        metrics::job_unavailable(&job.language);
        let notice = Unavailable::for_job(job, reason);
        if let Some(registration) = self.registry.for_job(job) {
            registration.notify_unavailable(&notice);
        }
        let _ = self
            .events
            .send(DispatcherEvent::ServiceUnavailable(notice));
    }

    // -----------------------------------------------------------------------
    // Faults and restarts
    // -----------------------------------------------------------------------

    fn worker_faulted(&mut self, language: &WorkerLanguage, job: Option<Job>, fault: WorkerFault) {
        error!(
            %language,
            kind = %fault.kind,
            message = %fault.message,
            traceback = %fault.traceback,
            "worker raised an exception"
        );
        metrics::worker_crashed(language);
        if let Some(conn) = self.connections.remove(language) {
            self.release_current(conn.id, reasons::FAULTED);
        }
        self.languages
            .insert(language.clone(), LanguageState::Crashed);
        if let Some(job) = job {
            self.faulted.insert(language.clone(), job);
        }
        let _ = self
            .events
            .send(DispatcherEvent::faulted(language.clone(), &fault));
        self.prompts.push(Prompt::Faulted {
            language: language.clone(),
            fault,
        });
    }

    fn connection_lost(&mut self, language: &WorkerLanguage, reason: &CloseReason) {
        let Some(conn) = self.connections.remove(language) else {
            return;
        };
        warn!(%language, conn_id = %conn.id, %reason, "worker connection lost");
        metrics::worker_crashed(language);
        if matches!(reason, CloseReason::Protocol(_)) {
            metrics::protocol_error(language);
        }
        self.release_current(conn.id, reasons::DISCONNECTED);
        self.languages
            .insert(language.clone(), LanguageState::Crashed);
        let _ = self.events.send(DispatcherEvent::WorkerDisconnected {
            language: language.clone(),
            reason: reason.to_string(),
        });
        self.prompts.push(Prompt::Disconnected {
            language: language.clone(),
        });
    }

    /// Tears down the connection and process for `language` and launches a
    /// fresh worker.
    fn restart_now(&mut self, language: &WorkerLanguage) {
        info!(%language, "restarting worker");
        self.languages
            .insert(language.clone(), LanguageState::ShuttingDown);
        if let Some(conn) = self.connections.remove(language) {
            self.release_current(conn.id, reasons::RESTARTED);
        }
        if let Some(mut process) = self.processes.remove(language) {
            process.start_kill();
        }
        self.launch(language);
    }

    fn launch(&mut self, language: &WorkerLanguage) {
        let interpreter = self
            .interpreters
            .get(language)
            .cloned()
            .unwrap_or_default();
        match self.launcher.launch(language, &interpreter) {
            Ok(process) => {
                self.processes.insert(language.clone(), process);
                self.languages
                    .insert(language.clone(), LanguageState::Starting);
            }
            Err(err) => {
                warn!(%language, error = %err, "worker not started");
                self.languages
                    .insert(language.clone(), LanguageState::Unconfigured);
                if let Some(job) = self.pending_retry.remove(language) {
                    self.resolve_unavailable(&job, &err.to_string());
                }
            }
        }
    }

    fn next_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_conn_id);
        self.next_conn_id += 1;
        id
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
