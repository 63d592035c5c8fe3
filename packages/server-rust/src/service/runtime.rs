//! The dispatcher control task and the handle applications talk to.
//!
//! `DispatcherService::start` binds the worker listener, launches every
//! configured language, and spawns one control task that owns the
//! [`Dispatcher`]. Everything else (application calls, connection events,
//! announced workers, prompt answers, process polling) reaches that task
//! over channels, so dispatcher state is never shared.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use jobrelay_core::{Job, ServiceKey, WorkerLanguage};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use super::config::{DispatcherConfig, LanguageConfig};
use super::dispatcher::{Dispatcher, Prompt};
use super::events::DispatcherEvent;
use super::process::{Launcher, ProcessLauncher};
use super::recovery::{FaultChoice, RecoveryPrompt};
use super::registry::ServiceRegistration;
use super::status::{DispatcherStatus, StatusBoard};
use crate::network::{
    AnnouncedWorker, HealthState, InboundEvent, ShutdownController, WorkerListener,
};

/// Capacity of the application event broadcast.
const EVENT_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Errors and commands
// ---------------------------------------------------------------------------

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("dispatcher has stopped")]
    Stopped,
}

/// Application requests, applied in order by the control task.
#[derive(Debug)]
pub enum Command {
    Enqueue(Job),
    Cancel {
        function: String,
        language: WorkerLanguage,
    },
    Register {
        key: ServiceKey,
        registration: ServiceRegistration,
    },
    Unregister(ServiceKey),
    Restart {
        language: WorkerLanguage,
        force: bool,
    },
    Reconfigure(Vec<LanguageConfig>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
enum Answer {
    Fault {
        language: WorkerLanguage,
        choice: FaultChoice,
    },
    Disconnect {
        language: WorkerLanguage,
        restart: bool,
    },
}

// ---------------------------------------------------------------------------
// DispatcherHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable access to a running dispatcher.
///
/// Every method only queues a command, so all of them may be called from
/// inside a result callback.
#[derive(Clone)]
pub struct DispatcherHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<StatusBoard>,
    events: broadcast::Sender<DispatcherEvent>,
    shutdown: Arc<ShutdownController>,
    addr: SocketAddr,
}

impl DispatcherHandle {
    fn send(&self, command: Command) -> Result<(), DispatchError> {
        self.commands
            .send(command)
            .map_err(|_| DispatchError::Stopped)
    }

    /// Queues `function(data)` on the worker for `language`.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Stopped` once the control task has exited.
    pub fn enqueue(
        &self,
        function: impl Into<String>,
        language: impl Into<WorkerLanguage>,
        id: impl Into<String>,
        data: Value,
    ) -> Result<(), DispatchError> {
        self.enqueue_job(Job::new(function, language, id, data))
    }

    /// # Errors
    ///
    /// Returns `DispatchError::Stopped` once the control task has exited.
    pub fn enqueue_job(&self, job: Job) -> Result<(), DispatchError> {
        self.send(Command::Enqueue(job))
    }

    /// Drops queued `(function, language)` jobs and asks the worker to stop
    /// the running one. Cancelled jobs get no callback.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Stopped` once the control task has exited.
    pub fn request_cancel(
        &self,
        function: impl Into<String>,
        language: impl Into<WorkerLanguage>,
    ) -> Result<(), DispatchError> {
        self.send(Command::Cancel {
            function: function.into(),
            language: language.into(),
        })
    }

    /// # Errors
    ///
    /// Returns `DispatchError::Stopped` once the control task has exited.
    pub fn register(
        &self,
        key: ServiceKey,
        registration: ServiceRegistration,
    ) -> Result<(), DispatchError> {
        self.send(Command::Register { key, registration })
    }

    /// # Errors
    ///
    /// Returns `DispatchError::Stopped` once the control task has exited.
    pub fn unregister(&self, key: ServiceKey) -> Result<(), DispatchError> {
        self.send(Command::Unregister(key))
    }

    /// # Errors
    ///
    /// Returns `DispatchError::Stopped` once the control task has exited.
    pub fn restart_service(
        &self,
        language: impl Into<WorkerLanguage>,
        force: bool,
    ) -> Result<(), DispatchError> {
        self.send(Command::Restart {
            language: language.into(),
            force,
        })
    }

    /// # Errors
    ///
    /// Returns `DispatchError::Stopped` once the control task has exited.
    pub fn reconfigure(&self, languages: Vec<LanguageConfig>) -> Result<(), DispatchError> {
        self.send(Command::Reconfigure(languages))
    }

    /// Closes every connection, terminates every worker process, and waits
    /// for the control task to finish.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::Stopped` if the dispatcher had already stopped.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let (ack, done) = oneshot::channel();
        self.send(Command::Shutdown(ack))?;
        done.await.map_err(|_| DispatchError::Stopped)
    }

    /// Most recently published snapshot.
    #[must_use]
    pub fn status(&self) -> Arc<DispatcherStatus> {
        self.status.load()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<DispatcherEvent> {
        self.events.subscribe()
    }

    /// Address workers connect back to.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn health(&self) -> HealthState {
        self.shutdown.health_state()
    }
}

// ---------------------------------------------------------------------------
// DispatcherService
// ---------------------------------------------------------------------------

/// A running dispatcher.
pub struct DispatcherService {
    handle: DispatcherHandle,
    task: JoinHandle<()>,
}

impl DispatcherService {
    /// Starts the dispatcher with real worker subprocesses.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker listener cannot be bound.
    pub async fn start(
        config: DispatcherConfig,
        prompt: Arc<dyn RecoveryPrompt>,
    ) -> anyhow::Result<Self> {
        let entry_point = config.worker_entry_point.clone();
        Self::start_with_launcher(config, prompt, move |addr| {
            Box::new(ProcessLauncher::new(entry_point, addr)) as Box<dyn Launcher>
        })
        .await
    }

    /// Starts the dispatcher with a custom launcher, built once the listener
    /// address is known.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker listener cannot be bound.
    pub async fn start_with_launcher<F>(
        config: DispatcherConfig,
        prompt: Arc<dyn RecoveryPrompt>,
        make_launcher: F,
    ) -> anyhow::Result<Self>
    where
        F: FnOnce(SocketAddr) -> Box<dyn Launcher>,
    {
        let shutdown = Arc::new(ShutdownController::new());

        let mut listener = WorkerListener::new(config.listener.clone());
        let addr = listener.start().await?;
        let (announced_tx, announced_rx) = mpsc::unbounded_channel();
        let listener_shutdown = shutdown.shutdown_receiver();
        let listener_task = tokio::spawn(async move {
            if let Err(err) = listener.serve(announced_tx, listener_shutdown).await {
                error!(error = %err, "worker listener failed");
            }
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let mut dispatcher = Dispatcher::new(
            make_launcher(addr),
            config.connection.clone(),
            inbound_tx,
            events_tx.clone(),
            addr.port(),
        );
        dispatcher.start(&config.languages);

        let status = Arc::new(StatusBoard::new());
        status.publish(dispatcher.status());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (answers_tx, answers_rx) = mpsc::unbounded_channel();
        let control = ControlTask {
            dispatcher,
            commands: commands_rx,
            inbound: inbound_rx,
            announced: announced_rx,
            answers_tx,
            answers: answers_rx,
            prompt,
            status: Arc::clone(&status),
            shutdown: Arc::clone(&shutdown),
            shutdown_grace: config.shutdown_grace,
            poll_interval: config.process_poll_interval,
        };
        shutdown.set_ready();
        info!(%addr, languages = config.languages.len(), "dispatcher started");
        let task = tokio::spawn(control.run(listener_task));

        Ok(Self {
            handle: DispatcherHandle {
                commands: commands_tx,
                status,
                events: events_tx,
                shutdown,
                addr,
            },
            task,
        })
    }

    #[must_use]
    pub fn handle(&self) -> DispatcherHandle {
        self.handle.clone()
    }

    /// Waits for the control task to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the control task panicked.
    pub async fn wait(self) -> anyhow::Result<()> {
        drop(self.handle);
        self.task.await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ControlTask
// ---------------------------------------------------------------------------

struct ControlTask {
    dispatcher: Dispatcher,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: mpsc::UnboundedReceiver<InboundEvent>,
    announced: mpsc::UnboundedReceiver<AnnouncedWorker>,
    answers_tx: mpsc::UnboundedSender<Answer>,
    answers: mpsc::UnboundedReceiver<Answer>,
    prompt: Arc<dyn RecoveryPrompt>,
    status: Arc<StatusBoard>,
    shutdown: Arc<ShutdownController>,
    shutdown_grace: Duration,
    poll_interval: Duration,
}

impl ControlTask {
    async fn run(mut self, listener_task: JoinHandle<()>) {
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        poll.tick().await;

        let ack = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => break Some(ack),
                    Some(command) => self.apply(command),
                    None => break None,
                },
                Some(event) = self.inbound.recv() => {
                    self.dispatcher.on_connection_event(event);
                }
                Some(worker) = self.announced.recv() => {
                    self.dispatcher.accept_worker(worker);
                }
                Some(answer) = self.answers.recv() => self.answer(answer),
                _ = poll.tick() => self.dispatcher.poll_processes(),
            }
            self.spawn_prompts();
            self.status.publish(self.dispatcher.status());
        };

        self.stop(listener_task).await;
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Enqueue(job) => self.dispatcher.enqueue(job),
            Command::Cancel { function, language } => {
                self.dispatcher.request_cancel(&function, &language);
            }
            Command::Register { key, registration } => {
                self.dispatcher.register(key, registration);
            }
            Command::Unregister(key) => self.dispatcher.unregister(&key),
            Command::Restart { language, force } => {
                self.dispatcher.restart_service(&language, force);
            }
            Command::Reconfigure(languages) => self.dispatcher.reconfigure(languages),
            Command::Shutdown(_) => {}
        }
    }

    fn answer(&mut self, answer: Answer) {
        match answer {
            Answer::Fault { language, choice } => {
                self.dispatcher.apply_fault_choice(&language, choice);
            }
            Answer::Disconnect { language, restart } => {
                self.dispatcher.apply_disconnect_choice(&language, restart);
            }
        }
    }

    /// Asks the recovery prompt about each new fault or disconnect, each in
    /// its own task.
    fn spawn_prompts(&mut self) {
        for prompt in self.dispatcher.take_prompts() {
            let recovery = Arc::clone(&self.prompt);
            let answers = self.answers_tx.clone();
            tokio::spawn(async move {
                let answer = match prompt {
                    Prompt::Faulted { language, fault } => {
                        let choice = recovery.worker_faulted(&language, &fault).await;
                        Answer::Fault { language, choice }
                    }
                    Prompt::Disconnected { language } => {
                        let restart = recovery.worker_disconnected(&language).await;
                        Answer::Disconnect { language, restart }
                    }
                };
                let _ = answers.send(answer);
            });
        }
    }

    async fn stop(mut self, listener_task: JoinHandle<()>) {
        self.shutdown.trigger_shutdown();
        let processes = self.dispatcher.shutdown();
        self.status.publish(self.dispatcher.status());

        let grace = self.shutdown_grace;
        futures_util::future::join_all(
            processes
                .into_iter()
                .map(|process| process.terminate(grace)),
        )
        .await;
        if let Err(err) = listener_task.await {
            debug!(error = %err, "worker listener task ended abnormally");
        }

        self.shutdown.set_stopped();
        info!("dispatcher stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use jobrelay_core::client::{self, WorkerSession};
    use jobrelay_core::{Envelope, Request, WorkerFault};
    use serde_json::json;

    use super::*;
    use crate::service::process::{LaunchError, WorkerProcess};
    use crate::service::recovery::AutoRecovery;
    use crate::service::registry::Unavailable;
    use crate::service::status::LanguageState;

    const WAIT: Duration = Duration::from_secs(5);

    /// Pretends to launch a worker; tests connect workers themselves.
    struct NoopLauncher;

    impl Launcher for NoopLauncher {
        fn launch(
            &mut self,
            language: &WorkerLanguage,
            interpreter: &str,
        ) -> Result<WorkerProcess, LaunchError> {
            if interpreter.is_empty() {
                return Err(LaunchError::NotConfigured(language.clone()));
            }
            Ok(WorkerProcess::detached(
                language.clone(),
                PathBuf::from(interpreter),
            ))
        }
    }

    #[derive(Debug, PartialEq)]
    enum Callback {
        Result(String, Value),
        Unavailable(Unavailable),
        BatchDone(String),
    }

    fn recording_registration(
        tx: mpsc::UnboundedSender<Callback>,
    ) -> ServiceRegistration {
        let on_unavailable = tx.clone();
        let on_batch_done = tx.clone();
        ServiceRegistration::new("/plugins/lint", "Linter", move |id, data| {
            let _ = tx.send(Callback::Result(id.to_string(), data.clone()));
        })
        .on_unavailable(move |notice| {
            let _ = on_unavailable.send(Callback::Unavailable(notice.clone()));
        })
        .on_batch_done(move |function, _| {
            let _ = on_batch_done.send(Callback::BatchDone(function.to_string()));
        })
    }

    async fn start(languages: &[(&str, &str)], recovery: AutoRecovery) -> DispatcherService {
        let config = DispatcherConfig {
            languages: languages
                .iter()
                .map(|(lang, interp)| LanguageConfig::new(*lang, *interp))
                .collect(),
            process_poll_interval: Duration::from_millis(50),
            ..DispatcherConfig::default()
        };
        DispatcherService::start_with_launcher(config, Arc::new(recovery), |_| {
            Box::new(NoopLauncher) as Box<dyn Launcher>
        })
        .await
        .unwrap()
    }

    async fn next_callback(rx: &mut mpsc::UnboundedReceiver<Callback>) -> Callback {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for callback")
            .expect("callback channel closed")
    }

    async fn next_job(worker: &mut WorkerSession) -> Envelope {
        loop {
            let request = tokio::time::timeout(WAIT, worker.next_request())
                .await
                .expect("timed out waiting for request")
                .expect("dispatcher closed the connection")
                .expect("bad frame");
            if let Request::Job(envelope) = request {
                return envelope;
            }
        }
    }

    async fn next_request(worker: &mut WorkerSession) -> Request {
        tokio::time::timeout(WAIT, worker.next_request())
            .await
            .expect("timed out waiting for request")
            .expect("dispatcher closed the connection")
            .expect("bad frame")
    }

    /// Connects a worker and acknowledges the `INIT` it is sent first.
    async fn connect_ready(handle: &DispatcherHandle, language: &str) -> WorkerSession {
        let mut worker = WorkerSession::connect(handle.addr(), language.into())
            .await
            .unwrap();
        let init = next_job(&mut worker).await;
        assert_eq!(init.function, "INIT");
        worker.respond(client::init_ack(&init)).await.unwrap();
        worker
    }

    async fn wait_for_state(handle: &DispatcherHandle, language: &str, state: LanguageState) {
        tokio::time::timeout(WAIT, async {
            while handle.status().language(language) != Some(state) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for language state");
    }

    #[tokio::test]
    async fn lint_round_trip_over_tcp() {
        let service = start(&[("py", "/usr/bin/python3")], AutoRecovery::default()).await;
        let handle = service.handle();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle
            .register(ServiceKey::new("lint", "py"), recording_registration(tx))
            .unwrap();

        let mut worker = WorkerSession::connect(handle.addr(), "py".into())
            .await
            .unwrap();
        let init = next_job(&mut worker).await;
        assert_eq!(init, Envelope::new("INIT", "lint", json!(["/plugins/lint", "Linter"])));
        worker.respond(client::init_ack(&init)).await.unwrap();

        handle
            .enqueue("lint", "py", "/a.py", json!(["code..."]))
            .unwrap();
        let job = next_job(&mut worker).await;
        assert_eq!(job, Envelope::new("lint", "/a.py", json!(["code..."])));
        worker
            .respond(client::result(&job, json!([["line 3: unused import"]])))
            .await
            .unwrap();

        assert_eq!(
            next_callback(&mut rx).await,
            Callback::Result("/a.py".into(), json!([["line 3: unused import"]]))
        );
        assert_eq!(handle.health(), HealthState::Ready);

        handle.shutdown().await.unwrap();
        assert_eq!(handle.health(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn unconfigured_language_resolves_unavailable() {
        let service = start(&[("rb", "")], AutoRecovery::default()).await;
        let handle = service.handle();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle
            .register(ServiceKey::new("lint", "rb"), recording_registration(tx))
            .unwrap();
        handle.enqueue("lint", "rb", "/a.rb", json!([])).unwrap();

        match next_callback(&mut rx).await {
            Callback::Unavailable(notice) => {
                assert_eq!(notice.job_id, "/a.rb");
                assert_eq!(notice.reason, "rb not configured.");
            }
            other => panic!("unexpected callback {other:?}"),
        }
        assert_eq!(handle.status().language("rb"), Some(LanguageState::Unconfigured));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn batch_stream_and_cancel() {
        let service = start(&[("py", "/usr/bin/python3")], AutoRecovery::default()).await;
        let handle = service.handle();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle
            .register(ServiceKey::new("style", "py"), recording_registration(tx))
            .unwrap();
        let mut worker = connect_ready(&handle, "py").await;

        handle
            .enqueue("batch_style", "py", "", json!([["/a.py"], ["/b.py"]]))
            .unwrap();
        let job = next_job(&mut worker).await;
        worker
            .respond(client::batch_chunk(&job, "/a.py", json!([1])))
            .await
            .unwrap();
        worker
            .respond(client::batch_chunk(&job, "/b.py", json!([2])))
            .await
            .unwrap();
        worker.respond(client::batch_done(&job)).await.unwrap();

        assert_eq!(
            next_callback(&mut rx).await,
            Callback::Result("/a.py".into(), json!([1]))
        );
        assert_eq!(
            next_callback(&mut rx).await,
            Callback::Result("/b.py".into(), json!([2]))
        );
        assert_eq!(next_callback(&mut rx).await, Callback::BatchDone("style".into()));

        // A cancelled batch: late chunks and the sentinel are swallowed.
        handle.enqueue("batch_style", "py", "", json!([])).unwrap();
        let job = next_job(&mut worker).await;
        handle.request_cancel("batch_style", "py").unwrap();
        assert_eq!(next_request(&mut worker).await, Request::Cancel);
        worker
            .respond(client::batch_chunk(&job, "/late.py", json!([9])))
            .await
            .unwrap();
        worker.respond(client::batch_done(&job)).await.unwrap();

        handle.enqueue("style", "py", "/c.py", json!([])).unwrap();
        let next = next_job(&mut worker).await;
        worker.respond(client::result(&next, json!([3]))).await.unwrap();
        assert_eq!(
            next_callback(&mut rx).await,
            Callback::Result("/c.py".into(), json!([3]))
        );

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn crash_mid_job_resolves_and_prompts() {
        let recovery = AutoRecovery {
            on_fault: FaultChoice::Resume,
            restart_on_disconnect: false,
        };
        let service = start(&[("py", "/usr/bin/python3")], recovery).await;
        let handle = service.handle();
        let mut events = handle.subscribe();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle
            .register(ServiceKey::new("lint", "py"), recording_registration(tx))
            .unwrap();
        let mut worker = connect_ready(&handle, "py").await;

        handle.enqueue("lint", "py", "/a.py", json!([])).unwrap();
        let _job = next_job(&mut worker).await;
        worker.close().await.unwrap();

        match next_callback(&mut rx).await {
            Callback::Unavailable(notice) => {
                assert_eq!(notice.job_id, "/a.py");
                assert_eq!(
                    notice.reason,
                    "The background worker disconnected for an unknown reason."
                );
            }
            other => panic!("unexpected callback {other:?}"),
        }
        wait_for_state(&handle, "py", LanguageState::Crashed).await;

        let disconnected = tokio::time::timeout(WAIT, async {
            loop {
                if let Ok(DispatcherEvent::WorkerDisconnected { language, .. }) = events.recv().await {
                    return language;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(disconnected.as_str(), "py");

        // The prompt said not to restart.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.status().language("py"), Some(LanguageState::Crashed));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn fault_retry_reruns_job_on_new_worker() {
        let recovery = AutoRecovery {
            on_fault: FaultChoice::Retry,
            restart_on_disconnect: true,
        };
        let service = start(&[("py", "/usr/bin/python3")], recovery).await;
        let handle = service.handle();
        let (tx, mut rx) = mpsc::unbounded_channel();
        handle
            .register(ServiceKey::new("lint", "py"), recording_registration(tx))
            .unwrap();
        let mut worker = connect_ready(&handle, "py").await;

        handle.enqueue("lint", "py", "/a.py", json!(["v1"])).unwrap();
        let _job = next_job(&mut worker).await;
        worker
            .respond(client::exception("ValueError", "boom", "Traceback ..."))
            .await
            .unwrap();
        drop(worker);
        wait_for_state(&handle, "py", LanguageState::Starting).await;

        let mut worker = connect_ready(&handle, "py").await;
        let retried = next_job(&mut worker).await;
        assert_eq!(retried, Envelope::new("lint", "/a.py", json!(["v1"])));
        worker.respond(client::result(&retried, json!([]))).await.unwrap();
        assert_eq!(
            next_callback(&mut rx).await,
            Callback::Result("/a.py".into(), json!([]))
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn fault_event_carries_exception_details() {
        let service = start(&[("py", "/usr/bin/python3")], AutoRecovery::default()).await;
        let handle = service.handle();
        let mut events = handle.subscribe();
        let (tx, _rx) = mpsc::unbounded_channel();
        handle
            .register(ServiceKey::new("lint", "py"), recording_registration(tx))
            .unwrap();
        let mut worker = connect_ready(&handle, "py").await;
        worker
            .respond(client::exception("KeyError", "'x'", "tb"))
            .await
            .unwrap();

        let expected = DispatcherEvent::faulted(
            "py".into(),
            &WorkerFault {
                kind: "KeyError".into(),
                message: "'x'".into(),
                traceback: "tb".into(),
            },
        );
        let seen = tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if event == expected => return true,
                    Ok(_) => {}
                    Err(_) => return false,
                }
            }
        })
        .await
        .unwrap();
        assert!(seen);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn handle_errors_after_stop() {
        let service = start(&[], AutoRecovery::default()).await;
        let handle = service.handle();
        handle.shutdown().await.unwrap();
        service.wait().await.unwrap();

        assert_eq!(
            handle.enqueue("lint", "py", "/a", json!([])),
            Err(DispatchError::Stopped)
        );
        assert_eq!(handle.shutdown().await, Err(DispatchError::Stopped));
    }

    #[tokio::test]
    async fn status_reports_listener_port() {
        let service = start(&[("py", "/usr/bin/python3")], AutoRecovery::default()).await;
        let handle = service.handle();
        let status = handle.status();
        assert_eq!(status.port, handle.addr().port());
        assert_eq!(status.language("py"), Some(LanguageState::Starting));
        assert!(status.is_idle());
        handle.shutdown().await.unwrap();
    }
}
