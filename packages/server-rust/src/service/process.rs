//! Worker subprocess launching and supervision.
//!
//! A worker is started as `interpreter <entry_point> <host> <port>` with its
//! stdout and stderr forwarded to ours. It connects back on its own; this
//! module only owns the OS process.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use jobrelay_core::WorkerLanguage;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Error starting a worker process.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("{0} not configured.")]
    NotConfigured(WorkerLanguage),
    #[error("interpreter {path:?} for {language} is not an executable file")]
    NotExecutable {
        language: WorkerLanguage,
        path: String,
    },
    #[error("failed to spawn {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

// ---------------------------------------------------------------------------
// Interpreter resolution
// ---------------------------------------------------------------------------

/// Resolves `interpreter` to an executable file.
///
/// Values containing a path separator are checked as given; bare names are
/// looked up in `PATH`.
///
/// # Errors
///
/// Returns `LaunchError::NotConfigured` for an empty value and
/// `LaunchError::NotExecutable` if no executable file is found.
pub fn resolve_interpreter(
    language: &WorkerLanguage,
    interpreter: &str,
) -> Result<PathBuf, LaunchError> {
    let interpreter = interpreter.trim();
    if interpreter.is_empty() {
        return Err(LaunchError::NotConfigured(language.clone()));
    }
    let not_executable = || LaunchError::NotExecutable {
        language: language.clone(),
        path: interpreter.to_string(),
    };

    let candidate = Path::new(interpreter);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return if is_executable(candidate) {
            Ok(candidate.to_path_buf())
        } else {
            Err(not_executable())
        };
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(interpreter))
                .find(|path| is_executable(path))
        })
        .ok_or_else(not_executable)
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ---------------------------------------------------------------------------
// WorkerProcess
// ---------------------------------------------------------------------------

/// Exclusively owned handle to one worker process.
///
/// The process is killed when the handle is dropped.
#[derive(Debug)]
pub struct WorkerProcess {
    language: WorkerLanguage,
    interpreter: PathBuf,
    child: Option<Child>,
    exited: bool,
}

impl WorkerProcess {
    /// Wraps a spawned child.
    #[must_use]
    pub fn new(language: WorkerLanguage, interpreter: PathBuf, child: Child) -> Self {
        Self {
            language,
            interpreter,
            child: Some(child),
            exited: false,
        }
    }

    /// A handle with no OS process behind it.
    #[must_use]
    pub fn detached(language: WorkerLanguage, interpreter: PathBuf) -> Self {
        Self {
            language,
            interpreter,
            child: None,
            exited: false,
        }
    }

    #[must_use]
    pub fn language(&self) -> &WorkerLanguage {
        &self.language
    }

    #[must_use]
    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Non-blocking liveness check. Returns the exit status the first time
    /// the process is seen to have exited.
    pub fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exited {
            return None;
        }
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exited = true;
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(language = %self.language, error = %err, "failed to poll worker process");
                None
            }
        }
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// Sends a kill signal without waiting.
    pub fn start_kill(&mut self) {
        self.exited = true;
        if let Some(child) = self.child.as_mut() {
            if let Err(err) = child.start_kill() {
                debug!(language = %self.language, error = %err, "kill failed");
            }
        }
    }

    /// Kills the process and waits up to `grace` for it to be reaped.
    pub async fn terminate(mut self, grace: Duration) {
        let language = self.language.clone();
        let pid = self.pid();
        self.start_kill();
        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(grace, child.wait()).await {
                Ok(Ok(status)) => debug!(%language, ?pid, %status, "worker process exited"),
                Ok(Err(err)) => warn!(%language, ?pid, error = %err, "failed to reap worker process"),
                Err(_) => warn!(%language, ?pid, "worker process did not exit within grace period"),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

/// Starts worker processes. The dispatcher depends on this seam rather than
/// on `tokio::process` directly.
pub trait Launcher: Send {
    /// Starts the worker for `language` with `interpreter`.
    ///
    /// # Errors
    ///
    /// Returns a `LaunchError` if the interpreter is invalid or cannot be
    /// spawned.
    fn launch(
        &mut self,
        language: &WorkerLanguage,
        interpreter: &str,
    ) -> Result<WorkerProcess, LaunchError>;
}

/// Launches real subprocesses pointed at the dispatcher's listener.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    entry_point: PathBuf,
    addr: SocketAddr,
}

impl ProcessLauncher {
    #[must_use]
    pub fn new(entry_point: PathBuf, addr: SocketAddr) -> Self {
        Self { entry_point, addr }
    }

    fn command(&self, interpreter: &Path) -> Command {
        let mut cmd = Command::new(interpreter);
        cmd.arg(&self.entry_point)
            .arg(self.addr.ip().to_string())
            .arg(self.addr.port().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        cmd
    }
}

impl Launcher for ProcessLauncher {
    fn launch(
        &mut self,
        language: &WorkerLanguage,
        interpreter: &str,
    ) -> Result<WorkerProcess, LaunchError> {
        let path = resolve_interpreter(language, interpreter)?;
        let child = self
            .command(&path)
            .spawn()
            .map_err(|source| LaunchError::Spawn {
                path: path.clone(),
                source,
            })?;
        let process = WorkerProcess::new(language.clone(), path, child);
        info!(
            %language,
            interpreter = %process.interpreter().display(),
            pid = process.pid(),
            "worker process started"
        );
        Ok(process)
    }
}
