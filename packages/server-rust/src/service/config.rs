use std::path::PathBuf;
use std::time::Duration;

use jobrelay_core::WorkerLanguage;

use crate::network::{ConnectionConfig, ListenerConfig};

/// Interpreter used to run the worker for one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LanguageConfig {
    pub language: WorkerLanguage,
    /// Executable path or bare command name resolved through `PATH`.
    /// Empty means the language is not configured.
    pub interpreter: String,
}

impl LanguageConfig {
    #[must_use]
    pub fn new(language: impl Into<WorkerLanguage>, interpreter: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            interpreter: interpreter.into(),
        }
    }
}

/// Dispatcher-level configuration.
///
/// Languages are started in the order listed.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listener: ListenerConfig,
    pub connection: ConnectionConfig,
    /// Script or program passed as the first argument to every interpreter.
    pub worker_entry_point: PathBuf,
    pub languages: Vec<LanguageConfig>,
    /// How long shutdown waits for a terminated worker process to exit.
    pub shutdown_grace: Duration,
    /// How often owned worker processes are checked for early exit.
    pub process_poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            connection: ConnectionConfig::default(),
            worker_entry_point: PathBuf::new(),
            languages: Vec::new(),
            shutdown_grace: Duration::from_secs(2),
            process_poll_interval: Duration::from_secs(1),
        }
    }
}
