//! Decisions taken after a worker faults or disconnects.
//!
//! The dispatcher never waits on these itself: each question runs in its
//! own task and the answer is fed back as a command.

use std::str::FromStr;

use async_trait::async_trait;
use jobrelay_core::{WorkerFault, WorkerLanguage};

/// What to do after a worker reported an unhandled exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultChoice {
    /// Give up on the failed job and restart the worker.
    #[default]
    Resume,
    /// Restart the worker and run the failed job again.
    Retry,
    /// Leave the language off until explicitly restarted.
    Disable,
}

impl FromStr for FaultChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "resume" => Ok(Self::Resume),
            "retry" => Ok(Self::Retry),
            "disable" => Ok(Self::Disable),
            other => Err(format!(
                "unknown fault choice '{other}', expected resume, retry or disable"
            )),
        }
    }
}

/// Asks whoever operates the dispatcher how to recover.
#[async_trait]
pub trait RecoveryPrompt: Send + Sync + 'static {
    /// Called once per `EXCEPTION` response.
    async fn worker_faulted(&self, language: &WorkerLanguage, fault: &WorkerFault) -> FaultChoice;

    /// Called once per unexpected disconnect. `true` restarts the worker.
    async fn worker_disconnected(&self, language: &WorkerLanguage) -> bool;
}

/// Answers every prompt with a fixed policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoRecovery {
    pub on_fault: FaultChoice,
    pub restart_on_disconnect: bool,
}

impl Default for AutoRecovery {
    fn default() -> Self {
        Self {
            on_fault: FaultChoice::Resume,
            restart_on_disconnect: true,
        }
    }
}

#[async_trait]
impl RecoveryPrompt for AutoRecovery {
    async fn worker_faulted(&self, _language: &WorkerLanguage, _fault: &WorkerFault) -> FaultChoice {
        self.on_fault
    }

    async fn worker_disconnected(&self, _language: &WorkerLanguage) -> bool {
        self.restart_on_disconnect
    }
}
