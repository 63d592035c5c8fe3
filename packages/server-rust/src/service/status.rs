//! Read-only snapshot of dispatcher state, published after every step.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use jobrelay_core::{JobKey, WorkerLanguage};
use serde::Serialize;

/// Lifecycle of one language's worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageState {
    /// No usable interpreter. Jobs resolve as unavailable.
    Unconfigured,
    /// Process launched, waiting for it to connect back.
    Starting,
    /// A connection is live.
    Connected,
    /// The connection or process ended unexpectedly.
    Crashed,
    /// Being torn down for a restart or shutdown.
    ShuttingDown,
}

/// Point-in-time view of the dispatcher.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatcherStatus {
    /// Job awaiting a response, if any.
    pub current: Option<JobKey>,
    /// Jobs waiting in the queue.
    pub queued: usize,
    /// Port workers connect back to.
    pub port: u16,
    pub languages: BTreeMap<WorkerLanguage, LanguageState>,
}

impl DispatcherStatus {
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    #[must_use]
    pub fn language(&self, language: &str) -> Option<LanguageState> {
        self.languages.get(&WorkerLanguage::new(language)).copied()
    }
}

/// Lock-free publication point for [`DispatcherStatus`].
#[derive(Debug, Default)]
pub struct StatusBoard {
    current: ArcSwap<DispatcherStatus>,
}

impl StatusBoard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, status: DispatcherStatus) {
        self.current.store(Arc::new(status));
    }

    #[must_use]
    pub fn load(&self) -> Arc<DispatcherStatus> {
        self.current.load_full()
    }
}
