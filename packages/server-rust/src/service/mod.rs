//! Job dispatch: queueing, service registrations, worker supervision.
//!
//! 1. **Queue** (`queue`): pending jobs, de-duplicated by `(function, language, id)`
//! 2. **Registry** (`registry`): per-`(function, language)` module and callbacks
//! 3. **Processes** (`process`): launching and terminating worker interpreters
//! 4. **Dispatcher** (`dispatcher`): the single-job state machine
//! 5. **Runtime** (`runtime`): the control task and `DispatcherHandle`

pub mod config;
pub mod dispatcher;
pub mod events;
pub mod metrics;
pub mod process;
pub mod queue;
pub mod recovery;
pub mod registry;
pub mod runtime;
pub mod status;

pub use config::{DispatcherConfig, LanguageConfig};
pub use dispatcher::{Dispatcher, Prompt};
pub use events::DispatcherEvent;
pub use process::{LaunchError, Launcher, ProcessLauncher, WorkerProcess};
pub use queue::{EnqueueOutcome, JobQueue};
pub use recovery::{AutoRecovery, FaultChoice, RecoveryPrompt};
pub use registry::{ServiceRegistration, ServiceRegistry, Unavailable};
pub use runtime::{Command, DispatchError, DispatcherHandle, DispatcherService};
pub use status::{DispatcherStatus, LanguageState, StatusBoard};
