//! `jobrelay` dispatcher: runs remote functions in long-lived worker
//! processes, one job at a time, over a checksummed framed TCP protocol.

pub mod logging;
pub mod network;
pub mod service;

pub use service::{
    AutoRecovery, DispatchError, DispatcherConfig, DispatcherEvent, DispatcherHandle,
    DispatcherService, DispatcherStatus, FaultChoice, LanguageConfig, LanguageState,
    RecoveryPrompt, ServiceRegistration, Unavailable,
};
