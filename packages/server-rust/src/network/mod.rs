//! Worker-facing networking: listener, per-connection tasks, shutdown control.

pub mod config;
pub mod connection;
pub mod listener;
pub mod shutdown;

pub use config::*;
pub use connection::*;
pub use listener::*;
pub use shutdown::*;
