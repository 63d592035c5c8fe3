//! `jobrelay` core: framed job protocol, Adler-32 checksums, language
//! announcements, and the worker-side client.

pub mod client;
pub mod codec;
pub mod handshake;
pub mod hash;
pub mod messages;
pub mod types;

pub use codec::{DispatcherCodec, FrameHeader, ProtocolError, WorkerCodec};
pub use messages::{Envelope, MessageType, Request, ResponseKind, WorkerFault};
pub use types::{Job, JobKey, ServiceKey, WorkerLanguage};
