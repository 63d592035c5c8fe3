//! Worker connections: one accepted socket per language.
//!
//! Each connection owns a reader task that decodes response frames and a
//! writer task that drains a bounded outbound channel. Both report to the
//! dispatcher through a single unbounded event channel, tagged with the
//! connection id so events from a replaced connection can be told apart.

use std::fmt;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use jobrelay_core::{DispatcherCodec, Envelope, ProtocolError, Request, WorkerLanguage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use super::config::ConnectionConfig;

/// Unique identifier for a connection, assigned by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a connection ended.
#[derive(Debug, thiserror::Error)]
pub enum CloseReason {
    /// The worker closed the socket.
    #[error("connection closed by worker")]
    Eof,
    /// A frame could not be decoded; the stream is no longer trusted.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Writing to the socket failed.
    #[error("write failed: {0}")]
    Write(ProtocolError),
}

/// Something that happened on a worker connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    Frame(Envelope),
    Closed(CloseReason),
}

/// A [`ConnectionEvent`] tagged with its origin.
#[derive(Debug)]
pub struct InboundEvent {
    pub conn_id: ConnectionId,
    pub language: WorkerLanguage,
    pub event: ConnectionEvent,
}

/// Error returned when a request cannot be handed to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// The outbound channel is full.
    #[error("outbound channel full")]
    Full,
    /// The writer has exited; the connection is gone.
    #[error("connection closed")]
    Disconnected,
}

/// Live connection to one worker.
///
/// Dropping the connection aborts its reader and writer tasks, which closes
/// the socket.
pub struct WorkerConnection {
    pub id: ConnectionId,
    pub language: WorkerLanguage,
    pub connected_at: Instant,
    tx: mpsc::Sender<Request>,
    tasks: Vec<JoinHandle<()>>,
}

impl WorkerConnection {
    /// Splits `stream` and spawns the reader and writer tasks.
    #[must_use]
    pub fn spawn(
        id: ConnectionId,
        language: WorkerLanguage,
        stream: TcpStream,
        config: &ConnectionConfig,
        events: mpsc::UnboundedSender<InboundEvent>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Request>(config.outbound_channel_capacity);

        let mut frames = FramedRead::new(
            read_half,
            DispatcherCodec::with_max_frame_len(config.max_frame_len),
        );
        let reader_events = events.clone();
        let reader_language = language.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match frames.next().await {
                    Some(Ok(envelope)) => {
                        let event = InboundEvent {
                            conn_id: id,
                            language: reader_language.clone(),
                            event: ConnectionEvent::Frame(envelope),
                        };
                        if reader_events.send(event).is_err() {
                            return;
                        }
                    }
                    Some(Err(err)) => break CloseReason::Protocol(err),
                    None => break CloseReason::Eof,
                }
            };
            debug!(conn_id = %id, language = %reader_language, %reason, "reader finished");
            let _ = reader_events.send(InboundEvent {
                conn_id: id,
                language: reader_language,
                event: ConnectionEvent::Closed(reason),
            });
        });

        let mut sink = FramedWrite::new(write_half, DispatcherCodec::new());
        let writer_language = language.clone();
        let writer = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if let Err(err) = sink.send(request).await {
                    warn!(conn_id = %id, language = %writer_language, error = %err, "write failed");
                    let _ = events.send(InboundEvent {
                        conn_id: id,
                        language: writer_language,
                        event: ConnectionEvent::Closed(CloseReason::Write(err)),
                    });
                    return;
                }
            }
        });

        Self {
            id,
            language,
            connected_at: Instant::now(),
            tx,
            tasks: vec![reader, writer],
        }
    }

    /// Creates a connection without a socket. Requests end up on the returned
    /// receiver.
    #[must_use]
    pub fn detached(
        id: ConnectionId,
        language: WorkerLanguage,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Request>) {
        let (tx, rx) = mpsc::channel(capacity);
        let conn = Self {
            id,
            language,
            connected_at: Instant::now(),
            tx,
            tasks: Vec::new(),
        };
        (conn, rx)
    }

    /// Hands `request` to the writer without blocking.
    ///
    /// # Errors
    ///
    /// Returns `SendError::Full` if the outbound channel is at capacity and
    /// `SendError::Disconnected` if the writer has exited.
    pub fn try_send(&self, request: Request) -> Result<(), SendError> {
        self.tx.try_send(request).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }

    /// Returns `false` once the writer side has gone away.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConnection")
            .field("id", &self.id)
            .field("language", &self.language)
            .finish_non_exhaustive()
    }
}

impl Drop for WorkerConnection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
