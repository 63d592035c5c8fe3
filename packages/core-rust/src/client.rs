//! Worker half of the protocol.
//!
//! A worker connects back to the dispatcher, announces its language, then
//! serves requests one at a time:
//!
//! ```no_run
//! # async fn run() -> Result<(), jobrelay_core::ProtocolError> {
//! use jobrelay_core::client::{self, WorkerSession};
//! use jobrelay_core::messages::Request;
//!
//! let mut session = WorkerSession::connect(("127.0.0.1", 4000), "Python3".into()).await?;
//! while let Some(request) = session.next_request().await {
//!     if let Request::Job(job) = request? {
//!         session.respond(client::result(&job, serde_json::json!([]))).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;

use crate::codec::{ProtocolError, WorkerCodec};
use crate::handshake::encode_announcement;
use crate::messages::{Envelope, Request, BATCH_DONE, EXCEPTION, INIT, UNKNOWN_SERVICE};
use crate::types::WorkerLanguage;

/// An established worker connection.
pub struct WorkerSession {
    framed: Framed<TcpStream, WorkerCodec>,
    language: WorkerLanguage,
}

impl WorkerSession {
    /// Connects to the dispatcher and sends the language announcement.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection fails or the language name cannot
    /// be announced.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        language: WorkerLanguage,
    ) -> Result<Self, ProtocolError> {
        let announcement = encode_announcement(&language)?;
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        stream.write_all(&announcement).await?;
        Ok(Self {
            framed: Framed::new(stream, WorkerCodec::new()),
            language,
        })
    }

    #[must_use]
    pub fn language(&self) -> &WorkerLanguage {
        &self.language
    }

    /// Waits for the next request. Returns `None` once the dispatcher closes
    /// the connection.
    pub async fn next_request(&mut self) -> Option<Result<Request, ProtocolError>> {
        self.framed.next().await
    }

    /// Sends one response frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be encoded or the write fails.
    pub async fn respond(&mut self, envelope: Envelope) -> Result<(), ProtocolError> {
        self.framed.send(envelope).await
    }

    /// Writes raw bytes, bypassing the codec. Useful to simulate corruption.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.framed.get_mut().write_all(bytes).await?;
        Ok(())
    }

    /// Shuts the connection down.
    ///
    /// # Errors
    ///
    /// Returns an error if buffered frames cannot be flushed.
    pub async fn close(mut self) -> Result<(), ProtocolError> {
        self.framed.flush().await?;
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reply builders
// ---------------------------------------------------------------------------

/// Plain single-shot result for `job`.
#[must_use]
pub fn result(job: &Envelope, data: Value) -> Envelope {
    Envelope::new(job.function.clone(), job.job_id.clone(), data)
}

/// Acknowledgement of an `INIT` job.
#[must_use]
pub fn init_ack(job: &Envelope) -> Envelope {
    Envelope::new(INIT, job.job_id.clone(), Value::String("ok".into()))
}

/// One streamed result of a batch job, attributed to `item_id`.
#[must_use]
pub fn batch_chunk(job: &Envelope, item_id: impl Into<String>, data: Value) -> Envelope {
    Envelope::new(job.function.clone(), item_id, data)
}

/// Terminal sentinel of a batch job.
#[must_use]
pub fn batch_done(job: &Envelope) -> Envelope {
    Envelope::new(
        job.function.clone(),
        job.job_id.clone(),
        Value::String(BATCH_DONE.into()),
    )
}

/// Reply for a function the worker has no module for.
#[must_use]
pub fn unknown_service(job: &Envelope) -> Envelope {
    Envelope::new(
        job.function.clone(),
        job.job_id.clone(),
        Value::String(UNKNOWN_SERVICE.into()),
    )
}

/// Fault report; the worker is expected to close the connection afterwards.
#[must_use]
pub fn exception(kind: &str, message: &str, traceback: &str) -> Envelope {
    Envelope::new(
        EXCEPTION,
        "?",
        Value::Array(vec![
            Value::String(kind.into()),
            Value::String(message.into()),
            Value::String(traceback.into()),
        ]),
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::{Decoder, FramedWrite};

    use super::*;
    use crate::codec::DispatcherCodec;
    use crate::handshake::{parse_announcement, ANNOUNCE_LEN};
    use crate::messages::ResponseKind;

    #[test]
    fn reply_builders_classify_as_expected() {
        let job = Envelope::new("batch_style", "", json!([]));
        assert_eq!(
            batch_chunk(&job, "/a.py", json!([1])).classify(),
            ResponseKind::BatchChunk {
                function: "style".into()
            }
        );
        assert_eq!(
            batch_done(&job).classify(),
            ResponseKind::BatchDone {
                function: "style".into()
            }
        );
        assert_eq!(unknown_service(&job).classify(), ResponseKind::UnknownService);
        assert_eq!(init_ack(&job).classify(), ResponseKind::Init);
        assert!(matches!(
            exception("E", "m", "tb").classify(),
            ResponseKind::Exception(_)
        ));
    }

    #[tokio::test]
    async fn session_announces_and_exchanges_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let worker = tokio::spawn(async move {
            let mut session = WorkerSession::connect(addr, "Python3".into()).await.unwrap();
            let Some(Ok(Request::Job(job))) = session.next_request().await else {
                panic!("expected a job");
            };
            session.respond(result(&job, json!(["done"]))).await.unwrap();
            session.close().await.unwrap();
        });

        let (stream, _) = listener.accept().await.unwrap();
        let (mut read, write) = stream.into_split();

        let mut announcement = [0u8; ANNOUNCE_LEN];
        read.read_exact(&mut announcement).await.unwrap();
        assert_eq!(parse_announcement(&announcement).unwrap().as_str(), "Python3");

        let mut sink = FramedWrite::new(write, DispatcherCodec::new());
        sink.send(Request::Job(Envelope::new("lint", "/a.py", json!([]))))
            .await
            .unwrap();

        let mut buf = bytes::BytesMut::new();
        let mut codec = DispatcherCodec::new();
        let response = loop {
            if let Some(env) = codec.decode(&mut buf).unwrap() {
                break env;
            }
            let n = read.read_buf(&mut buf).await.unwrap();
            assert!(n > 0, "worker closed before responding");
        };
        assert_eq!(response, Envelope::new("lint", "/a.py", json!(["done"])));

        worker.await.unwrap();
    }
}
