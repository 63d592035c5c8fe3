//! Listening socket workers connect back to.
//!
//! Follows a deferred startup pattern: `new()` allocates, `start()` binds
//! (so the chosen port can be passed to worker processes before anything
//! connects), and `serve()` accepts until shutdown is signalled. Every
//! accepted socket must announce its language before it is handed to the
//! dispatcher.

use std::net::SocketAddr;

use jobrelay_core::handshake::{parse_announcement, ANNOUNCE_LEN};
use jobrelay_core::{ProtocolError, WorkerLanguage};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::config::ListenerConfig;

/// A connection that completed its language announcement.
#[derive(Debug)]
pub struct AnnouncedWorker {
    pub language: WorkerLanguage,
    pub stream: TcpStream,
    pub peer: SocketAddr,
}

/// Accepts worker connections.
pub struct WorkerListener {
    config: ListenerConfig,
    listener: Option<TcpListener>,
}

impl WorkerListener {
    /// Creates a listener without binding any port.
    #[must_use]
    pub fn new(config: ListenerConfig) -> Self {
        Self {
            config,
            listener: None,
        }
    }

    /// Binds loopback on the configured interface family.
    ///
    /// Returns the bound address; the port is OS-assigned when configured as 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<SocketAddr> {
        let addr = SocketAddr::new(self.config.host_address(), self.config.port);
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        info!(addr = %local, "worker listener bound");
        self.listener = Some(listener);
        Ok(local)
    }

    /// Accepts connections until `shutdown` flips to `true`.
    ///
    /// Each connection reads its announcement in its own task so a slow
    /// worker cannot hold up others. Announced connections are sent on
    /// `announced`.
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first.
    pub async fn serve(
        self,
        announced: mpsc::UnboundedSender<AnnouncedWorker>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };
        let config = self.config;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let announced = announced.clone();
                            let config = config.clone();
                            tokio::spawn(async move {
                                accept_worker(stream, peer, &config, &announced).await;
                            });
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("worker listener stopped");
        Ok(())
    }
}

async fn accept_worker(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: &ListenerConfig,
    announced: &mpsc::UnboundedSender<AnnouncedWorker>,
) {
    let _ = stream.set_nodelay(true);
    match read_announcement(&mut stream, config).await {
        Ok(language) => {
            debug!(%peer, %language, "worker announced");
            let _ = announced.send(AnnouncedWorker {
                language,
                stream,
                peer,
            });
        }
        Err(err) => warn!(%peer, error = %err, "abandoning connection"),
    }
}

/// Reads the language announcement from the start of a connection.
///
/// Waits up to `handshake_timeout` for the first byte. After that, reading
/// stops at [`ANNOUNCE_LEN`] bytes, at end of stream, or when no further
/// byte arrives within `announce_grace`, whichever comes first. The overall
/// wait never exceeds `handshake_timeout`.
///
/// # Errors
///
/// Returns `ProtocolError::BadAnnouncement` if nothing arrives in time or
/// the bytes do not name a language, and `ProtocolError::Io` on read errors.
pub async fn read_announcement<R: AsyncRead + Unpin>(
    reader: &mut R,
    config: &ListenerConfig,
) -> Result<WorkerLanguage, ProtocolError> {
    let deadline = Instant::now() + config.handshake_timeout;
    let mut buf = [0u8; ANNOUNCE_LEN];
    let mut filled = 0;

    while filled < ANNOUNCE_LEN {
        let wait_until = if filled == 0 {
            deadline
        } else {
            deadline.min(Instant::now() + config.announce_grace)
        };
        match tokio::time::timeout_at(wait_until, reader.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => filled += n,
            Ok(Err(err)) => return Err(err.into()),
            Err(_) if filled == 0 => {
                return Err(ProtocolError::BadAnnouncement(
                    "no announcement within handshake timeout",
                ))
            }
            Err(_) => break,
        }
    }

    parse_announcement(&buf[..filled])
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;

    fn fast_config() -> ListenerConfig {
        ListenerConfig {
            handshake_timeout: Duration::from_millis(200),
            announce_grace: Duration::from_millis(20),
            ..ListenerConfig::default()
        }
    }

    #[tokio::test]
    async fn padded_announcement_is_read_in_full() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let mut padded = [0u8; ANNOUNCE_LEN];
        padded[..7].copy_from_slice(b"Python3");
        client.write_all(&padded).await.unwrap();

        let language = read_announcement(&mut server, &fast_config()).await.unwrap();
        assert_eq!(language.as_str(), "Python3");
    }

    #[tokio::test]
    async fn short_announcement_completes_after_grace() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(b"Python2").await.unwrap();

        let language = read_announcement(&mut server, &fast_config()).await.unwrap();
        assert_eq!(language.as_str(), "Python2");
        drop(client);
    }

    #[tokio::test]
    async fn announcement_split_across_writes() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let writer = tokio::spawn(async move {
            client.write_all(b"Pyt").await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            client.write_all(b"hon3").await.unwrap();
            client
        });

        let language = read_announcement(&mut server, &fast_config()).await.unwrap();
        assert_eq!(language.as_str(), "Python3");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn silent_connection_times_out() {
        let (_client, mut server) = tokio::io::duplex(256);
        let err = read_announcement(&mut server, &fast_config()).await.unwrap_err();
        assert!(matches!(err, ProtocolError::BadAnnouncement(_)));
    }

    #[tokio::test]
    async fn closed_before_announcing_is_rejected() {
        let (client, mut server) = tokio::io::duplex(256);
        drop(client);
        assert!(read_announcement(&mut server, &fast_config()).await.is_err());
    }

    #[tokio::test]
    async fn serve_requires_start() {
        let listener = WorkerListener::new(ListenerConfig::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let (_stop_tx, stop_rx) = watch::channel(false);
        assert!(listener.serve(tx, stop_rx).await.is_err());
    }

    #[tokio::test]
    async fn accepts_and_forwards_announced_workers() {
        let mut listener = WorkerListener::new(fast_config());
        let addr = listener.start().await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let server = tokio::spawn(listener.serve(tx, stop_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ruby").await.unwrap();

        let worker = rx.recv().await.unwrap();
        assert_eq!(worker.language.as_str(), "ruby");

        stop_tx.send(true).unwrap();
        server.await.unwrap().unwrap();
    }
}
