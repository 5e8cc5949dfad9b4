//! Opening sessions and relaying bytes.

use std::fmt;
use std::io;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn, Instrument};
use uuid::Uuid;

use crate::error::{Result, TunnelError};
use crate::registry::{Protocol, SessionInfo, SessionRegistry};

#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Largest backend read forwarded to the client as one message.
    pub chunk_size: usize,
    pub connect_timeout: Duration,
    /// Upper bound on closing the client side during cleanup.
    pub close_timeout: Duration,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
        }
    }
}

/// Which side ended a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    ClientClosed,
    BackendClosed,
    /// Closed through the registry.
    ForceClosed,
    /// The relay task was cancelled or panicked.
    Aborted,
}

/// A running session. Dropping the handle does not stop the relay.
pub struct SessionHandle {
    info: SessionInfo,
    task: JoinHandle<SessionEnd>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.info.session_id
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    /// Wait until the relay has stopped and the session is deregistered.
    pub async fn finished(self) -> SessionEnd {
        self.task.await.unwrap_or(SessionEnd::Aborted)
    }
}

/// Deregisters its session exactly once, whichever way the relay task ends.
struct SessionGuard {
    registry: SessionRegistry,
    session_id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.deregister(self.session_id);
    }
}

#[derive(Clone)]
pub struct TunnelService {
    registry: SessionRegistry,
    config: TunnelConfig,
}

impl TunnelService {
    pub fn new(registry: SessionRegistry, config: TunnelConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Connect to `host:port` and relay it against the client until either side closes.
    ///
    /// `client_rx` yields the client's messages and `client_tx` accepts data for it. If the
    /// backend cannot be reached the failure is written to the client, the client side is
    /// closed and nothing is registered.
    pub async fn open_session<R, W>(
        &self,
        vm_id: &str,
        protocol: Protocol,
        host: &str,
        port: u16,
        client_rx: R,
        mut client_tx: W,
    ) -> Result<SessionHandle>
    where
        R: Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static,
        W: Sink<Bytes> + Send + Unpin + 'static,
        W::Error: fmt::Display,
    {
        let target = format!("{}:{}", host, port);

        let connected = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((host, port)),
        )
        .await
        .unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("no answer within {:?}", self.config.connect_timeout),
            ))
        });

        let backend = match connected {
            Ok(stream) => stream,
            Err(source) => {
                warn!(vm_id, %protocol, target = %target, error = %source, "Backend unreachable");
                let notice = format!("Error: could not connect to {} ({}): {}\r\n", protocol, target, source);
                if let Err(e) = client_tx.send(Bytes::from(notice)).await {
                    debug!(error = %e, "Could not report connect failure to client");
                }
                let _ = tokio::time::timeout(self.config.close_timeout, client_tx.close()).await;
                return Err(TunnelError::Connect { target, source });
            }
        };
        let _ = backend.set_nodelay(true);

        let info = SessionInfo {
            session_id: Uuid::new_v4(),
            vm_id: vm_id.to_string(),
            protocol,
            target,
            opened_at: Utc::now(),
        };
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.registry.register(info.clone(), shutdown_tx);
        let guard = SessionGuard {
            registry: self.registry.clone(),
            session_id: info.session_id,
        };

        let span = tracing::info_span!(
            "tunnel",
            session_id = %info.session_id,
            vm_id = %info.vm_id,
            protocol = %protocol
        );
        let relay = Relay {
            backend,
            client_rx,
            client_tx,
            shutdown: shutdown_rx,
            config: self.config.clone(),
            guard,
        };
        let task = tokio::spawn(relay.run().instrument(span));

        Ok(SessionHandle { info, task })
    }
}

struct Relay<R, W> {
    backend: TcpStream,
    client_rx: R,
    client_tx: W,
    shutdown: oneshot::Receiver<()>,
    config: TunnelConfig,
    guard: SessionGuard,
}

impl<R, W> Relay<R, W>
where
    R: Stream<Item = io::Result<Bytes>> + Unpin,
    W: Sink<Bytes> + Unpin,
    W::Error: fmt::Display,
{
    async fn run(self) -> SessionEnd {
        let Relay {
            backend,
            mut client_rx,
            mut client_tx,
            shutdown,
            config,
            guard,
        } = self;
        let (mut backend_rd, mut backend_wr) = backend.into_split();

        let end = {
            let upstream = async {
                while let Some(message) = client_rx.next().await {
                    match message {
                        Ok(chunk) => {
                            if let Err(e) = backend_wr.write_all(&chunk).await {
                                debug!(error = %e, "Backend write failed");
                                return SessionEnd::BackendClosed;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "Client read failed");
                            return SessionEnd::ClientClosed;
                        }
                    }
                }
                SessionEnd::ClientClosed
            };

            let downstream = async {
                let mut buf = vec![0u8; config.chunk_size.max(1)];
                loop {
                    match backend_rd.read(&mut buf).await {
                        Ok(0) => return SessionEnd::BackendClosed,
                        Ok(n) => {
                            if let Err(e) = client_tx.send(Bytes::copy_from_slice(&buf[..n])).await {
                                debug!(error = %e, "Client write failed");
                                return SessionEnd::ClientClosed;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "Backend read failed");
                            return SessionEnd::BackendClosed;
                        }
                    }
                }
            };

            // Whichever direction finishes first stops the other.
            tokio::select! {
                end = upstream => end,
                end = downstream => end,
                _ = shutdown => SessionEnd::ForceClosed,
            }
        };

        if tokio::time::timeout(config.close_timeout, client_tx.close())
            .await
            .is_err()
        {
            warn!("Client side did not close in time");
        }
        if let Err(e) = backend_wr.shutdown().await {
            debug!(error = %e, "Backend shutdown failed");
        }
        drop(backend_wr);
        drop(backend_rd);

        debug!(?end, "Tunnel session ended");
        drop(guard);
        end
    }
}
