//! # Bridge transport: the wire seam to a running worker.
//!
//! The pool never speaks the worker protocol itself; it only needs to open a
//! session, ask the worker to shut down, and learn when the session is gone.
//! [`BridgeTransport`] and [`BridgeSession`] capture exactly that contract.
//!
//! ## Rules
//! - Disposal is asynchronous and may be initiated by either side: a local
//!   [`close`](BridgeSession::close) and a worker crash both resolve
//!   [`disposed`](BridgeSession::disposed). The connection layer treats the
//!   disposal notification, not the close call, as the authoritative signal.
//! - [`terminate`](BridgeSession::terminate) on an already disposed session
//!   returns [`BridgeError::Disposed`]; callers on the stop path expect and
//!   tolerate that.
//!
//! [`TcpBridge`] is the built-in default: a thin TCP endpoint that reports
//! disposal on EOF or reset. It carries no protocol knowledge, so its
//! `terminate` only closes the endpoint; deployments that need a true remote
//! shutdown call plug in a protocol-aware transport and the supervisor's
//! kill-by-PID fallback covers the rest.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::transport::ConnectUrl;

/// # Errors produced by a bridge transport.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The worker refused or reset the handshake. Retryable while the worker
    /// process is still coming up.
    #[error("bridge handshake refused: {message}")]
    Rejected {
        /// Details of the refusal.
        message: String,
    },

    /// Transport-level I/O failure.
    #[error("bridge i/o error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The session is already disposed.
    #[error("bridge session is already disposed")]
    Disposed,
}

/// Opens bridge sessions against worker acceptors.
#[async_trait]
pub trait BridgeTransport: Send + Sync + 'static {
    /// Performs the handshake against the acceptor at `url`.
    ///
    /// Returns [`BridgeError::Rejected`] when the acceptor is not (yet)
    /// answering and [`BridgeError::Io`] for transport-level failures; the
    /// caller decides whether to retry based on the worker process state.
    async fn open(&self, url: &ConnectUrl) -> Result<Arc<dyn BridgeSession>, BridgeError>;
}

/// One live session to a worker.
#[async_trait]
pub trait BridgeSession: Send + Sync {
    /// True until the session is disposed.
    fn is_alive(&self) -> bool;

    /// Resolves once the session is disposed, whether locally or by the
    /// remote side going away.
    async fn disposed(&self);

    /// Asks the worker to shut down via the bridge.
    async fn terminate(&self) -> Result<(), BridgeError>;

    /// Disposes the local endpoint. Idempotent; the worker process is left
    /// untouched.
    fn close(&self);
}

/// Built-in TCP bridge transport.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpBridge;

impl TcpBridge {
    /// Creates the transport.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BridgeTransport for TcpBridge {
    async fn open(&self, url: &ConnectUrl) -> Result<Arc<dyn BridgeSession>, BridgeError> {
        let (host, port) = match url {
            ConnectUrl::Socket { host, port } => (host.as_str(), *port),
            ConnectUrl::Pipe { .. } => {
                return Err(BridgeError::Io {
                    source: std::io::Error::new(
                        std::io::ErrorKind::Unsupported,
                        "pipe addresses need a pipe-capable bridge transport",
                    ),
                });
            }
        };

        let stream = match TcpStream::connect((host, port)).await {
            Ok(stream) => stream,
            Err(err) if err.kind() == std::io::ErrorKind::ConnectionRefused => {
                return Err(BridgeError::Rejected {
                    message: format!("{host}:{port} is not accepting connections"),
                });
            }
            Err(err) => return Err(BridgeError::Io { source: err }),
        };

        debug!(url = %url, "bridge session established");
        Ok(TcpSession::spawn(stream, url.clone()))
    }
}

/// One TCP endpoint; disposal fires on EOF, reset, or local close.
struct TcpSession {
    url: ConnectUrl,
    disposal: CancellationToken,
    writer: Mutex<Option<OwnedWriteHalf>>,
}

impl TcpSession {
    fn spawn(stream: TcpStream, url: ConnectUrl) -> Arc<dyn BridgeSession> {
        let (mut reader, writer) = stream.into_split();
        let session = Arc::new(TcpSession {
            url,
            disposal: CancellationToken::new(),
            writer: Mutex::new(Some(writer)),
        });

        // Watch the read side: the worker going away is the only disposal
        // signal a protocol-less endpoint has.
        let disposal = session.disposal.clone();
        let url = session.url.clone();
        tokio::spawn(async move {
            let mut sink = [0u8; 512];
            loop {
                tokio::select! {
                    _ = disposal.cancelled() => break,
                    read = reader.read(&mut sink) => match read {
                        Ok(0) | Err(_) => {
                            debug!(url = %url, "bridge peer closed the session");
                            disposal.cancel();
                            break;
                        }
                        Ok(_) => {}
                    }
                }
            }
        });

        session
    }

    fn take_writer(&self) -> Option<OwnedWriteHalf> {
        match self.writer.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }
}

#[async_trait]
impl BridgeSession for TcpSession {
    fn is_alive(&self) -> bool {
        !self.disposal.is_cancelled()
    }

    async fn disposed(&self) {
        self.disposal.cancelled().await;
    }

    async fn terminate(&self) -> Result<(), BridgeError> {
        if self.disposal.is_cancelled() {
            return Err(BridgeError::Disposed);
        }
        match self.take_writer() {
            Some(mut writer) => {
                // Signal EOF to the worker; workers exit on bridge loss, and
                // the supervisor falls back to kill-by-PID for those that do
                // not.
                let _ = writer.shutdown().await;
                Ok(())
            }
            None => Err(BridgeError::Disposed),
        }
    }

    fn close(&self) {
        self.take_writer();
        self.disposal.cancel();
    }
}
