//! Inbound MLLP server.
//!
//! Accepts TCP connections, wraps each in an [`Hl7Connection`] configured
//! with the server's encoding and enhanced mode, and hands it to a
//! caller-supplied handler. The handler is responsible for registering
//! message/error listeners on the connection.

use super::connection::Hl7Connection;
use crate::config::{MllpConfig, ServerConfig};
use crate::error::{AgentError, Result};
use crate::mllp::codec;
use encoding_rs::Encoding;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Per-connection callback invoked for every accepted socket.
pub type ConnectionHandler = Arc<dyn Fn(Arc<Hl7Connection>) + Send + Sync>;

struct RunningServer {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

/// An MLLP listener dispatching accepted connections to a handler.
pub struct Hl7Server {
    config: ServerConfig,
    encoding: &'static Encoding,
    handler: ConnectionHandler,
    running: Mutex<Option<RunningServer>>,
}

impl Hl7Server {
    /// Create a server. Fails only when the configured encoding label is
    /// unknown.
    pub fn new(
        config: ServerConfig,
        handler: impl Fn(Arc<Hl7Connection>) + Send + Sync + 'static,
    ) -> Result<Self> {
        let encoding = codec::resolve_encoding(&config.encoding)?;
        Ok(Self {
            config,
            encoding,
            handler: Arc::new(handler),
            running: Mutex::new(None),
        })
    }

    /// Bind the listener and start accepting connections.
    ///
    /// A transient address-in-use error (common right after a previous
    /// instance released the port) is retried once after a short delay.
    pub async fn start(&self) -> Result<()> {
        if self.running.lock().expect("server state poisoned").is_some() {
            warn!("start() called but server is already running");
            return Ok(());
        }

        let bind_addr: SocketAddr = ([0, 0, 0, 0], self.config.port).into();
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                warn!(
                    "port {} in use, retrying bind once in {:?}",
                    self.config.port,
                    MllpConfig::BIND_RETRY_DELAY
                );
                tokio::time::sleep(MllpConfig::BIND_RETRY_DELAY).await;
                TcpListener::bind(bind_addr)
                    .await
                    .map_err(|e| AgentError::io_with_path(e, self.config.port.to_string()))?
            }
            Err(err) => return Err(err.into()),
        };
        let local_addr = listener.local_addr()?;
        info!("MLLP server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(Self::accept_loop(
            listener,
            self.handler.clone(),
            self.encoding,
            self.config.enhanced_mode,
            shutdown_rx,
        ));

        *self.running.lock().expect("server state poisoned") = Some(RunningServer {
            local_addr,
            shutdown_tx,
            task,
        });
        Ok(())
    }

    /// Stop accepting connections and close the listener.
    ///
    /// Fails with an explicit error when the server is not running.
    pub async fn stop(&self) -> Result<()> {
        let running = self
            .running
            .lock()
            .expect("server state poisoned")
            .take()
            .ok_or(AgentError::ServerNotRunning)?;

        let _ = running.shutdown_tx.send(());
        let _ = running.task.await;
        info!("MLLP server stopped");
        Ok(())
    }

    /// The bound address, once started. Useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running
            .lock()
            .expect("server state poisoned")
            .as_ref()
            .map(|running| running.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().expect("server state poisoned").is_some()
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: ConnectionHandler,
        encoding: &'static Encoding,
        enhanced_mode: bool,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("MLLP server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            debug!("HL7 connection established: {}", peer_addr);
                            let connection =
                                Hl7Connection::new(stream, encoding, enhanced_mode);
                            handler(connection);
                        }
                        Err(err) => {
                            error!("MLLP accept error: {}", err);
                        }
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Hl7Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hl7Server")
            .field("port", &self.config.port)
            .field("enhanced_mode", &self.config.enhanced_mode)
            .field("running", &self.is_running())
            .finish()
    }
}
