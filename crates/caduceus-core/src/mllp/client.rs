//! Outbound MLLP client.
//!
//! Holds at most one live [`Hl7Connection`]. Callers never reconnect by
//! hand: `send`/`send_and_wait` lazily connect, and a connection closed by
//! the remote is transparently re-established on the next send.
//!
//! Concurrent `connect()` calls never produce two live sockets: a call that
//! finds an attempt already in flight cancels it (last caller wins) before
//! starting its own.

use super::connection::Hl7Connection;
use super::events::{ErrorEvent, Listeners};
use crate::config::ClientConfig;
use crate::error::{AgentError, Result};
use crate::mllp::codec;
use crate::hl7::{AckCategory, Hl7Message};
use encoding_rs::Encoding;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{lookup_host, TcpSocket};
use tokio::sync::oneshot;
use tracing::debug;

/// A connect attempt in flight. Cancelling delivers the rejection reason
/// to the attempt's owner and drops its half-open socket.
struct Attempt {
    generation: u64,
    cancel: oneshot::Sender<AgentError>,
}

#[derive(Default)]
struct ClientState {
    connection: Option<Arc<Hl7Connection>>,
    attempt: Option<Attempt>,
}

/// Client-level event registries; connection errors and closes are
/// re-emitted here so callers can observe them across reconnects.
#[derive(Default)]
struct ClientEvents {
    error: Listeners<ErrorEvent>,
    close: Listeners<()>,
}

/// An MLLP client managing at most one outbound connection.
pub struct Hl7Client {
    config: ClientConfig,
    encoding: &'static Encoding,
    state: Arc<Mutex<ClientState>>,
    events: Arc<ClientEvents>,
    generation: AtomicU64,
}

impl Hl7Client {
    /// Create a client. Fails only when the configured encoding label is
    /// unknown.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let encoding = codec::resolve_encoding(&config.encoding)?;
        Ok(Self {
            config,
            encoding,
            state: Arc::new(Mutex::new(ClientState::default())),
            events: Arc::new(ClientEvents::default()),
            generation: AtomicU64::new(0),
        })
    }

    /// Register a listener for errors re-emitted from the underlying
    /// connection.
    pub fn on_error(&self, listener: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        self.events.error.subscribe(listener);
    }

    /// Register a listener for connection closes.
    pub fn on_close(&self, listener: impl Fn(&()) + Send + Sync + 'static) {
        self.events.close.subscribe(listener);
    }

    /// Get the live connection, establishing one if needed.
    ///
    /// 1. A live connection is returned as-is.
    /// 2. An attempt already in flight is cancelled first - last caller
    ///    wins; concurrent callers never hold two live sockets.
    /// 3. The transport connect runs under the configured timeout; expiry
    ///    tears the half-open socket down and rejects.
    pub async fn connect(&self) -> Result<Arc<Hl7Connection>> {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<AgentError>();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut state = self.state.lock().expect("client state poisoned");
            if let Some(connection) = &state.connection {
                if !connection.is_closed() {
                    return Ok(connection.clone());
                }
                state.connection = None;
            }
            if let Some(previous) = state.attempt.take() {
                debug!("superseding in-flight connect attempt");
                let _ = previous.cancel.send(AgentError::ConnectSuperseded);
            }
            state.attempt = Some(Attempt {
                generation,
                cancel: cancel_tx,
            });
        }

        let result = tokio::select! {
            reason = &mut cancel_rx => {
                Err(reason.unwrap_or(AgentError::ClientClosed))
            }
            result = self.open_socket() => result,
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(err) => {
                self.clear_attempt(generation);
                return Err(err);
            }
        };

        let connection = Hl7Connection::new(stream, self.encoding, false);
        self.wire_connection(&connection);

        let superseded = {
            let mut state = self.state.lock().expect("client state poisoned");
            let ours = state
                .attempt
                .as_ref()
                .is_some_and(|attempt| attempt.generation == generation);
            if ours {
                state.attempt = None;
                state.connection = Some(connection.clone());
            }
            !ours
        };
        if superseded {
            // A newer connect (or close) won the race while the socket was
            // being established; this socket must not stay live.
            connection.close().await;
            return Err(AgentError::ConnectSuperseded);
        }

        debug!(
            host = %self.config.host,
            port = self.config.port,
            "MLLP client connected"
        );
        Ok(connection)
    }

    /// Send a message, connecting first if necessary.
    pub async fn send(&self, message: &Hl7Message) -> Result<()> {
        let connection = self.connect().await?;
        connection.send(message).await
    }

    /// Send a message and wait for a matching acknowledgment, connecting
    /// first if necessary.
    pub async fn send_and_wait(
        &self,
        message: &Hl7Message,
        ack_category: AckCategory,
    ) -> Result<Hl7Message> {
        let connection = self.connect().await?;
        connection.send_and_wait(message, ack_category).await
    }

    /// Tear down any in-flight connect attempt and any open connection.
    /// Safe to call when nothing is connected.
    pub async fn close(&self) {
        let (attempt, connection) = {
            let mut state = self.state.lock().expect("client state poisoned");
            (state.attempt.take(), state.connection.take())
        };
        if let Some(attempt) = attempt {
            let _ = attempt.cancel.send(AgentError::ClientClosed);
        }
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    /// Whether a live connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.state
            .lock()
            .expect("client state poisoned")
            .connection
            .as_ref()
            .is_some_and(|connection| !connection.is_closed())
    }

    async fn open_socket(&self) -> Result<tokio::net::TcpStream> {
        let timeout = self.config.connect_timeout;
        let connect = async {
            let mut addrs =
                lookup_host((self.config.host.as_str(), self.config.port)).await?;
            let addr = addrs.next().ok_or_else(|| AgentError::Config {
                message: format!("no addresses resolved for {}", self.config.host),
            })?;
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            if self.config.keep_alive {
                socket.set_keepalive(true)?;
            }
            Ok(socket.connect(addr).await?)
        };

        match tokio::time::timeout(timeout, connect).await {
            Ok(result) => result,
            // The timed-out future is dropped here, destroying the
            // half-open socket.
            Err(_) => Err(AgentError::ConnectTimeout {
                millis: timeout.as_millis() as u64,
            }),
        }
    }

    fn clear_attempt(&self, generation: u64) {
        let mut state = self.state.lock().expect("client state poisoned");
        if state
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.generation == generation)
        {
            state.attempt = None;
        }
    }

    fn wire_connection(&self, connection: &Arc<Hl7Connection>) {
        let events = self.events.clone();
        connection.on_error(move |event| {
            events.error.emit(event);
        });

        let events = self.events.clone();
        let state = self.state.clone();
        let this = Arc::downgrade(connection);
        connection.on_close(move |_| {
            if let Ok(mut state) = state.lock() {
                let is_current = match (&state.connection, this.upgrade()) {
                    (Some(current), Some(closed)) => Arc::ptr_eq(current, &closed),
                    _ => false,
                };
                if is_current {
                    state.connection = None;
                }
            }
            events.close.emit(&());
        });
    }
}

impl std::fmt::Debug for Hl7Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hl7Client")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("connected", &self.is_connected())
            .finish()
    }
}
