//! One MLLP connection over one TCP socket.
//!
//! The connection owns the socket, applies the framing codec, matches
//! inbound acknowledgments to pending `send_and_wait` calls by message
//! control id, and surfaces everything else as events.
//!
//! # Concurrency
//!
//! A single read task decodes frames strictly in arrival order; there is
//! never concurrent decoding of two frames from the same socket. Waiters
//! suspend on oneshot channels - no polling. The write half is serialized
//! behind a tokio `Mutex` so concurrent senders interleave whole frames.

use super::codec::{self, FrameDecoder};
use super::events::{ConnectionEvents, ErrorEvent};
use crate::error::{AgentError, Result};
use crate::hl7::{AckCategory, AckClass, AckCode, Hl7Message};
use encoding_rs::Encoding;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::debug;

/// A request registered by `send_and_wait`, waiting for its ack.
struct PendingRequest {
    ack_category: AckCategory,
    resolver: oneshot::Sender<Hl7Message>,
}

/// An MLLP connection wrapping one socket.
pub struct Hl7Connection {
    encoding: &'static Encoding,
    enhanced_mode: bool,
    peer: Option<SocketAddr>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    events: ConnectionEvents,
    closed: AtomicBool,
    read_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Hl7Connection {
    /// Wrap an established socket. Spawns the read task immediately, so
    /// listeners should be registered before the peer is expected to talk.
    pub fn new(
        stream: TcpStream,
        encoding: &'static Encoding,
        enhanced_mode: bool,
    ) -> Arc<Self> {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();

        let connection = Arc::new(Self {
            encoding,
            enhanced_mode,
            peer,
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            events: ConnectionEvents::default(),
            closed: AtomicBool::new(false),
            read_task: Mutex::new(None),
        });

        let handle = tokio::spawn(Self::read_loop(connection.clone(), reader));
        *connection
            .read_task
            .lock()
            .expect("read task slot poisoned") = Some(handle);

        connection
    }

    /// Remote peer as `host:port`, for keying connection maps.
    pub fn remote(&self) -> String {
        self.peer
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Register a listener for inbound non-ack messages.
    pub fn on_message(&self, listener: impl Fn(&Hl7Message) + Send + Sync + 'static) {
        self.events.message.subscribe(listener);
    }

    /// Register a listener for transport and protocol errors.
    pub fn on_error(&self, listener: impl Fn(&ErrorEvent) + Send + Sync + 'static) {
        self.events.error.subscribe(listener);
    }

    /// Register a listener for connection close.
    pub fn on_close(&self, listener: impl Fn(&()) + Send + Sync + 'static) {
        self.events.close.subscribe(listener);
    }

    /// Frame and send a message without waiting for any acknowledgment.
    pub async fn send(&self, message: &Hl7Message) -> Result<()> {
        if self.is_closed() {
            return Err(AgentError::Closed);
        }
        let payload = codec::encode_payload(&message.to_string(), self.encoding);
        let frame = codec::encode_frame(&payload);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Send a message and suspend until an acknowledgment in the requested
    /// category arrives, or the connection closes.
    ///
    /// The message must carry a control id (MSH.10); a missing id fails
    /// immediately with a validation error before any I/O. A second
    /// in-flight request with the same control id is rejected rather than
    /// silently replacing the first waiter.
    pub async fn send_and_wait(
        &self,
        message: &Hl7Message,
        ack_category: AckCategory,
    ) -> Result<Hl7Message> {
        let control_id = message
            .control_id()
            .ok_or_else(|| AgentError::Validation {
                field: "MSH.10".to_string(),
                message: "Required field missing: MSH.10".to_string(),
            })?
            .to_string();

        let (resolver, waiter) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            if pending.contains_key(&control_id) {
                return Err(AgentError::Validation {
                    field: "MSH.10".to_string(),
                    message: format!("duplicate in-flight control id: {}", control_id),
                });
            }
            pending.insert(
                control_id.clone(),
                PendingRequest {
                    ack_category,
                    resolver,
                },
            );
        }

        if let Err(err) = self.send(message).await {
            self.pending
                .lock()
                .expect("pending map poisoned")
                .remove(&control_id);
            return Err(err);
        }

        waiter.await.map_err(|_| AgentError::ConnectionClosed)
    }

    /// Close the connection. Idempotent.
    ///
    /// Remaining pending requests are reported once as an aggregate
    /// warning event, then rejected in bulk.
    pub async fn close(&self) {
        self.shutdown(true).await;
    }

    async fn shutdown(&self, abort_reader: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let dropped: Vec<PendingRequest> = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            pending.drain().map(|(_, request)| request).collect()
        };
        if !dropped.is_empty() {
            debug!(
                remote = %self.remote(),
                count = dropped.len(),
                "connection closed with pending messages"
            );
            self.events
                .error
                .emit(&ErrorEvent::warning(AgentError::PendingOnClose {
                    count: dropped.len(),
                }));
        }
        // Dropping the resolvers rejects every waiter in one batch.
        drop(dropped);

        let _ = self.writer.lock().await.shutdown().await;

        if abort_reader {
            if let Some(handle) = self
                .read_task
                .lock()
                .expect("read task slot poisoned")
                .take()
            {
                handle.abort();
            }
        }

        self.events.close.emit(&());
    }

    async fn read_loop(connection: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut decoder = FrameDecoder::new();
        let mut chunk = vec![0u8; 8192];

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    for frame in decoder.push(&chunk[..n]) {
                        match frame {
                            Ok(payload) => connection.handle_payload(&payload).await,
                            Err(err) => {
                                connection.events.error.emit(&ErrorEvent::error(err));
                            }
                        }
                    }
                }
                Err(err) => {
                    if !connection.is_closed() {
                        connection
                            .events
                            .error
                            .emit(&ErrorEvent::error(AgentError::from(err)));
                    }
                    break;
                }
            }
        }

        connection.shutdown(false).await;
    }

    async fn handle_payload(&self, payload: &[u8]) {
        let text = codec::decode_payload(payload, self.encoding);
        let message = match Hl7Message::parse(&text) {
            Ok(message) => message,
            Err(err) => {
                // Per-frame isolation: a bad payload never kills the socket.
                self.events.error.emit(&ErrorEvent::error(err));
                return;
            }
        };

        let is_ack = message.ack_target_id().is_some();

        if self.enhanced_mode && !is_ack {
            let commit_ack = message.build_ack(AckCode::CA);
            if let Err(err) = self.send(&commit_ack).await {
                self.events.error.emit(&ErrorEvent::error(err));
            }
        }

        if is_ack {
            self.resolve_ack(&message);
        } else {
            self.events.message.emit(&message);
        }
    }

    fn resolve_ack(&self, ack: &Hl7Message) {
        let target = match ack.ack_target_id() {
            Some(target) => target.to_string(),
            None => return,
        };
        let ack_class = ack.ack_code().and_then(AckClass::from_code);

        let resolved = {
            let mut pending = self.pending.lock().expect("pending map poisoned");
            match pending.get(&target) {
                Some(request) => {
                    let matches = match request.ack_category {
                        AckCategory::Any => true,
                        category => ack_class.is_some_and(|class| category.accepts(class)),
                    };
                    if matches {
                        // remove() cannot miss: the map is still locked.
                        let request = pending.remove(&target).expect("pending entry vanished");
                        let _ = request.resolver.send(ack.clone());
                    }
                    // A non-matching class stays pending; more acks may come.
                    true
                }
                None => false,
            }
        };

        if !resolved {
            self.events
                .error
                .emit(&ErrorEvent::warning(AgentError::OrphanAck {
                    control_id: target,
                }));
        }
    }

    /// Number of requests still waiting for an acknowledgment.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending map poisoned").len()
    }
}

impl std::fmt::Debug for Hl7Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hl7Connection")
            .field("peer", &self.peer)
            .field("enhanced_mode", &self.enhanced_mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}
