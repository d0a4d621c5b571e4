//! Caduceus Agent - HL7v2-over-MLLP integration daemon.
//!
//! Listens for HL7 messages on an MLLP channel, persists every message in
//! the durable queue before anything else happens to it, forwards queued
//! messages to an upstream system, and delivers upstream acknowledgments
//! back to the original sender. A PID lock keeps the agent a singleton;
//! the queue ownership marker makes rolling upgrades hand over safely.

use anyhow::Result;
use caduceus_core::config::{AppConfig, ClientConfig, ServerConfig};
use caduceus_core::hl7::{AckCategory, AckClass, Hl7Message};
use caduceus_core::mllp::{Hl7Client, Hl7Connection, Hl7Server, Severity};
use caduceus_core::queue::DurableQueue;
use caduceus_core::pid;
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

/// How long to wait for the previous agent generation to release the queue.
const QUEUE_RELEASE_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle poll interval for the forwarder and response workers.
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "caduceus-agent")]
#[command(about = "HL7v2 MLLP integration agent")]
struct Args {
    /// Port for the inbound MLLP channel
    #[arg(short, long, default_value = "2575")]
    port: u16,

    /// Channel name recorded on queued messages
    #[arg(long, default_value = "default")]
    channel: String,

    /// Character encoding for the inbound channel (e.g. windows-1252)
    #[arg(long, default_value = "utf-8")]
    encoding: String,

    /// Answer every inbound message with an automatic commit-level ack
    #[arg(long)]
    enhanced: bool,

    /// Upstream host to forward queued messages to
    #[arg(long)]
    forward_host: Option<String>,

    /// Upstream port to forward queued messages to
    #[arg(long, default_value = "2576")]
    forward_port: u16,

    /// Path of the durable queue database
    #[arg(long, default_value = "messages.sqlite3")]
    queue_db: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

type ConnectionMap = Arc<Mutex<HashMap<String, Arc<Hl7Connection>>>>;
type SharedQueue = Arc<Mutex<DurableQueue>>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("Starting Caduceus Agent");

    // Singleton lock: a live holder aborts startup non-zero.
    pid::create_pid_file(AppConfig::APP_NAME)?;
    pid::register_panic_cleanup(AppConfig::APP_NAME);

    // Let the previous generation finish with the queue before opening it.
    let mut queue = DurableQueue::new(&args.queue_db);
    queue.wait_for_queue_release(QUEUE_RELEASE_TIMEOUT).await?;
    queue.init()?;
    let queue: SharedQueue = Arc::new(Mutex::new(queue));

    let connections: ConnectionMap = Arc::new(Mutex::new(HashMap::new()));

    let server = start_channel(&args, queue.clone(), connections.clone()).await?;

    if let Some(forward_host) = args.forward_host.clone() {
        let client = Hl7Client::new(
            ClientConfig::new(forward_host, args.forward_port)
                .with_encoding(args.encoding.clone())
                .with_keep_alive(true),
        )?;
        tokio::spawn(forward_worker(
            queue.clone(),
            client,
            args.channel.clone(),
        ));
    } else {
        info!("No forward host configured; messages will accumulate as 'received'");
    }

    tokio::spawn(response_worker(queue.clone(), connections.clone()));

    wait_for_shutdown().await;
    info!("Shutdown signal received, exiting");

    server.stop().await?;
    let held: Vec<_> = {
        let mut map = connections.lock().unwrap();
        map.drain().map(|(_, connection)| connection).collect()
    };
    for connection in held {
        connection.close().await;
    }
    queue.lock().unwrap().close();
    pid::remove_pid_file(AppConfig::APP_NAME);
    Ok(())
}

/// Start the inbound MLLP channel. Every received message is persisted
/// with status `received` before anything else happens to it.
async fn start_channel(
    args: &Args,
    queue: SharedQueue,
    connections: ConnectionMap,
) -> Result<Hl7Server> {
    let channel = args.channel.clone();
    let server = Hl7Server::new(
        ServerConfig::new(args.port)
            .with_encoding(args.encoding.clone())
            .with_enhanced_mode(args.enhanced),
        move |connection| {
            let remote = connection.remote();
            info!("HL7 connection established: {}", remote);
            connections
                .lock()
                .unwrap()
                .insert(remote.clone(), connection.clone());

            let map = connections.clone();
            let closed_remote = remote.clone();
            connection.on_close(move |_| {
                info!("Closing connection: {}", closed_remote);
                map.lock().unwrap().remove(&closed_remote);
            });

            connection.on_error(|event| match event.severity {
                Severity::Warning => warn!("HL7 connection warning: {}", event.error),
                Severity::Error => error!("HL7 connection error: {}", event.error),
            });

            let queue = queue.clone();
            let channel = channel.clone();
            connection.on_message(move |message| {
                let callback = format!("Agent/{}", Uuid::new_v4());
                match queue
                    .lock()
                    .unwrap()
                    .add_message(message, &channel, &remote, Some(&callback))
                {
                    Ok(id) => debug!(
                        "Queued message {} (control id {:?})",
                        id,
                        message.control_id()
                    ),
                    Err(err) => error!("Failed to queue inbound message: {}", err),
                }
            });
        },
    )?;
    server.start().await?;
    info!(
        "Channel '{}' listening on port {}",
        args.channel,
        server.local_addr().map(|addr| addr.port()).unwrap_or(0)
    );
    Ok(server)
}

/// Drain the channel queue: oldest pending message first (`received` and
/// retryable `timed_out` rows alike), forward upstream, and record the
/// outcome. The upstream ack is queued as the response for the original
/// sender.
async fn forward_worker(queue: SharedQueue, client: Hl7Client, channel: String) {
    loop {
        let pending = match queue.lock().unwrap().get_next_message(&channel) {
            Ok(pending) => pending,
            Err(err) => {
                error!("Queue read failed: {}", err);
                break;
            }
        };

        let Some(row) = pending else {
            tokio::time::sleep(WORKER_POLL_INTERVAL).await;
            continue;
        };

        let outbound = match Hl7Message::parse(&row.raw_message) {
            Ok(message) => message,
            Err(err) => {
                error!("Stored message {} is unparsable: {}", row.id, err);
                record(&queue, |q| q.mark_as_error(row.id));
                continue;
            }
        };

        record(&queue, |q| q.mark_as_sent(row.id));
        match client.send_and_wait(&outbound, AckCategory::Any).await {
            Ok(ack) => {
                let is_commit = ack
                    .ack_code()
                    .and_then(AckClass::from_code)
                    .is_some_and(|class| class == AckClass::Commit);
                if is_commit {
                    record(&queue, |q| q.mark_as_commit_acked(row.id));
                } else {
                    record(&queue, |q| q.mark_as_app_acked(row.id));
                }
                record(&queue, |q| {
                    q.mark_as_response_queued(row.id, &ack.to_string())
                });
                debug!("Message {} acknowledged upstream", row.id);
            }
            Err(err) => {
                warn!("Forward of message {} failed: {}", row.id, err);
                record(&queue, |q| q.mark_as_error(row.id));
            }
        }
    }
}

/// Deliver queued responses back to the connection they arrived on.
async fn response_worker(queue: SharedQueue, connections: ConnectionMap) {
    loop {
        let pending = match queue.lock().unwrap().get_next_response_queued_message() {
            Ok(pending) => pending,
            Err(err) => {
                error!("Queue read failed: {}", err);
                break;
            }
        };

        let Some(row) = pending else {
            tokio::time::sleep(WORKER_POLL_INTERVAL).await;
            continue;
        };

        let connection = row
            .remote
            .as_ref()
            .and_then(|remote| connections.lock().unwrap().get(remote).cloned());

        let Some(connection) = connection else {
            warn!(
                "Attempted to send response to disconnected remote: {:?}",
                row.remote
            );
            record(&queue, |q| q.mark_as_response_error(row.id));
            continue;
        };

        let response = row
            .response_message
            .as_deref()
            .and_then(|text| Hl7Message::parse(text).ok());
        match response {
            Some(response) => match connection.send(&response).await {
                Ok(()) => record(&queue, |q| q.mark_as_response_sent(row.id)),
                Err(err) => {
                    warn!("Response delivery for message {} failed: {}", row.id, err);
                    record(&queue, |q| q.mark_as_response_error(row.id));
                }
            },
            None => {
                error!("Stored response for message {} is unparsable", row.id);
                record(&queue, |q| q.mark_as_response_error(row.id));
            }
        }
    }
}

/// Apply a queue transition, logging rather than propagating failures so
/// the worker loops keep running.
fn record(
    queue: &SharedQueue,
    op: impl FnOnce(&DurableQueue) -> caduceus_core::Result<()>,
) {
    if let Err(err) = op(&queue.lock().unwrap()) {
        error!("Queue update failed: {}", err);
    }
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
