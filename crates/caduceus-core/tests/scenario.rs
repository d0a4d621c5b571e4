//! Cross-layer scenarios: enhanced-mode server, legacy encodings, and the
//! receive -> persist -> forward pipeline.

use caduceus_core::config::{ClientConfig, ServerConfig};
use caduceus_core::hl7::{AckCategory, AckCode, Hl7Message};
use caduceus_core::mllp::{Hl7Client, Hl7Server};
use caduceus_core::queue::{DurableQueue, MessageStatus};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

const PATIENT_NAME: &str = "\u{c7}\u{f6}d\u{ff}"; // Çödÿ - outside ASCII

fn adt_with_name(name: &str) -> Hl7Message {
    Hl7Message::parse(&format!(
        "MSH|^~\\&|ADT1|MCM|LABADT|MCM|198808181126|SECURITY|ADT^A01|MSG00001|P|2.2\r\
         PID|||PATID1234^5^M11||{}||19610615|M-",
        name
    ))
    .unwrap()
}

/// Start an enhanced-mode windows-1252 server that records the PID.5 name
/// of every message and answers with an application ack.
async fn start_echo_server() -> (Hl7Server, u16, Arc<Mutex<Option<String>>>) {
    let received_name: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let sink = received_name.clone();

    let server = Hl7Server::new(
        ServerConfig::new(0)
            .with_encoding("windows-1252")
            .with_enhanced_mode(true),
        move |connection| {
            let sink = sink.clone();
            let conn = connection.clone();
            connection.on_message(move |message| {
                *sink.lock().unwrap() = message
                    .get_segment("PID")
                    .and_then(|segment| segment.get_field(5))
                    .map(str::to_string);
                let ack = message.build_ack(AckCode::AA);
                let conn = conn.clone();
                tokio::spawn(async move {
                    let _ = conn.send(&ack).await;
                });
            });
        },
    )
    .unwrap();
    server.start().await.unwrap();
    let port = server.local_addr().unwrap().port();
    (server, port, received_name)
}

#[tokio::test]
async fn scenario_matching_encodings_round_trip() {
    let (server, port, received_name) = start_echo_server().await;

    let client = Hl7Client::new(
        ClientConfig::new("127.0.0.1", port).with_encoding("windows-1252"),
    )
    .unwrap();

    // ANY resolves on the first ack: the automatic commit ack from
    // enhanced mode arrives before the handler's application ack.
    let ack = client
        .send_and_wait(&adt_with_name(PATIENT_NAME), AckCategory::Any)
        .await
        .unwrap();
    assert_eq!(ack.ack_code(), Some("CA"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(received_name.lock().unwrap().as_deref(), Some(PATIENT_NAME));

    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_application_ack_still_arrives_in_enhanced_mode() {
    let (server, port, _received_name) = start_echo_server().await;

    let client = Hl7Client::new(
        ClientConfig::new("127.0.0.1", port).with_encoding("windows-1252"),
    )
    .unwrap();

    // Waiting for the application class skips the automatic commit ack.
    let ack = client
        .send_and_wait(&adt_with_name(PATIENT_NAME), AckCategory::Application)
        .await
        .unwrap();
    assert_eq!(ack.ack_code(), Some("AA"));

    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_mismatched_encodings_garble_without_crashing() {
    let (server, port, received_name) = start_echo_server().await;

    // utf-8 client against the windows-1252 server
    let client =
        Hl7Client::new(ClientConfig::new("127.0.0.1", port).with_encoding("utf-8")).unwrap();

    let ack = client
        .send_and_wait(&adt_with_name(PATIENT_NAME), AckCategory::Any)
        .await
        .unwrap();
    assert_eq!(ack.ack_code(), Some("CA"));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let seen = received_name.lock().unwrap().clone().unwrap();
    // The name arrives garbled, not missing: each utf-8 byte of the
    // non-ASCII characters was decoded as its own windows-1252 character.
    assert_ne!(seen, PATIENT_NAME);
    assert!(seen.chars().count() > PATIENT_NAME.chars().count());

    client.close().await;
    server.stop().await.unwrap();
}

#[tokio::test]
async fn scenario_receive_persist_forward() {
    // Inbound channel: enhanced server that enqueues everything it hears.
    let temp_dir = TempDir::new().unwrap();
    let mut queue = DurableQueue::new(temp_dir.path().join("messages.sqlite3"));
    queue.init().unwrap();
    let queue = Arc::new(Mutex::new(queue));

    let enqueue = queue.clone();
    let inbound = Hl7Server::new(
        ServerConfig::new(0).with_enhanced_mode(true),
        move |connection| {
            let enqueue = enqueue.clone();
            let remote = connection.remote();
            connection.on_message(move |message| {
                enqueue
                    .lock()
                    .unwrap()
                    .add_message(message, "adt", &remote, Some("Agent/cb-1"))
                    .unwrap();
            });
        },
    )
    .unwrap();
    inbound.start().await.unwrap();
    let inbound_port = inbound.local_addr().unwrap().port();

    // Upstream destination the worker forwards to.
    let upstream = Hl7Server::new(ServerConfig::new(0), |connection| {
        let conn = connection.clone();
        connection.on_message(move |message| {
            let ack = message.build_ack(AckCode::AA);
            let conn = conn.clone();
            tokio::spawn(async move {
                let _ = conn.send(&ack).await;
            });
        });
    })
    .unwrap();
    upstream.start().await.unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();

    // A source system delivers one message to the inbound channel.
    let source = Hl7Client::new(ClientConfig::new("127.0.0.1", inbound_port)).unwrap();
    source
        .send_and_wait(&adt_with_name("JONES^WILLIAM"), AckCategory::Commit)
        .await
        .unwrap();
    source.close().await;

    tokio::time::sleep(Duration::from_millis(200)).await;

    // Worker: pick up, forward, record the outcome.
    let pending = queue.lock().unwrap().get_next_message("adt").unwrap().unwrap();
    assert_eq!(pending.status, MessageStatus::Received);
    assert_eq!(pending.callback.as_deref(), Some("Agent/cb-1"));

    let forwarder = Hl7Client::new(ClientConfig::new("127.0.0.1", upstream_port)).unwrap();
    let outbound = Hl7Message::parse(&pending.raw_message).unwrap();
    queue.lock().unwrap().mark_as_sent(pending.id).unwrap();
    let ack = forwarder
        .send_and_wait(&outbound, AckCategory::Application)
        .await
        .unwrap();
    assert_eq!(ack.ack_code(), Some("AA"));
    queue.lock().unwrap().mark_as_app_acked(pending.id).unwrap();

    let queue_ref = queue.lock().unwrap();
    assert_eq!(queue_ref.count_by_status(MessageStatus::AppAcked).unwrap(), 1);
    assert!(queue_ref.get_next_message("adt").unwrap().is_none());
    drop(queue_ref);

    forwarder.close().await;
    inbound.stop().await.unwrap();
    upstream.stop().await.unwrap();
    queue.lock().unwrap().close();
}
