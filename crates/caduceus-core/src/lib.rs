//! Caduceus Core - HL7v2-over-MLLP integration agent building blocks.
//!
//! This crate provides the durable heart of a healthcare integration
//! agent: MLLP framing and connections with request/reply correlation, a
//! crash-safe SQLite message queue with an explicit delivery-status state
//! machine, and the process-singleton / ownership-handoff locks that make
//! rolling upgrades safe.
//!
//! # Example
//!
//! ```rust,ignore
//! use caduceus_core::config::{ClientConfig, ServerConfig};
//! use caduceus_core::hl7::{AckCategory, AckCode, Hl7Message};
//! use caduceus_core::mllp::{Hl7Client, Hl7Server};
//!
//! #[tokio::main]
//! async fn main() -> caduceus_core::Result<()> {
//!     let server = Hl7Server::new(ServerConfig::new(2575), |connection| {
//!         let conn = connection.clone();
//!         connection.on_message(move |message| {
//!             let ack = message.build_ack(AckCode::AA);
//!             let conn = conn.clone();
//!             tokio::spawn(async move { conn.send(&ack).await });
//!         });
//!     })?;
//!     server.start().await?;
//!
//!     let client = Hl7Client::new(ClientConfig::new("localhost", 2575))?;
//!     let message = Hl7Message::parse("MSH|^~\\&|A|B|C|D|20240101||ADT^A01|MSG1|P|2.5.1")?;
//!     let ack = client.send_and_wait(&message, AckCategory::Any).await?;
//!     println!("acked: {:?}", ack.ack_code());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod hl7;
pub mod mllp;
pub mod pid;
pub mod platform;
pub mod queue;

// Re-export commonly used types
pub use config::{AppConfig, ClientConfig, MllpConfig, QueueConfig, ServerConfig};
pub use error::{AgentError, Result};
pub use hl7::{AckCategory, AckClass, AckCode, Hl7Message, Hl7Segment};
pub use mllp::{ErrorEvent, Hl7Client, Hl7Connection, Hl7Server, Severity};
pub use queue::{DurableQueue, MessageStatus, QueueMessage};
