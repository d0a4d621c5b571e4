//! MLLP transport: framing codec, connections, client, and server.
//!
//! Layering, leaves first: [`codec`] turns byte streams into discrete
//! frames; [`connection`] owns one socket and correlates acknowledgments;
//! [`client`] manages at most one outbound connection with timeout and
//! reconnect; [`server`] accepts inbound sockets and dispatches them to a
//! handler.

pub mod client;
pub mod codec;
pub mod connection;
pub mod events;
pub mod server;

pub use client::Hl7Client;
pub use codec::FrameDecoder;
pub use connection::Hl7Connection;
pub use events::{ConnectionEvents, ErrorEvent, Listeners, Severity};
pub use server::{ConnectionHandler, Hl7Server};
