//! Opaque HL7v2 message values.
//!
//! The agent core never interprets clinical content. This module provides
//! only the accessor surface the transport and queue need: segment/field
//! lookup, the MSH header fields used for correlation and queue metadata,
//! the MSA acknowledgment fields, and ack construction.

mod ack;
mod message;

pub use ack::{AckCategory, AckClass, AckCode};
pub use message::{Hl7Message, Hl7Segment};
