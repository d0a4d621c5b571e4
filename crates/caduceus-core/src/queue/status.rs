//! The delivery-status state machine for queued messages.

use crate::error::{AgentError, Result};
use std::fmt;

/// Delivery status of a queued message.
///
/// `received → sent → {commit_acked, app_acked, error, timed_out}`, where
/// `timed_out` is retryable: pickup treats it exactly like `received`.
/// Responses run `response_queued → {response_sent, response_timed_out,
/// response_error}`. The set is closed - the queue schema enforces it with
/// a CHECK constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Received,
    Sent,
    TimedOut,
    Error,
    CommitAcked,
    AppAcked,
    ResponseQueued,
    ResponseSent,
    ResponseTimedOut,
    ResponseError,
}

impl MessageStatus {
    /// Every status, in schema order.
    pub const ALL: [MessageStatus; 10] = [
        MessageStatus::Received,
        MessageStatus::Sent,
        MessageStatus::TimedOut,
        MessageStatus::Error,
        MessageStatus::CommitAcked,
        MessageStatus::AppAcked,
        MessageStatus::ResponseQueued,
        MessageStatus::ResponseSent,
        MessageStatus::ResponseTimedOut,
        MessageStatus::ResponseError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Received => "received",
            MessageStatus::Sent => "sent",
            MessageStatus::TimedOut => "timed_out",
            MessageStatus::Error => "error",
            MessageStatus::CommitAcked => "commit_acked",
            MessageStatus::AppAcked => "app_acked",
            MessageStatus::ResponseQueued => "response_queued",
            MessageStatus::ResponseSent => "response_sent",
            MessageStatus::ResponseTimedOut => "response_timed_out",
            MessageStatus::ResponseError => "response_error",
        }
    }

    pub fn parse(value: &str) -> Result<MessageStatus> {
        MessageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or_else(|| AgentError::Database {
                message: format!("unknown message status: {}", value),
                source: None,
            })
    }

    /// The timestamp column written when a message enters this status.
    pub fn timestamp_column(&self) -> &'static str {
        match self {
            MessageStatus::Received => "received_time",
            MessageStatus::Sent => "sent_time",
            MessageStatus::TimedOut => "timed_out_time",
            MessageStatus::Error => "error_time",
            MessageStatus::CommitAcked => "commit_acked_time",
            MessageStatus::AppAcked => "app_acked_time",
            MessageStatus::ResponseQueued => "response_queued_time",
            MessageStatus::ResponseSent => "response_sent_time",
            MessageStatus::ResponseTimedOut => "response_timed_out_time",
            MessageStatus::ResponseError => "response_error_time",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
