//! Error types for the Caduceus agent core.
//!
//! This module defines the error surface shared by the MLLP transport, the
//! durable queue, and the process lock, with meaningful messages for
//! operators reading agent logs.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the Caduceus core.
#[derive(Debug, Error)]
pub enum AgentError {
    // Transport errors
    #[error("Connection timeout after {millis}ms")]
    ConnectTimeout { millis: u64 },

    #[error("Connection attempt superseded by a newer connect call")]
    ConnectSuperseded,

    #[error("Client closed while connecting")]
    ClientClosed,

    #[error("Connection is closed")]
    Closed,

    #[error("Message was still pending when connection closed")]
    ConnectionClosed,

    #[error("Connection closed while {count} messages were pending")]
    PendingOnClose { count: usize },

    // Protocol errors
    #[error("Protocol error: {message}")]
    Frame { message: String },

    #[error("Unsupported character encoding: {label}")]
    Encoding { label: String },

    #[error("Invalid HL7 message: {message}")]
    Parse { message: String },

    #[error("Response received for unknown message control ID: {control_id}")]
    OrphanAck { control_id: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Database errors
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Durable queue is not ready: {operation} called before init() or after close()")]
    NotReady { operation: &'static str },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Process lifecycle errors
    #[error("{app} already running (pid {pid})")]
    AlreadyRunning { app: String, pid: u32 },

    #[error("Timeout after {elapsed:?} while {operation}")]
    Timeout { operation: String, elapsed: Duration },

    #[error("Stop was called but there is no server running")]
    ServerNotRunning,

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Caduceus operations.
pub type Result<T> = std::result::Result<T, AgentError>;

// Conversion implementations for common error types

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        AgentError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for AgentError {
    fn from(err: rusqlite::Error) -> Self {
        AgentError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl AgentError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        AgentError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether this error is a warning-level condition that leaves the
    /// connection usable (orphan acks, close-with-pending notices).
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            AgentError::OrphanAck { .. } | AgentError::PendingOnClose { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AgentError::ConnectTimeout { millis: 500 };
        assert_eq!(err.to_string(), "Connection timeout after 500ms");

        let err = AgentError::AlreadyRunning {
            app: "caduceus-agent".into(),
            pid: 1234,
        };
        assert_eq!(err.to_string(), "caduceus-agent already running (pid 1234)");
    }

    #[test]
    fn test_not_ready_display_names_operation() {
        let err = AgentError::NotReady {
            operation: "add_message",
        };
        assert!(err.to_string().contains("add_message"));
    }

    #[test]
    fn test_warning_classification() {
        assert!(AgentError::OrphanAck {
            control_id: "MSG1".into()
        }
        .is_warning());
        assert!(AgentError::PendingOnClose { count: 3 }.is_warning());
        assert!(!AgentError::ConnectionClosed.is_warning());
    }
}
