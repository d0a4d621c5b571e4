//! Centralized configuration for the Caduceus agent core.
//!
//! Follows two conventions: tunable constants live in const-struct blocks,
//! while per-instance settings (client/server endpoints) are plain structs
//! passed through constructors.

use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "caduceus-agent";
    /// Directory component used for PID files, keyed by vendor.
    pub const PID_DIR_NAME: &'static str = "caduceus";
}

/// MLLP transport tuning.
pub struct MllpConfig;

impl MllpConfig {
    /// Default timeout for outbound TCP connects.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(30_000);
    /// Upper bound on a single MLLP frame. Real HL7 feeds occasionally carry
    /// embedded PDF payloads, so this is generous.
    pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;
    /// Delay before retrying a bind that failed with address-in-use.
    pub const BIND_RETRY_DELAY: Duration = Duration::from_millis(500);
    /// Default character encoding label for HL7 payloads.
    pub const DEFAULT_ENCODING: &'static str = "utf-8";
}

/// Durable queue tuning.
pub struct QueueConfig;

impl QueueConfig {
    /// SQLite page cache, in KiB (negative pragma form is applied).
    pub const CACHE_SIZE_KIB: i64 = 64_000;
    /// Busy timeout for cross-process access to the queue file.
    pub const BUSY_TIMEOUT_MS: u64 = 5_000;
    /// Prepared-statement cache capacity; sized to the statement set.
    pub const STATEMENT_CACHE_CAPACITY: usize = 32;
    /// Poll interval while waiting for the previous owner to release.
    pub const RELEASE_POLL_INTERVAL: Duration = Duration::from_millis(100);
    /// Default limit for the global received-message drain.
    pub const DRAIN_LIMIT: usize = 1000;
}

/// Process lock tuning.
pub struct PidConfig;

impl PidConfig {
    /// Poll interval while waiting for a PID file to appear.
    pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
}

/// Settings for an outbound MLLP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Character encoding label (WHATWG name, e.g. "utf-8", "windows-1252").
    pub encoding: String,
    /// Enable TCP keepalive on the socket.
    pub keep_alive: bool,
    pub connect_timeout: Duration,
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            encoding: MllpConfig::DEFAULT_ENCODING.to_string(),
            keep_alive: false,
            connect_timeout: MllpConfig::CONNECT_TIMEOUT,
        }
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Settings for an inbound MLLP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Character encoding label applied to every accepted connection.
    pub encoding: String,
    /// When enabled, every inbound message is answered with an automatic
    /// commit-level ack before the application-level ack.
    pub enhanced_mode: bool,
}

impl ServerConfig {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            encoding: MllpConfig::DEFAULT_ENCODING.to_string(),
            enhanced_mode: false,
        }
    }

    pub fn with_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.encoding = encoding.into();
        self
    }

    pub fn with_enhanced_mode(mut self, enhanced: bool) -> Self {
        self.enhanced_mode = enhanced;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::new("localhost", 2575);
        assert_eq!(config.encoding, "utf-8");
        assert!(!config.keep_alive);
        assert_eq!(config.connect_timeout, Duration::from_millis(30_000));
    }

    #[test]
    fn test_client_config_builders() {
        let config = ClientConfig::new("lab.example.com", 2575)
            .with_encoding("windows-1252")
            .with_keep_alive(true)
            .with_connect_timeout(Duration::from_millis(500));
        assert_eq!(config.encoding, "windows-1252");
        assert!(config.keep_alive);
        assert_eq!(config.connect_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_server_config_defaults() {
        let config = ServerConfig::new(2575);
        assert!(!config.enhanced_mode);
        assert_eq!(config.encoding, "utf-8");
    }
}
