//! Platform abstraction layer for cross-platform compatibility.
//!
//! Centralizes OS-specific code so `#[cfg]` blocks live in one place
//! instead of being scattered through the transport and lock modules.
//!
//! - `process` - Process liveness probing and termination
//!
//! # Supported Platforms
//!
//! - **Linux**: Full support
//! - **macOS**: Full support
//! - **Windows**: Full support

pub mod process;

// Re-export commonly used items
pub use process::{is_process_alive, terminate_process};
