//! Custom error types for the framework.
//!
//! This module defines the primary error type, `PipelineError`, used across the
//! crate. Using the `thiserror` crate, it gives a centralized taxonomy for the
//! failure modes of the system:
//!
//! - **`Config`**: Wraps errors from the `config` crate (file parsing, missing
//!   sections, format issues).
//! - **`Configuration`**: Semantic configuration problems that pass parsing but
//!   are logically invalid, such as a receiver bound to an unknown data type or
//!   two pipelines declaring overlapping stream requirements. These are fatal
//!   and detected before the dispatch loop runs.
//! - **`Io`**: Wraps standard `std::io::Error` for local file and socket issues.
//! - **`Protocol`**: A malformed or unexpected message on the data-client
//!   boundary. Fails the current request only.
//! - **`Transport`**: Connect failures, read timeouts and disconnects on the
//!   data-client boundary. Fails the current request; eligible for retry on the
//!   next dispatch cycle.
//! - **`Dispatch`**: A dispatch cycle ran no pipeline while empty cycles are
//!   disallowed. Fatal; stops the driver.
//! - **`UnknownDataType`**: A component asked the buffer registry for a data
//!   type that was never configured.
//!
//! Buffer contention is deliberately not represented here: `acquire_writable`
//! and `acquire_current` return `Option` and callers treat `None` as
//! backpressure, never as an error.

use thiserror::Error;

/// Convenience alias for results using the framework error type.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Top-level error taxonomy for the framework.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Configuration file could not be loaded or parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Configuration parsed but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or unexpected message on the client/server boundary.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Network-level failure on the client/server boundary.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The dispatch loop ran a cycle without invoking any pipeline.
    #[error("Dispatch error: {0}")]
    Dispatch(String),

    /// A data type name with no configured buffer.
    #[error("Unknown data type '{0}'")]
    UnknownDataType(String),
}

/// Network transport failures, kept separate so callers can distinguish a
/// timeout (retry the whole request) from a dead connection (abandon the
/// session).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Could not establish a connection to the data server.
    #[error("Failed to connect to data server: {0}")]
    Connect(std::io::Error),

    /// A read did not complete within the configured timeout.
    #[error("Timed out after {elapsed_ms} ms waiting for {expected} bytes ({received} received)")]
    Timeout {
        /// Milliseconds elapsed before giving up.
        elapsed_ms: u64,
        /// Bytes the peer declared it would send.
        expected: usize,
        /// Bytes actually received before the deadline.
        received: usize,
    },

    /// The peer closed the connection mid-exchange.
    #[error("Connection closed by peer")]
    Disconnected,

    /// A read failed for a reason other than timeout or disconnect.
    #[error("Read error: {0}")]
    Read(std::io::Error),

    /// A request could not be written to the socket.
    #[error("Write error: {0}")]
    Write(std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_error_wraps_into_pipeline_error() {
        let err: PipelineError = TransportError::Disconnected.into();
        match err {
            PipelineError::Transport(TransportError::Disconnected) => {}
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn timeout_message_reports_progress() {
        let err = TransportError::Timeout {
            elapsed_ms: 500,
            expected: 1024,
            received: 16,
        };
        let msg = err.to_string();
        assert!(msg.contains("500 ms"));
        assert!(msg.contains("1024"));
        assert!(msg.contains("16"));
    }
}
