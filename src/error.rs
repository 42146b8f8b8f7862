//! Error types

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single connect attempt.
///
/// Produced by [`crate::factory::BlockingConnection::connect`] and
/// [`crate::factory::AsyncConnection::connect`]. By default a `ConnectError`
/// is recorded and the batch moves on; only an error handler can turn it into
/// [`Error::Fatal`].
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Socket-level failure (refused, reset, unreachable)
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TLS setup or handshake failure
    #[error("tls error: {0}")]
    Tls(String),

    /// A stage of the connect did not finish in time
    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        /// Stage that timed out (`connect`, `handshake`)
        stage: &'static str,
        /// Configured limit
        timeout: Duration,
    },

    /// Server answered a command with a negative reply
    #[error("server rejected {command}: {code} {message}")]
    Rejected {
        /// Command verb that was rejected
        command: String,
        /// Reply code
        code: u16,
        /// Reply text
        message: String,
    },

    /// Malformed or unexpected server reply
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Server closed the control connection mid-negotiation
    #[error("connection closed by server")]
    ConnectionClosed,

    /// Session state machine violation
    #[error("invalid session state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// Connect interrupted by run cancellation
    #[error("connect cancelled")]
    Cancelled,
}

impl ConnectError {
    /// Stable label used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Tls(_) => "tls",
            Self::Timeout { .. } => "timeout",
            Self::Rejected { .. } => "rejected",
            Self::Protocol(_) => "protocol",
            Self::ConnectionClosed => "connection_closed",
            Self::InvalidState { .. } => "invalid_state",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid run or connection configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// A connect failure escalated by the error handler; the batch was aborted
    #[error("fatal error in phase {phase} at cycle {cycle} ({completed} cycles completed): {source}")]
    Fatal {
        /// Phase label
        phase: String,
        /// 1-based index of the escalated cycle
        cycle: u64,
        /// Cycles completed in the phase when the batch stopped
        completed: u64,
        /// The escalated connect failure
        #[source]
        source: ConnectError,
    },

    /// Orchestrator state machine violation
    #[error("invalid state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state
        expected: String,
        /// Actual state
        actual: String,
    },

    /// The run was cancelled before finishing
    #[error("run cancelled during {phase}")]
    Cancelled {
        /// Step that was interrupted
        phase: String,
    },

    /// A blocking worker thread failed (panicked or was aborted)
    #[error("worker failed: {0}")]
    Worker(String),

    /// Reading a memory metric failed
    #[error("memory probe failed: {0}")]
    Memory(String),

    /// I/O error outside of a connect attempt
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::Cancelled { .. } => 130,
            _ => 1,
        }
    }

    /// Whether this error was escalated from a connect failure
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
