// ABOUTME: Error taxonomy shared by the proxy core
//
// Transport and framing errors are fatal to the connection they occur on.
// Timeouts are a distinct kind so callers can branch on them without
// inspecting messages. Configuration errors abort startup.

use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the proxy core
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors produced by the proxy core
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Socket read/write failure or peer close
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Fewer bytes were transferred than the frame declared
    #[error("incorrect number of bytes written: expected {expected}, wrote {written}")]
    ShortWrite {
        /// Bytes the frame required
        expected: u64,
        /// Bytes actually transferred
        written: u64,
    },

    /// Header declared a length outside the valid frame range
    #[error("invalid message length {0}")]
    InvalidMessageLength(i32),

    /// A bounded wait elapsed before the operation finished
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Startup parameters were rejected
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Backend could not be dialed within the retry budget
    #[error("backend {addr} unavailable after {attempts} attempts")]
    BackendUnavailable {
        /// Backend address that was dialed
        addr: String,
        /// Number of dial attempts made
        attempts: u32,
    },

    /// The dispatcher queue no longer has any consumers
    #[error("dispatcher is closed")]
    DispatcherClosed,

    /// The client stopped waiting for this request
    #[error("request abandoned by client connection")]
    Abandoned,

    /// Component was started twice
    #[error("already running")]
    AlreadyRunning,

    /// Component was stopped before it was started
    #[error("not running")]
    NotRunning,
}

impl ProxyError {
    /// True only for errors raised by a bounded wait.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// True for errors meaning the byte stream can no longer be trusted
    /// to be aligned on frame boundaries.
    pub const fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::ShortWrite { .. } | Self::InvalidMessageLength(_)
        )
    }
}
