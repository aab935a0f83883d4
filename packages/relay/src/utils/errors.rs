// packages/relay/src/utils/errors.rs
//! Error types for the relay
//!
//! Every fallible operation in the crate returns [`RelayError`]. Errors are
//! grouped by the layer that raises them so callers can decide whether a
//! failure is fatal to a connection, to an environment, or only to a single
//! request.

use std::io;
use thiserror::Error;

/// Relay result type
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors raised by the relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the stream cleanly at a frame boundary
    #[error("stream closed by peer")]
    StreamClosed,

    /// Peer closed the stream in the middle of a header or payload
    #[error("short read: expected {expected} bytes, got {received}")]
    ShortRead { expected: usize, received: usize },

    /// A write made no progress without reporting an error
    #[error("short write: {written} of {expected} bytes written")]
    ShortWrite { expected: usize, written: usize },

    /// Frame header failed validation
    #[error("corrupt stream: {0}")]
    CorruptStream(String),

    /// Deadline expired while waiting on a peer
    #[error("timed out: {0}")]
    Timeout(String),

    /// Bytes could not be decoded into a message
    #[error("decode failed: {0}")]
    Decode(String),

    /// Message could not be encoded
    #[error("encode failed: {0}")]
    Encode(String),

    /// Pool has been closed and hands out no more environments
    #[error("environment pool for '{0}' is closed")]
    PoolClosed(String),

    /// Environment could not be built
    #[error("environment creation failed: {0}")]
    EnvironmentCreation(String),

    /// Container engine API failure
    #[error("container runtime error: {0}")]
    Container(#[from] bollard::errors::Error),

    /// Container attach/upgrade failure
    #[error("container attach failed: {0}")]
    Attach(String),

    /// Native process could not be started
    #[error("process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    /// Referenced bundle is not installed
    #[error("bundle '{0}' not found")]
    BundleNotFound(String),

    /// Referenced command is not part of the bundle
    #[error("command '{command}' not found in bundle '{bundle}'")]
    CommandNotFound { bundle: String, command: String },

    /// Malformed execution request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Message bus failure
    #[error("message bus error: {0}")]
    Bus(String),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// JSON conversion failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML conversion failure
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl RelayError {
    /// True for errors that leave a connection in an unknown state.
    ///
    /// An environment that hit one of these must be evicted rather than
    /// returned to its pool.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            RelayError::Io(_)
                | RelayError::StreamClosed
                | RelayError::ShortRead { .. }
                | RelayError::ShortWrite { .. }
                | RelayError::CorruptStream(_)
                | RelayError::Timeout(_)
                | RelayError::Decode(_)
                | RelayError::Attach(_)
        )
    }

    /// Convert into an `io::Error`, keeping the original kind where one exists.
    pub fn into_io(self) -> io::Error {
        match self {
            RelayError::Io(e) => e,
            RelayError::StreamClosed | RelayError::ShortRead { .. } => {
                io::Error::new(io::ErrorKind::UnexpectedEof, self.to_string())
            }
            RelayError::ShortWrite { .. } => {
                io::Error::new(io::ErrorKind::WriteZero, self.to_string())
            }
            RelayError::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, self.to_string()),
            other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
        }
    }
}

impl From<config::ConfigError> for RelayError {
    fn from(e: config::ConfigError) -> Self {
        RelayError::Config(e.to_string())
    }
}
