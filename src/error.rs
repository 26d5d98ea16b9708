//! Error types for zero-shard.

use thiserror::Error;

/// Result type for zero-shard operations.
pub type Result<T> = core::result::Result<T, Error>;

/// MySQL `ER_UNKNOWN_ERROR`, used for errors synthesized by the proxy.
pub const ER_UNKNOWN_ERROR: u16 = 1105;

/// MySQL `ER_XAER_NOTA`: the XID is not known to the backend.
pub const ER_XAER_NOTA: u16 = 1397;

/// Decoded MySQL ERR packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerError {
    /// Error number
    pub code: u16,
    /// SQLSTATE (5 characters), if the server sent one
    pub sql_state: Option<String>,
    /// Human-readable message
    pub message: String,
}

impl ServerError {
    /// Create an error with the given code and message.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            sql_state: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        match &self.sql_state {
            Some(state) => write!(f, " (errno {}, SQLSTATE {})", self.code, state),
            None => write!(f, " (errno {})", self.code),
        }
    }
}

/// Error type for zero-shard.
#[derive(Debug, Error)]
pub enum Error {
    /// Backend error response
    #[error("MySQL error: {0}")]
    Server(ServerError),

    /// Protocol error (malformed packet, unexpected reply, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed and cannot carry more traffic
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A state machine contract was violated (e.g. a second cohort opened
    /// while one is still in flight)
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid usage (e.g., malformed options)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// The in-flight transaction was interrupted
    #[error("Interrupted: {0}")]
    Interrupted(String),
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ConnectionClosed(_))
    }

    /// Get the MySQL error number if this is a server error.
    pub fn errno(&self) -> Option<u16> {
        match self {
            Error::Server(err) => Some(err.code),
            _ => None,
        }
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}
