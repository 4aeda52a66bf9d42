/*!
 * Error Types
 *
 * Every fallible operation in the client returns [`Error`]. Errors are
 * grouped by [`ErrorKind`] so callers can decide what is worth retrying:
 * configuration mistakes never are, server error replies leave the
 * connection usable, while corruption and connection failures cost the
 * connection and fail the whole executor run.
 */

use bytes::Bytes;
use smol_str::SmolStr;
use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an [`Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad ring or client setup; fix the configuration, do not retry
    Configuration,
    /// The server answered with an explicit error reply
    Protocol,
    /// Malformed reply stream; the connection was dropped
    Corruption,
    /// Connect, read, write or poll failure, or peer close
    Connection,
    /// The executor deadline passed before all replies arrived
    Timeout,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid weight {weight} for server {address}")]
    InvalidWeight { address: SmolStr, weight: u32 },

    #[error("server {0} already added to the ring")]
    DuplicateAddress(SmolStr),

    #[error("cannot build a continuum without servers")]
    EmptyRing,

    #[error("continuum has not been created")]
    RingNotBuilt,

    #[error("continuum has already been created")]
    ContinuumBuilt,

    #[error("invalid server ordinal {0}")]
    InvalidOrdinal(usize),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("executor misuse: {0}")]
    ExecutorMisuse(&'static str),

    /// Error reply (`-ERR ...`) returned by the server
    #[error("server error: {}", String::from_utf8_lossy(.0))]
    Server(Bytes),

    #[error("protocol corruption: {0}")]
    ProtocolCorruption(String),

    #[error("connect to {address} failed: {source}")]
    ConnectFailed {
        address: SmolStr,
        #[source]
        source: std::io::Error,
    },

    #[error("connection to {0} closed by peer")]
    ConnectionClosed(SmolStr),

    #[error("i/o error on {address}: {source}")]
    Io {
        address: SmolStr,
        #[source]
        source: std::io::Error,
    },

    #[error("event poll failed: {0}")]
    Poll(#[source] std::io::Error),

    #[error("executor run timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidWeight { .. }
            | Error::DuplicateAddress(_)
            | Error::EmptyRing
            | Error::RingNotBuilt
            | Error::ContinuumBuilt
            | Error::InvalidOrdinal(_)
            | Error::InvalidAddress(_)
            | Error::InvalidConfig(_)
            | Error::ExecutorMisuse(_) => ErrorKind::Configuration,
            Error::Server(_) => ErrorKind::Protocol,
            Error::ProtocolCorruption(_) => ErrorKind::Corruption,
            Error::ConnectFailed { .. }
            | Error::ConnectionClosed(_)
            | Error::Io { .. }
            | Error::Poll(_) => ErrorKind::Connection,
            Error::Timeout(_) => ErrorKind::Timeout,
        }
    }

    /// Whether repeating the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Corruption
        )
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Error::ProtocolCorruption(msg.into())
    }
}
