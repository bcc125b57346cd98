//! # Error Taxonomy
//!
//! Purpose: Give callers one error type whose variants map onto the failure
//! classes of the pool and the wire protocol, so they can branch on kinds
//! instead of matching server text.
//!
//! ## Design Principles
//! 1. **Typed Kinds**: `Error::kind()` collapses variants into the caller-facing
//!    categories (a pool timeout is a connection error, for example).
//! 2. **Source Chaining**: IO and TLS failures keep their source error.
//! 3. **No Retry Here**: Errors describe what happened; retry policy belongs
//!    to the caller.

use std::time::Duration;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the parser, the pools, and connections.
#[derive(Debug, Error)]
pub enum Error {
    /// The URL or builder configuration is unusable.
    #[error("{0}")]
    Config(String),

    /// A typed option could not be converted to its required type.
    #[error("invalid value for `{key}`: {value:?}")]
    InvalidValue {
        /// Option name.
        key: String,
        /// Raw value as supplied.
        value: String,
    },

    /// Socket-level failure (refused, reset, broken pipe).
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-level failure reported by this crate or the server.
    #[error("connection error: {0}")]
    Connection(String),

    /// A socket read or write exceeded `socket_timeout`.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The blocking pool had no free permit within its timeout.
    #[error("no connection available within {0:?}")]
    PoolTimeout(Duration),

    /// The non-blocking pool is at `max_connections`.
    #[error("too many connections")]
    MaxConnections,

    /// TLS setup or session failure.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Credentials were rejected or not expected by the server.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// Server is loading its dataset; the connection has been closed.
    #[error("server is loading: {0}")]
    BusyLoading(String),

    /// Write issued against a read-only replica.
    #[error("read-only replica: {0}")]
    ReadOnly(String),

    /// Server refused the command because `maxmemory` is reached.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The authenticated user lacks the ACL permission.
    #[error("no permission: {0}")]
    NoPermission(String),

    /// A queued transaction was discarded.
    #[error("transaction aborted: {0}")]
    ExecAbort(String),

    /// `EVALSHA` referenced an unknown script.
    #[error("no such script: {0}")]
    NoScript(String),

    /// Any other error reply from the server.
    #[error("server error: {0}")]
    Response(String),

    /// Reply framing was invalid or unexpected.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Caller-facing error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad URL or pool configuration.
    Config,
    /// Typed option failed conversion.
    InvalidValue,
    /// Transport failure, socket timeout, or blocking-pool exhaustion.
    Connection,
    /// Non-blocking pool at capacity.
    MaxConnections,
    /// Authentication failure.
    Authentication,
    /// Server loading its dataset.
    BusyLoading,
    /// Read-only replica.
    ReadOnly,
    /// Server out of memory.
    OutOfMemory,
    /// ACL denied.
    NoPermission,
    /// Transaction aborted.
    ExecAbort,
    /// Unknown script.
    NoScript,
    /// Unclassified error reply.
    Response,
    /// Framing violation.
    Protocol,
}

impl Error {
    /// Returns the category this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::InvalidValue { .. } => ErrorKind::InvalidValue,
            Error::Io(_)
            | Error::Connection(_)
            | Error::Timeout(_)
            | Error::PoolTimeout(_)
            | Error::Tls(_) => ErrorKind::Connection,
            Error::MaxConnections => ErrorKind::MaxConnections,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::BusyLoading(_) => ErrorKind::BusyLoading,
            Error::ReadOnly(_) => ErrorKind::ReadOnly,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::NoPermission(_) => ErrorKind::NoPermission,
            Error::ExecAbort(_) => ErrorKind::ExecAbort,
            Error::NoScript(_) => ErrorKind::NoScript,
            Error::Response(_) => ErrorKind::Response,
            Error::Protocol(_) => ErrorKind::Protocol,
        }
    }

    /// True for transport failures, socket timeouts, and pool timeouts.
    pub fn is_connection_error(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    pub(crate) fn invalid_value(key: &str, value: impl Into<String>) -> Self {
        Error::InvalidValue {
            key: key.to_string(),
            value: value.into(),
        }
    }
}
