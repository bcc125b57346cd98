//! # redpool
//!
//! Purpose: Manage pooled, health-checked connections to a Redis-compatible
//! server over RESP2, with typed errors callers can branch on.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections; bound how many exist.
//! 2. **Explicit Instances**: Pools are values with their own locks, never
//!    process-wide singletons.
//! 3. **Typed Failures**: Server error text is classified by an ordered rule
//!    table into `Error` variants.
//! 4. **Protocol Clarity**: Encode and parse RESP2 explicitly.
//!
//! ```no_run
//! use redpool::Client;
//!
//! let client = Client::from_url("redis://localhost:6379/0?health_check_interval=30")?;
//! client.set(b"key", b"value")?;
//! assert_eq!(client.get(b"key")?, Some(b"value".to_vec()));
//! # Ok::<(), redpool::Error>(())
//! ```

mod blocking;
mod classify;
mod client;
mod config;
mod connection;
mod error;
mod health;
mod pool;
mod pubsub;
mod resp;
mod tls;

#[cfg(test)]
mod test_support;

pub use blocking::{BlockingConnectionPool, DEFAULT_MAX_CONNECTIONS, DEFAULT_TIMEOUT};
pub use classify::{classify, Classification, ErrorRule, ServerErrorKind, ERROR_RULES};
pub use client::{Client, Ttl};
pub use config::{
    parse_url, to_bool, AsBoolFlag, CertReqs, ConnectionKwargs, KwargValue, ParsedUrl,
    UrlOverrides,
};
pub use connection::{
    BoxedConnection, Connection, ConnectionClass, ConnectionFactory, ConnectionId,
    ConnectionSettings, ConnectionSpec, ConnectionState, Epoch, ManagedConnection, Transport,
};
pub use error::{Error, ErrorKind, Result};
pub use health::HealthCheckClock;
pub use pool::{
    CacheLayer, ConnectionPool, ConnectionSource, PoolBuilder, PoolStatus, PooledConnection,
};
pub use pubsub::{MessageKind, PubSub, PubSubMessage, HEALTH_CHECK_MESSAGE};
pub use resp::{encode_command, read_response, RespValue};
pub use tls::TlsOptions;
