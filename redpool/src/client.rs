//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking API for issuing commands through a
//! connection pool.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides checkout, release, and framing.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Pool Agnostic**: Works over the non-blocking or the blocking pool.
//! 4. **Fail Fast**: Unexpected reply types surface as protocol errors.

use std::time::Duration;

use crate::blocking::BlockingConnectionPool;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, ConnectionSource, PooledConnection};
use crate::pubsub::PubSub;
use crate::resp::RespValue;

/// TTL state returned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Synchronous client over a connection pool.
///
/// Each call checks out a connection, runs one command, and releases it.
/// A connection closed by a fatal error is discarded by the pool on release.
#[derive(Debug, Clone)]
pub struct Client<P: ConnectionSource = ConnectionPool> {
    pool: P,
}

impl Client<ConnectionPool> {
    /// Creates a client over a non-blocking pool built from `url`.
    pub fn from_url(url: &str) -> Result<Self> {
        Ok(Client::new(ConnectionPool::from_url(url)?))
    }
}

impl Client<BlockingConnectionPool> {
    /// Creates a client over a blocking pool built from `url`.
    pub fn from_url_blocking(url: &str) -> Result<Self> {
        Ok(Client::new(BlockingConnectionPool::from_url(url)?))
    }
}

impl<P: ConnectionSource> Client<P> {
    /// Wraps an existing pool.
    pub fn new(pool: P) -> Self {
        Client { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &P {
        &self.pool
    }

    /// Runs one raw command.
    pub fn execute(&self, args: &[&[u8]]) -> Result<RespValue> {
        let mut conn = self.checkout()?;
        conn.execute(args)
    }

    /// Fetches a value by key. Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.execute(&[b"GET", key])? {
            RespValue::Bulk(data) => Ok(data),
            other => Err(unexpected("GET", &other)),
        }
    }

    /// Sets a value without expiration.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        match self.execute(&[b"SET", key, value])? {
            reply if reply.is_ok() => Ok(()),
            other => Err(unexpected("SET", &other)),
        }
    }

    /// Sets a value with an expiration in whole seconds.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        let seconds = ttl.as_secs().to_string();
        match self.execute(&[b"SET", key, value, b"EX", seconds.as_bytes()])? {
            reply if reply.is_ok() => Ok(()),
            other => Err(unexpected("SET", &other)),
        }
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        match self.execute(&[b"DEL", key])? {
            RespValue::Integer(count) => Ok(count > 0),
            other => Err(unexpected("DEL", &other)),
        }
    }

    /// Returns the TTL state of a key.
    pub fn ttl(&self, key: &[u8]) -> Result<Ttl> {
        match self.execute(&[b"TTL", key])? {
            RespValue::Integer(-2) => Ok(Ttl::Missing),
            RespValue::Integer(-1) => Ok(Ttl::NoExpiry),
            RespValue::Integer(secs) if secs >= 0 => Ok(Ttl::ExpiresIn(Duration::from_secs(secs as u64))),
            other => Err(unexpected("TTL", &other)),
        }
    }

    /// Pings the server and returns the reply payload.
    pub fn ping(&self, payload: Option<&[u8]>) -> Result<Vec<u8>> {
        let reply = match payload {
            Some(data) => self.execute(&[b"PING", data])?,
            None => self.execute(&[b"PING"])?,
        };
        match reply {
            RespValue::Simple(text) => Ok(text),
            RespValue::Bulk(Some(data)) => Ok(data),
            other => Err(unexpected("PING", &other)),
        }
    }

    /// Fetches the INFO text.
    pub fn info(&self) -> Result<Vec<u8>> {
        match self.execute(&[b"INFO"])? {
            RespValue::Bulk(Some(data)) => Ok(data),
            other => Err(unexpected("INFO", &other)),
        }
    }

    /// Starts a pub/sub session on a dedicated connection.
    ///
    /// Hand the session back with [`release_pubsub`](Self::release_pubsub).
    pub fn pubsub(&self) -> Result<PubSub> {
        Ok(PubSub::new(self.pool.get_connection()?))
    }

    /// Ends a pub/sub session and returns its connection to the pool.
    ///
    /// A connection that may still be subscribed is closed first.
    pub fn release_pubsub(&self, session: PubSub) {
        let subscribed = session.is_subscribed()
            || session.channels().next().is_some()
            || session.patterns().next().is_some();
        let mut conn = session.into_connection();
        if subscribed {
            conn.disconnect();
        }
        drop(self.pool.release(conn));
    }

    fn checkout(&self) -> Result<PooledConnection<P>> {
        let conn = self.pool.get_connection()?;
        Ok(PooledConnection::new(self.pool.clone(), conn))
    }
}

fn unexpected(command: &str, reply: &RespValue) -> Error {
    Error::Protocol(format!("unexpected reply to {command}: {reply:?}"))
}
