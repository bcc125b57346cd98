//! # Blocking Connection Pool
//!
//! Purpose: Bound concurrency with a counting gate so callers wait, up to a
//! timeout, for a connection instead of failing at capacity.
//!
//! ## Design Principles
//! 1. **Decorator**: Checkout and release bookkeeping is the non-blocking
//!    pool's; this layer only adds the permit gate.
//! 2. **FIFO Fairness**: Waiters take tickets and are served in arrival order.
//! 3. **Bounded Waits**: Every wait has a deadline; spurious wake-ups re-check.
//! 4. **Separate Locks**: The gate lock and the pool lock are never held
//!    together.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace, warn};

use crate::config::UrlOverrides;
use crate::connection::BoxedConnection;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, ConnectionSource, PoolBuilder, PoolStatus, PooledConnection};

/// Capacity used when none is configured.
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;

/// Wait bound used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

struct GateState {
    permits: usize,
    queue: VecDeque<u64>,
    next_ticket: u64,
    pid: u32,
}

impl GateState {
    fn head_may_proceed(&self, ticket: u64) -> bool {
        self.permits > 0 && self.queue.front() == Some(&ticket)
    }
}

/// Counting permit store with FIFO waiters.
///
/// Permits taken in a parent process cannot come back in a forked child, so
/// the first use after a pid change refills the gate.
pub(crate) struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
    max: usize,
}

impl Gate {
    pub(crate) fn new(permits: usize) -> Self {
        Gate {
            state: Mutex::new(GateState {
                permits,
                queue: VecDeque::new(),
                next_ticket: 0,
                pid: std::process::id(),
            }),
            changed: Condvar::new(),
            max: permits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        let mut state = self.state.lock();
        let pid = std::process::id();
        if state.pid != pid {
            warn!(old_pid = state.pid, pid, "process changed, refilling connection gate");
            state.pid = pid;
            state.permits = self.max;
            state.queue.clear();
        }
        state
    }

    /// Takes one permit, waiting at most `timeout`. Returns false on timeout.
    pub(crate) fn acquire(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.queue.push_back(ticket);

        loop {
            if state.head_may_proceed(ticket) {
                state.queue.pop_front();
                state.permits -= 1;
                if state.permits > 0 && !state.queue.is_empty() {
                    self.changed.notify_all();
                }
                return true;
            }

            let timed_out = match deadline {
                Some(deadline) => self.changed.wait_until(&mut state, deadline).timed_out(),
                None => {
                    self.changed.wait(&mut state);
                    false
                }
            };
            if timed_out && !state.head_may_proceed(ticket) {
                state.queue.retain(|queued| *queued != ticket);
                // Our ticket may have been blocking the next waiter.
                if state.permits > 0 && !state.queue.is_empty() {
                    self.changed.notify_all();
                }
                return false;
            }
        }
    }

    /// Returns one permit and wakes the waiters.
    ///
    /// Never exceeds the capacity, so a checkout that predates a refill
    /// cannot add a permit.
    pub(crate) fn release(&self) {
        {
            let mut state = self.lock();
            state.permits = (state.permits + 1).min(self.max);
        }
        self.changed.notify_all();
    }

    pub(crate) fn permits(&self) -> usize {
        self.lock().permits
    }

    pub(crate) fn waiters(&self) -> usize {
        self.lock().queue.len()
    }

    /// Pretends the permits were taken by process `pid`.
    #[cfg(test)]
    fn inherit_from(&self, pid: u32) {
        self.state.lock().pid = pid;
    }
}

/// Connection pool that waits for capacity instead of failing.
///
/// Cloning is cheap; clones share the gate and the connections.
#[derive(Clone)]
pub struct BlockingConnectionPool {
    pool: ConnectionPool,
    gate: Arc<Gate>,
    timeout: Duration,
}

impl BlockingConnectionPool {
    /// Starts a builder; finish with [`PoolBuilder::build_blocking`].
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Creates a pool from a URL; `?timeout=` and `?max_connections=` apply.
    pub fn from_url(url: &str) -> Result<Self> {
        PoolBuilder::from_url(url)?.build_blocking()
    }

    /// Creates a pool from a URL plus caller overrides.
    pub fn from_url_with(url: &str, overrides: UrlOverrides) -> Result<Self> {
        PoolBuilder::from_url_with(url, overrides)?.build_blocking()
    }

    /// Wait bound for `get_connection`.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Capacity.
    pub fn max_connections(&self) -> usize {
        self.pool.max_connections().unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    /// Checks out a ready connection, waiting up to `timeout` for capacity.
    pub fn get_connection(&self) -> Result<BoxedConnection> {
        if !self.gate.acquire(self.timeout) {
            debug!(pool = self.pool.id(), timeout = ?self.timeout, "no connection available");
            return Err(Error::PoolTimeout(self.timeout));
        }
        match self.pool.get_connection() {
            Ok(conn) => Ok(conn),
            Err(err) => {
                self.gate.release();
                Err(err)
            }
        }
    }

    /// Checks out a connection wrapped in a guard that releases on drop.
    pub fn get(&self) -> Result<PooledConnection<BlockingConnectionPool>> {
        let conn = self.get_connection()?;
        Ok(PooledConnection::new(self.clone(), conn))
    }

    /// Returns a connection and frees its permit.
    ///
    /// A connection owned by another pool is handed back and no permit is
    /// returned.
    pub fn release(&self, conn: BoxedConnection) -> Option<BoxedConnection> {
        if let Some(foreign) = self.pool.release(conn) {
            return Some(foreign);
        }
        self.gate.release();
        None
    }

    /// Closes idle connections and forgets checked-out ones.
    pub fn disconnect(&self) {
        self.pool.disconnect();
    }

    /// Same as [`disconnect`](Self::disconnect).
    pub fn reset(&self) {
        self.pool.reset();
    }

    /// Occupancy snapshot of the underlying pool.
    pub fn status(&self) -> PoolStatus {
        self.pool.status()
    }

    /// Permits not currently taken.
    pub fn free_permits(&self) -> usize {
        self.gate.permits()
    }

    /// Callers currently waiting for a permit.
    pub fn waiters(&self) -> usize {
        self.gate.waiters()
    }
}

impl ConnectionSource for BlockingConnectionPool {
    fn get_connection(&self) -> Result<BoxedConnection> {
        BlockingConnectionPool::get_connection(self)
    }

    fn release(&self, conn: BoxedConnection) -> Option<BoxedConnection> {
        BlockingConnectionPool::release(self, conn)
    }
}

impl fmt::Display for BlockingConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.pool.fmt_repr(f, "BlockingConnectionPool")
    }
}

impl fmt::Debug for BlockingConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl PoolBuilder {
    /// Builds a blocking pool; capacity defaults to 50 and the wait to 20s.
    pub fn build_blocking(self) -> Result<BlockingConnectionPool> {
        let max = self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS);
        if max == 0 {
            return Err(Error::Config("max_connections must be a positive integer".into()));
        }
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT);
        let pool = PoolBuilder {
            max_connections: Some(max),
            ..self
        }
        .build()?;
        trace!(pool = pool.id(), max, timeout = ?timeout, "blocking gate created");
        Ok(BlockingConnectionPool {
            pool,
            gate: Arc::new(Gate::new(max)),
            timeout,
        })
    }
}
