//! # Connection Pool
//!
//! Purpose: Lazily create and recycle connections from one shared spec, and
//! track which ones are checked out so releases can be validated.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: A bounded set of reusable connections; the most
//!    recently released one is handed out first.
//! 2. **Minimal Locking**: The mutex only guards bookkeeping. Sockets are
//!    opened, probed and closed outside it.
//! 3. **Fail Fast**: At capacity the pool returns `MaxConnections` at once.
//! 4. **Ownership Contract**: Only connections this pool handed out are taken
//!    back; anything else is returned to the caller untouched.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::{parse_url, ConnectionKwargs, KwargValue, UrlOverrides};
use crate::connection::{
    BoxedConnection, ConnectionClass, ConnectionId, ConnectionSpec, Epoch, ManagedConnection,
};
use crate::error::{Error, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Wraps freshly created connections with a caching-capable variant.
///
/// The wrapped connection must keep the inner connection's id and epoch.
pub trait CacheLayer: Send + Sync + fmt::Debug {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Wraps a new, not yet connected, connection.
    fn wrap(&self, conn: BoxedConnection) -> Result<BoxedConnection>;
}

/// Anything connections can be checked out from and returned to.
pub trait ConnectionSource: Clone + Send + Sync {
    /// Hands out a ready connection.
    fn get_connection(&self) -> Result<BoxedConnection>;

    /// Takes a connection back; foreign connections are returned.
    fn release(&self, conn: BoxedConnection) -> Option<BoxedConnection>;
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Idle connections ready for reuse.
    pub available: usize,
    /// Connections currently checked out.
    pub in_use: usize,
    /// Capacity, `None` when unbounded.
    pub max_connections: Option<usize>,
}

#[derive(Debug)]
struct Checkout {
    holder: ThreadId,
    since: Instant,
}

struct PoolState {
    available: VecDeque<BoxedConnection>,
    in_use: HashMap<ConnectionId, Checkout>,
    generation: u64,
    pid: u32,
}

impl PoolState {
    fn epoch(&self) -> Epoch {
        Epoch::from_parts(self.pid, self.generation)
    }

    fn total(&self) -> usize {
        self.available.len() + self.in_use.len()
    }

    /// Forgets everything inherited from a parent process.
    fn check_fork(&mut self, pool: u64) {
        let pid = std::process::id();
        if self.pid == pid {
            return;
        }
        warn!(pool, parent_pid = self.pid, pid, "pool used after fork; resetting");
        // Inherited sockets belong to the parent; dropping closes only our copy.
        self.available.clear();
        self.in_use.clear();
        self.generation += 1;
        self.pid = pid;
    }
}

struct PoolInner {
    id: u64,
    spec: ConnectionSpec,
    max_connections: Option<usize>,
    cache: Option<Arc<dyn CacheLayer>>,
    state: Mutex<PoolState>,
}

enum Slot {
    Reused(BoxedConnection),
    Fresh(ConnectionId, Epoch),
}

/// Non-blocking connection pool handle.
///
/// Cloning is cheap; clones share the same connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Starts a builder.
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Creates a pool from a URL.
    pub fn from_url(url: &str) -> Result<Self> {
        PoolBuilder::from_url(url)?.build()
    }

    /// Creates a pool from a URL plus caller overrides.
    pub fn from_url_with(url: &str, overrides: UrlOverrides) -> Result<Self> {
        PoolBuilder::from_url_with(url, overrides)?.build()
    }

    /// Creates a pool from an explicit spec.
    pub fn new(spec: ConnectionSpec, max_connections: Option<usize>) -> Self {
        Self::with_cache(spec, max_connections, None)
    }

    fn with_cache(
        spec: ConnectionSpec,
        max_connections: Option<usize>,
        cache: Option<Arc<dyn CacheLayer>>,
    ) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            pool = id,
            class = spec.class().name(),
            kwargs = %spec.kwargs(),
            max_connections = ?max_connections,
            cache = cache.as_ref().map(|layer| layer.name()),
            "connection pool created"
        );
        let state = PoolState {
            available: VecDeque::new(),
            in_use: HashMap::new(),
            generation: 0,
            pid: std::process::id(),
        };
        ConnectionPool {
            inner: Arc::new(PoolInner {
                id,
                spec,
                max_connections,
                cache,
                state: Mutex::new(state),
            }),
        }
    }

    /// Pool id embedded in every connection id it creates.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Shared connection spec.
    pub fn spec(&self) -> &ConnectionSpec {
        &self.inner.spec
    }

    /// Capacity, `None` when unbounded.
    pub fn max_connections(&self) -> Option<usize> {
        self.inner.max_connections
    }

    /// Checks out a ready connection, creating one if none is idle.
    pub fn get_connection(&self) -> Result<BoxedConnection> {
        let (id, conn) = match self.checkout()? {
            Slot::Reused(conn) => (conn.id(), conn),
            Slot::Fresh(id, epoch) => match self.create(id, epoch) {
                Ok(conn) => (id, conn),
                Err(err) => {
                    self.forget(id);
                    return Err(err);
                }
            },
        };

        match prepare(conn) {
            Ok(conn) => {
                trace!(pool = self.inner.id, id = %id, "connection checked out");
                Ok(conn)
            }
            Err(err) => {
                debug!(pool = self.inner.id, id = %id, error = %err, "connection not usable; dropped");
                self.forget(id);
                Err(err)
            }
        }
    }

    /// Checks out a connection wrapped in a guard that releases on drop.
    pub fn get(&self) -> Result<PooledConnection<ConnectionPool>> {
        let conn = self.get_connection()?;
        Ok(PooledConnection::new(self.clone(), conn))
    }

    /// Returns a connection to the pool.
    ///
    /// A connection created by another pool is handed back as `Some`.
    /// Connections that are closed, or were checked out before a reset, are
    /// dropped instead of reused.
    pub fn release(&self, mut conn: BoxedConnection) -> Option<BoxedConnection> {
        let id = conn.id();
        if id.pool() != self.inner.id {
            warn!(pool = self.inner.id, id = %id, "release of a connection owned by another pool ignored");
            return Some(conn);
        }

        let mut state = self.inner.state.lock();
        state.check_fork(self.inner.id);
        let Some(checkout) = state.in_use.remove(&id) else {
            drop(state);
            debug!(pool = self.inner.id, id = %id, "released connection is no longer tracked; closing");
            conn.disconnect();
            return None;
        };
        if !conn.is_connected() || conn.epoch() != state.epoch() {
            drop(state);
            trace!(pool = self.inner.id, id = %id, "released connection is closed or stale; dropping");
            conn.disconnect();
            return None;
        }
        state.available.push_front(conn);
        drop(state);
        trace!(
            pool = self.inner.id,
            id = %id,
            held_for = ?checkout.since.elapsed(),
            "connection released"
        );
        None
    }

    /// Closes idle connections and forgets checked-out ones.
    ///
    /// Checked-out connections are closed when they come back.
    pub fn disconnect(&self) {
        let (idle, outstanding) = {
            let mut state = self.inner.state.lock();
            state.generation += 1;
            let idle = mem::take(&mut state.available);
            let outstanding = mem::take(&mut state.in_use);
            (idle, outstanding)
        };
        info!(
            pool = self.inner.id,
            idle = idle.len(),
            in_use = outstanding.len(),
            "disconnecting pool"
        );
        for (id, checkout) in &outstanding {
            debug!(
                pool = self.inner.id,
                id = %id,
                holder = ?checkout.holder,
                held_for = ?checkout.since.elapsed(),
                "forgetting checked-out connection"
            );
        }
        for mut conn in idle {
            conn.disconnect();
        }
    }

    /// Same as [`disconnect`](Self::disconnect); the next checkout rebuilds
    /// from the spec.
    pub fn reset(&self) {
        self.disconnect();
    }

    /// Occupancy snapshot.
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        PoolStatus {
            available: state.available.len(),
            in_use: state.in_use.len(),
            max_connections: self.inner.max_connections,
        }
    }

    pub(crate) fn fmt_repr(&self, f: &mut fmt::Formatter<'_>, pool_name: &str) -> fmt::Result {
        write!(
            f,
            "<redpool::{pool_name}(<redpool::{}({})>)>",
            self.inner.spec.class().name(),
            self.inner.spec.kwargs()
        )
    }

    fn checkout(&self) -> Result<Slot> {
        let mut state = self.inner.state.lock();
        state.check_fork(self.inner.id);
        let holder = Checkout {
            holder: thread::current().id(),
            since: Instant::now(),
        };

        if let Some(conn) = state.available.pop_front() {
            state.in_use.insert(conn.id(), holder);
            return Ok(Slot::Reused(conn));
        }
        if let Some(max) = self.inner.max_connections {
            if state.total() >= max {
                return Err(Error::MaxConnections);
            }
        }
        let id = ConnectionId::next(self.inner.id);
        state.in_use.insert(id, holder);
        Ok(Slot::Fresh(id, state.epoch()))
    }

    fn create(&self, id: ConnectionId, epoch: Epoch) -> Result<BoxedConnection> {
        let mut conn = self.inner.spec.create(id, epoch)?;
        if let Some(cache) = &self.inner.cache {
            conn = cache.wrap(conn)?;
        }
        if conn.id() != id {
            return Err(Error::Config(format!(
                "connection factory returned id {} instead of {id}",
                conn.id()
            )));
        }
        debug!(pool = self.inner.id, id = %id, class = conn.class_name(), "connection created");
        Ok(conn)
    }

    fn forget(&self, id: ConnectionId) {
        self.inner.state.lock().in_use.remove(&id);
    }
}

/// Connects the connection and makes sure no stale reply is waiting on it.
fn prepare(mut conn: BoxedConnection) -> Result<BoxedConnection> {
    conn.connect()?;
    let stale = conn.can_read(Duration::ZERO).unwrap_or(true);
    if stale {
        debug!(id = %conn.id(), "connection has unread data or is broken; reconnecting");
        conn.disconnect();
        conn.connect()?;
        if conn.can_read(Duration::ZERO)? {
            conn.disconnect();
            return Err(Error::Connection("Connection not ready".into()));
        }
    }
    Ok(conn)
}

impl ConnectionSource for ConnectionPool {
    fn get_connection(&self) -> Result<BoxedConnection> {
        ConnectionPool::get_connection(self)
    }

    fn release(&self, conn: BoxedConnection) -> Option<BoxedConnection> {
        ConnectionPool::release(self, conn)
    }
}

impl fmt::Display for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_repr(f, "ConnectionPool")
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// RAII wrapper returning a connection to its pool on drop.
pub struct PooledConnection<P: ConnectionSource> {
    pool: P,
    conn: Option<BoxedConnection>,
}

impl<P: ConnectionSource> PooledConnection<P> {
    pub(crate) fn new(pool: P, conn: BoxedConnection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
        }
    }

    /// Takes the connection out; the caller becomes responsible for
    /// releasing it.
    pub fn detach(mut self) -> BoxedConnection {
        self.conn.take().expect("connection present until drop")
    }
}

impl<P: ConnectionSource> Deref for PooledConnection<P> {
    type Target = dyn ManagedConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_deref().expect("connection present until drop")
    }
}

impl<P: ConnectionSource> DerefMut for PooledConnection<P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_deref_mut().expect("connection present until drop")
    }
}

impl<P: ConnectionSource> Drop for PooledConnection<P> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // Our own pool never hands the connection back.
            drop(self.pool.release(conn));
        }
    }
}

/// Fluent configuration shared by both pool kinds.
///
/// Finish with [`build`](Self::build) for a non-blocking pool or
/// [`build_blocking`](Self::build_blocking) for a blocking one.
#[derive(Debug, Clone)]
pub struct PoolBuilder {
    pub(crate) class: ConnectionClass,
    pub(crate) kwargs: ConnectionKwargs,
    pub(crate) max_connections: Option<usize>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cache: Option<Arc<dyn CacheLayer>>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolBuilder {
    /// TCP connections with no kwargs.
    pub fn new() -> Self {
        PoolBuilder {
            class: ConnectionClass::Tcp,
            kwargs: ConnectionKwargs::new(),
            max_connections: None,
            timeout: None,
            cache: None,
        }
    }

    /// Seeds the builder from a URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Self::from_url_with(url, UrlOverrides::default())
    }

    /// Seeds the builder from a URL plus caller overrides.
    pub fn from_url_with(url: &str, overrides: UrlOverrides) -> Result<Self> {
        let parsed = parse_url(url, overrides)?;
        Ok(PoolBuilder {
            class: parsed.connection_class,
            kwargs: parsed.kwargs,
            max_connections: parsed.max_connections,
            timeout: parsed.timeout,
            cache: None,
        })
    }

    #[must_use]
    pub fn connection_class(mut self, class: ConnectionClass) -> Self {
        self.class = class;
        self
    }

    /// Sets any kwarg; keys keep the order they were first set in.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<KwargValue>) -> Self {
        self.kwargs.insert(key, value);
        self
    }

    #[must_use]
    pub fn host(self, host: impl Into<String>) -> Self {
        self.kwarg("host", host.into())
    }

    #[must_use]
    pub fn port(self, port: u16) -> Self {
        self.kwarg("port", port)
    }

    /// Unix socket path; use with `ConnectionClass::Unix`.
    #[must_use]
    pub fn path(self, path: impl Into<String>) -> Self {
        self.kwarg("path", path.into())
    }

    #[must_use]
    pub fn db(self, db: i64) -> Self {
        self.kwarg("db", db)
    }

    #[must_use]
    pub fn username(self, username: impl Into<String>) -> Self {
        self.kwarg("username", username.into())
    }

    #[must_use]
    pub fn password(self, password: impl Into<String>) -> Self {
        self.kwarg("password", password.into())
    }

    #[must_use]
    pub fn client_name(self, name: impl Into<String>) -> Self {
        self.kwarg("client_name", name.into())
    }

    #[must_use]
    pub fn socket_timeout(self, timeout: Duration) -> Self {
        self.kwarg("socket_timeout", timeout.as_secs_f64())
    }

    #[must_use]
    pub fn socket_connect_timeout(self, timeout: Duration) -> Self {
        self.kwarg("socket_connect_timeout", timeout.as_secs_f64())
    }

    #[must_use]
    pub fn health_check_interval(self, interval: Duration) -> Self {
        self.kwarg("health_check_interval", interval.as_secs_f64())
    }

    #[must_use]
    pub fn retry_on_timeout(self, retry: bool) -> Self {
        self.kwarg("retry_on_timeout", retry)
    }

    /// Capacity; unbounded when unset (non-blocking pool only).
    #[must_use]
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Wait bound of the blocking pool.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Hands out cache-layer connections instead of plain ones.
    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn CacheLayer>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Builds a non-blocking pool.
    pub fn build(self) -> Result<ConnectionPool> {
        if self.max_connections == Some(0) {
            return Err(Error::Config("max_connections must be a positive integer".into()));
        }
        let spec = ConnectionSpec::new(self.class, self.kwargs);
        Ok(ConnectionPool::with_cache(spec, self.max_connections, self.cache))
    }
}
