//! # Connections
//!
//! Purpose: Own one transport to the server and run the handshake,
//! command framing, reply classification, and health-check protocol on it.
//!
//! ## Design Principles
//! 1. **One Contract, Many Transports**: Pools only see `ManagedConnection`;
//!    TCP, TLS, Unix sockets and caller-supplied types all plug in behind it.
//! 2. **Lazy Transport**: A connection is constructed disconnected and opens
//!    its socket on `connect()` or on the first command.
//! 3. **Close on Doubt**: Transport failures and fatal server errors drop the
//!    socket before the error reaches the caller.
//! 4. **Buffer Reuse**: Each connection keeps its own line and write buffers.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use rustls::{ClientConfig, ClientConnection, StreamOwned};
use tracing::{debug, trace, warn};

use crate::classify::{classify, server_error};
use crate::config::{to_bool, CertReqs, ConnectionKwargs, KwargValue};
use crate::error::{Error, Result};
use crate::health::HealthCheckClock;
use crate::resp::{encode_command, read_response, RespValue};
use crate::tls::{self, TlsOptions};

/// Boxed connection as handed out by the pools.
pub type BoxedConnection = Box<dyn ManagedConnection>;

static NEXT_CONNECTION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of a connection: the owning pool and a process-wide sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pool: u64,
    seq: u64,
}

impl ConnectionId {
    /// Allocates a fresh id owned by `pool`.
    pub fn next(pool: u64) -> Self {
        ConnectionId {
            pool,
            seq: NEXT_CONNECTION_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Id of the pool that created the connection.
    pub fn pool(&self) -> u64 {
        self.pool
    }

    /// Process-wide sequence number.
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool, self.seq)
    }
}

/// Process image and pool generation a connection was created under.
///
/// A pid mismatch means the connection was inherited across `fork()`; a
/// generation mismatch means the pool was reset after checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Epoch {
    pid: u32,
    generation: u64,
}

impl Epoch {
    /// Epoch of the current process at `generation`.
    pub fn current(generation: u64) -> Self {
        Epoch {
            pid: std::process::id(),
            generation,
        }
    }

    /// Builds an epoch from raw parts.
    pub const fn from_parts(pid: u32, generation: u64) -> Self {
        Epoch { pid, generation }
    }

    /// Process id captured at construction.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Pool generation captured at construction.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True when this process created the connection.
    pub fn is_current_process(&self) -> bool {
        self.pid == std::process::id()
    }
}

/// The send/receive contract pools hand out.
///
/// Implementations must be usable from the thread that checked them out;
/// pools never share one connection between callers.
pub trait ManagedConnection: Send {
    /// Identity used for in-use bookkeeping and equality.
    fn id(&self) -> ConnectionId;

    /// Epoch captured at construction.
    fn epoch(&self) -> Epoch;

    /// Type name shown in pool representations (`TcpConnection`, ...).
    fn class_name(&self) -> &str;

    /// Opens the transport and runs the handshake. No-op when connected.
    fn connect(&mut self) -> Result<()>;

    /// Closes the transport. Idempotent.
    fn disconnect(&mut self);

    /// True while a transport is open.
    fn is_connected(&self) -> bool;

    /// Reports whether reply bytes are pending, waiting at most `timeout`.
    fn can_read(&mut self, timeout: Duration) -> Result<bool>;

    /// Writes one command, optionally preceded by a due health check.
    fn send_command(&mut self, args: &[&[u8]], check_health: bool) -> Result<()>;

    /// Reads one reply; error replies are classified into `Err`.
    fn read_response(&mut self) -> Result<RespValue>;

    /// Health-check clock.
    fn health_check(&self) -> &HealthCheckClock;

    /// Mutable health-check clock.
    fn health_check_mut(&mut self) -> &mut HealthCheckClock;

    /// Sends a PING if the clock is due and fails unless PONG comes back.
    fn check_health(&mut self) -> Result<()> {
        if !self.health_check().is_due(Instant::now()) {
            return Ok(());
        }
        probe(self)
    }

    /// Sends one command and reads its reply.
    fn execute(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        self.send_command(args, true)?;
        self.read_response()
    }
}

fn probe<C: ManagedConnection + ?Sized>(conn: &mut C) -> Result<()> {
    trace!(id = %conn.id(), "health check");
    let reply = match conn.send_command(&[b"PING"], false) {
        Ok(()) => conn.read_response(),
        Err(err) => Err(err),
    };
    match reply {
        Ok(reply) if reply.is_pong() => Ok(()),
        Ok(_) => {
            conn.disconnect();
            Err(Error::Connection("Bad response from PING health check".into()))
        }
        Err(err) => {
            conn.disconnect();
            Err(err)
        }
    }
}

/// Creates connections for `ConnectionClass::Custom`.
pub trait ConnectionFactory: Send + Sync + fmt::Debug {
    /// Class name used in representations.
    fn class_name(&self) -> &str;

    /// Builds a new, not yet connected, connection.
    fn create(&self, spec: &ConnectionSpec, id: ConnectionId, epoch: Epoch)
        -> Result<BoxedConnection>;
}

/// Selects which connection type a pool builds.
#[derive(Clone)]
pub enum ConnectionClass {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP.
    Tls,
    /// Unix domain socket.
    Unix,
    /// Caller-supplied connection type.
    Custom(Arc<dyn ConnectionFactory>),
}

impl ConnectionClass {
    /// Type name shown in pool representations.
    pub fn name(&self) -> &str {
        match self {
            ConnectionClass::Tcp => Transport::Tcp.class_name(),
            ConnectionClass::Tls => Transport::Tls.class_name(),
            ConnectionClass::Unix => Transport::Unix.class_name(),
            ConnectionClass::Custom(factory) => factory.class_name(),
        }
    }
}

impl fmt::Debug for ConnectionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionClass::Custom(factory) => f.debug_tuple("Custom").field(factory).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// Immutable description shared by every connection of one pool.
#[derive(Debug, Clone)]
pub struct ConnectionSpec {
    class: ConnectionClass,
    kwargs: ConnectionKwargs,
}

impl ConnectionSpec {
    /// Creates a spec.
    pub fn new(class: ConnectionClass, kwargs: ConnectionKwargs) -> Self {
        ConnectionSpec { class, kwargs }
    }

    /// Connection class.
    pub fn class(&self) -> &ConnectionClass {
        &self.class
    }

    /// Ordered kwargs.
    pub fn kwargs(&self) -> &ConnectionKwargs {
        &self.kwargs
    }

    /// Builds a disconnected connection from this spec.
    pub fn create(&self, id: ConnectionId, epoch: Epoch) -> Result<BoxedConnection> {
        match &self.class {
            ConnectionClass::Tcp => Ok(Box::new(Connection::new(Transport::Tcp, &self.kwargs, id, epoch)?)),
            ConnectionClass::Tls => Ok(Box::new(Connection::new(Transport::Tls, &self.kwargs, id, epoch)?)),
            ConnectionClass::Unix => Ok(Box::new(Connection::new(Transport::Unix, &self.kwargs, id, epoch)?)),
            ConnectionClass::Custom(factory) => factory.create(self, id, epoch),
        }
    }
}

/// Typed view of the kwargs used by the built-in connection types.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    /// Unix socket path.
    pub path: Option<PathBuf>,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_name: Option<String>,
    /// Read and write timeout; `None` blocks forever.
    pub socket_timeout: Option<Duration>,
    /// Defaults to `socket_timeout`.
    pub socket_connect_timeout: Option<Duration>,
    /// Accepted for compatibility; the standard library exposes no setter.
    pub socket_keepalive: bool,
    /// Retry a failed health check once on a fresh transport.
    pub retry_on_timeout: bool,
    /// Zero disables health checks.
    pub health_check_interval: Duration,
    pub tls: TlsOptions,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            host: "localhost".to_string(),
            port: 6379,
            path: None,
            db: 0,
            username: None,
            password: None,
            client_name: None,
            socket_timeout: None,
            socket_connect_timeout: None,
            socket_keepalive: false,
            retry_on_timeout: false,
            health_check_interval: Duration::ZERO,
            tls: TlsOptions::default(),
        }
    }
}

impl ConnectionSettings {
    /// Reads the known keys; unknown keys are ignored.
    pub fn from_kwargs(kwargs: &ConnectionKwargs) -> Result<Self> {
        let defaults = ConnectionSettings::default();
        let port = match kw_int(kwargs, "port")? {
            Some(port) => u16::try_from(port).map_err(|_| Error::invalid_value("port", port.to_string()))?,
            None => defaults.port,
        };
        let socket_timeout = kw_seconds(kwargs, "socket_timeout")?;
        let tls = TlsOptions {
            cert_reqs: match kw_string(kwargs, "ssl_cert_reqs") {
                Some(value) => CertReqs::parse(&value)?,
                None => defaults.tls.cert_reqs,
            },
            check_hostname: kw_bool(kwargs, "ssl_check_hostname").unwrap_or(defaults.tls.check_hostname),
            ca_certs: kw_string(kwargs, "ssl_ca_certs").map(PathBuf::from),
            certfile: kw_string(kwargs, "ssl_certfile").map(PathBuf::from),
            keyfile: kw_string(kwargs, "ssl_keyfile").map(PathBuf::from),
        };

        Ok(ConnectionSettings {
            host: kw_string(kwargs, "host").unwrap_or(defaults.host),
            port,
            path: kw_string(kwargs, "path").map(PathBuf::from),
            db: kw_int(kwargs, "db")?.unwrap_or(defaults.db),
            username: kw_string(kwargs, "username"),
            password: kw_string(kwargs, "password"),
            client_name: kw_string(kwargs, "client_name"),
            socket_timeout,
            socket_connect_timeout: kw_seconds(kwargs, "socket_connect_timeout")?.or(socket_timeout),
            socket_keepalive: kw_bool(kwargs, "socket_keepalive").unwrap_or(false),
            retry_on_timeout: kw_bool(kwargs, "retry_on_timeout").unwrap_or(false),
            health_check_interval: kw_seconds(kwargs, "health_check_interval")?.unwrap_or(Duration::ZERO),
            tls,
        })
    }
}

fn kw_string(kwargs: &ConnectionKwargs, key: &str) -> Option<String> {
    kwargs.get(key).map(ToString::to_string)
}

fn kw_bool(kwargs: &ConnectionKwargs, key: &str) -> Option<bool> {
    kwargs.get(key).and_then(|value| to_bool(value))
}

fn kw_int(kwargs: &ConnectionKwargs, key: &str) -> Result<Option<i64>> {
    match kwargs.get(key) {
        None => Ok(None),
        Some(KwargValue::Int(value)) => Ok(Some(*value)),
        Some(KwargValue::Float(value)) if value.fract() == 0.0 => Ok(Some(*value as i64)),
        Some(KwargValue::Str(value)) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| Error::invalid_value(key, value.as_str())),
        Some(other) => Err(Error::invalid_value(key, other.to_string())),
    }
}

/// Seconds as a duration; zero means "not set".
fn kw_seconds(kwargs: &ConnectionKwargs, key: &str) -> Result<Option<Duration>> {
    let secs = match kwargs.get(key) {
        None => return Ok(None),
        Some(KwargValue::Int(value)) => *value as f64,
        Some(KwargValue::Float(value)) => *value,
        Some(KwargValue::Str(value)) => value
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::invalid_value(key, value.as_str()))?,
        Some(other) => return Err(Error::invalid_value(key, other.to_string())),
    };
    let duration = Duration::try_from_secs_f64(secs)
        .map_err(|_| Error::invalid_value(key, secs.to_string()))?;
    Ok(Some(duration).filter(|duration| !duration.is_zero()))
}

/// Built-in transport kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Tls,
    Unix,
}

impl Transport {
    /// Type name shown in pool representations.
    pub fn class_name(self) -> &'static str {
        match self {
            Transport::Tcp => "TcpConnection",
            Transport::Tls => "TlsConnection",
            Transport::Unix => "UnixConnection",
        }
    }
}

/// Lifecycle of a built-in connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshake,
    Ready,
}

enum Stream {
    Tcp(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_read_timeout(timeout),
            Stream::Tls(stream) => stream.sock.set_read_timeout(timeout),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.set_nonblocking(nonblocking),
            Stream::Tls(stream) => stream.sock.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    fn shutdown(&mut self) {
        match self {
            Stream::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            Stream::Tls(stream) => {
                let tls = &mut **stream;
                tls.conn.send_close_notify();
                let _ = tls.conn.write_tls(&mut tls.sock);
                let _ = tls.sock.shutdown(Shutdown::Both);
            }
            #[cfg(unix)]
            Stream::Unix(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            Stream::Tls(stream) => stream.read(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            Stream::Tls(stream) => stream.write(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            Stream::Tls(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

/// Built-in connection over TCP, TLS or a Unix socket.
pub struct Connection {
    id: ConnectionId,
    epoch: Epoch,
    transport: Transport,
    settings: Arc<ConnectionSettings>,
    tls_config: Option<Arc<ClientConfig>>,
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: Option<BufReader<Stream>>,
    line_buf: Vec<u8>,
    write_buf: BytesMut,
    health: HealthCheckClock,
    state: ConnectionState,
}

impl Connection {
    /// Builds a disconnected connection; TLS material is loaded here.
    pub fn new(
        transport: Transport,
        kwargs: &ConnectionKwargs,
        id: ConnectionId,
        epoch: Epoch,
    ) -> Result<Self> {
        let settings = ConnectionSettings::from_kwargs(kwargs)?;
        let tls_config = match transport {
            Transport::Tls => Some(tls::client_config(&settings.tls)?),
            Transport::Tcp | Transport::Unix => None,
        };
        if transport == Transport::Unix && settings.path.is_none() {
            return Err(Error::Config("unix connection requires a `path`".into()));
        }
        Ok(Connection {
            id,
            epoch,
            transport,
            health: HealthCheckClock::new(settings.health_check_interval),
            settings: Arc::new(settings),
            tls_config,
            reader: None,
            line_buf: Vec::with_capacity(128),
            write_buf: BytesMut::with_capacity(256),
            state: ConnectionState::Disconnected,
        })
    }

    /// Typed settings.
    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Transport kind.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn address(&self) -> String {
        match (&self.transport, &self.settings.path) {
            (Transport::Unix, Some(path)) => path.display().to_string(),
            _ => format!("{}:{}", self.settings.host, self.settings.port),
        }
    }

    fn open_stream(&self) -> Result<Stream> {
        match self.transport {
            Transport::Tcp => Ok(Stream::Tcp(self.connect_tcp()?)),
            Transport::Tls => {
                let Some(config) = self.tls_config.clone() else {
                    return Err(Error::Config("TLS connection without client config".into()));
                };
                let mut sock = self.connect_tcp()?;
                let mut session = ClientConnection::new(config, tls::server_name(&self.settings.host)?)?;
                while session.is_handshaking() {
                    session
                        .complete_io(&mut sock)
                        .map_err(|err| self.connect_error(err))?;
                }
                Ok(Stream::Tls(Box::new(StreamOwned::new(session, sock))))
            }
            Transport::Unix => self.connect_unix(),
        }
    }

    fn connect_tcp(&self) -> Result<TcpStream> {
        let settings = &self.settings;
        let addrs = (settings.host.as_str(), settings.port)
            .to_socket_addrs()
            .map_err(|err| self.connect_error(err))?;

        let mut last_err = None;
        for addr in addrs {
            let attempt = match settings.socket_connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(&addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    // Disable Nagle to keep request latency low for small payloads.
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(settings.socket_timeout)?;
                    stream.set_write_timeout(settings.socket_timeout)?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        let err = last_err
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address resolved"));
        Err(self.connect_error(err))
    }

    #[cfg(unix)]
    fn connect_unix(&self) -> Result<Stream> {
        let Some(path) = &self.settings.path else {
            return Err(Error::Config("unix connection requires a `path`".into()));
        };
        let stream = UnixStream::connect(path).map_err(|err| self.connect_error(err))?;
        stream.set_read_timeout(self.settings.socket_timeout)?;
        stream.set_write_timeout(self.settings.socket_timeout)?;
        Ok(Stream::Unix(stream))
    }

    #[cfg(not(unix))]
    fn connect_unix(&self) -> Result<Stream> {
        Err(Error::Config("unix sockets are not supported on this platform".into()))
    }

    fn connect_error(&self, err: io::Error) -> Error {
        if is_timeout(&err) {
            return Error::Timeout(format!("Timeout connecting to {}", self.address()));
        }
        Error::Connection(format!("Error connecting to {}. {err}.", self.address()))
    }

    fn handshake(&mut self) -> Result<()> {
        let settings = Arc::clone(&self.settings);
        if settings.username.is_some() || settings.password.is_some() {
            let password = settings.password.as_deref().unwrap_or("");
            self.authenticate(settings.username.as_deref(), password)?;
        }
        if settings.db != 0 {
            let db = settings.db.to_string();
            debug!(id = %self.id, db = settings.db, "selecting database");
            if !self.round_trip(&[b"SELECT", db.as_bytes()])?.is_ok() {
                return Err(Error::Connection("Invalid Database".into()));
            }
        }
        if let Some(name) = &settings.client_name {
            debug!(id = %self.id, client_name = %name, "setting client name");
            if !self.round_trip(&[b"CLIENT", b"SETNAME", name.as_bytes()])?.is_ok() {
                return Err(Error::Connection("Error setting client name".into()));
            }
        }
        Ok(())
    }

    fn authenticate(&mut self, username: Option<&str>, password: &str) -> Result<()> {
        debug!(id = %self.id, with_username = username.is_some(), "authenticating");
        let reply = match username {
            Some(user) => match self.round_trip(&[b"AUTH", user.as_bytes(), password.as_bytes()]) {
                Err(Error::Response(message)) if message.contains("wrong number of arguments") => {
                    debug!(id = %self.id, "server rejected AUTH with username; retrying with password only");
                    self.round_trip(&[b"AUTH", password.as_bytes()])?
                }
                other => other?,
            },
            None => self.round_trip(&[b"AUTH", password.as_bytes()])?,
        };
        if !reply.is_ok() {
            return Err(Error::Authentication("Invalid Username or Password".into()));
        }
        Ok(())
    }

    fn round_trip(&mut self, args: &[&[u8]]) -> Result<RespValue> {
        self.send_command(args, false)?;
        self.read_response()
    }
}

impl ManagedConnection for Connection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn class_name(&self) -> &str {
        self.transport.class_name()
    }

    fn connect(&mut self) -> Result<()> {
        if self.reader.is_some() {
            return Ok(());
        }
        self.state = ConnectionState::Connecting;
        let stream = match self.open_stream() {
            Ok(stream) => stream,
            Err(err) => {
                debug!(id = %self.id, addr = %self.address(), error = %err, "connect failed");
                self.state = ConnectionState::Disconnected;
                return Err(err);
            }
        };
        self.reader = Some(BufReader::new(stream));
        self.state = ConnectionState::Handshake;

        if let Err(err) = self.handshake() {
            debug!(id = %self.id, error = %err, "handshake failed");
            self.disconnect();
            return Err(err);
        }
        self.state = ConnectionState::Ready;
        debug!(id = %self.id, class = self.class_name(), addr = %self.address(), "connected");
        Ok(())
    }

    fn disconnect(&mut self) {
        if let Some(reader) = self.reader.take() {
            let mut stream = reader.into_inner();
            // Sockets inherited across fork belong to the parent.
            if self.epoch.is_current_process() {
                stream.shutdown();
            }
            debug!(id = %self.id, "disconnected");
        }
        self.state = ConnectionState::Disconnected;
    }

    fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    fn can_read(&mut self, timeout: Duration) -> Result<bool> {
        let restore = self.settings.socket_timeout;
        let Some(reader) = self.reader.as_mut() else {
            return Ok(false);
        };
        if !reader.buffer().is_empty() {
            return Ok(true);
        }

        // A zero timeout polls without blocking.
        let (filled, restored) = if timeout.is_zero() {
            reader.get_ref().set_nonblocking(true)?;
            let filled = reader.fill_buf().map(|buf| buf.len());
            (filled, reader.get_ref().set_nonblocking(false))
        } else {
            reader.get_ref().set_read_timeout(Some(timeout))?;
            let filled = reader.fill_buf().map(|buf| buf.len());
            (filled, reader.get_ref().set_read_timeout(restore))
        };

        // A socket left in polling mode would turn later reads into timeouts.
        if let Err(err) = restored {
            warn!(id = %self.id, error = %err, "could not restore socket mode");
            self.disconnect();
            return Err(Error::Io(err));
        }

        match filled {
            Ok(0) => {
                self.disconnect();
                Err(Error::Connection("Connection closed by server.".into()))
            }
            Ok(_) => Ok(true),
            Err(err) if is_timeout(&err) => Ok(false),
            Err(err) => {
                self.disconnect();
                Err(Error::Io(err))
            }
        }
    }

    fn send_command(&mut self, args: &[&[u8]], check_health: bool) -> Result<()> {
        if self.reader.is_none() {
            self.connect()?;
        }
        if check_health {
            self.check_health()?;
        }

        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        let written = match self.reader.as_mut() {
            Some(reader) => {
                let stream = reader.get_mut();
                stream.write_all(&self.write_buf).and_then(|()| stream.flush())
            }
            None => return Err(Error::Connection("Connection closed.".into())),
        };
        if let Err(err) = written {
            self.disconnect();
            return Err(transport_error(err, "writing to"));
        }
        trace!(
            id = %self.id,
            command = %String::from_utf8_lossy(args.first().copied().unwrap_or_default()),
            "command sent"
        );
        Ok(())
    }

    fn read_response(&mut self) -> Result<RespValue> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(Error::Connection("Connection closed.".into()));
        };
        let reply = match read_response(reader, &mut self.line_buf) {
            Ok(reply) => reply,
            Err(err) => {
                self.disconnect();
                return Err(match err {
                    Error::Io(err) => transport_error(err, "reading from"),
                    other => other,
                });
            }
        };
        self.health.advance(Instant::now());

        if let RespValue::Error(raw) = &reply {
            let message = String::from_utf8_lossy(raw).into_owned();
            let classified = classify(&message);
            if classified.disconnect {
                warn!(id = %self.id, error = %message, "fatal server error; closing connection");
                self.disconnect();
            }
            return Err(server_error(&message, classified.kind));
        }
        Ok(reply)
    }

    fn health_check(&self) -> &HealthCheckClock {
        &self.health
    }

    fn health_check_mut(&mut self) -> &mut HealthCheckClock {
        &mut self.health
    }

    fn check_health(&mut self) -> Result<()> {
        if !self.health.is_due(Instant::now()) {
            return Ok(());
        }
        match probe(self) {
            Err(err) if self.settings.retry_on_timeout && err.is_connection_error() => {
                debug!(id = %self.id, error = %err, "health check failed; retrying on a new transport");
                probe(self)
            }
            other => other,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("class", &self.class_name())
            .field("addr", &self.address())
            .field("state", &self.state)
            .finish()
    }
}

impl fmt::Debug for dyn ManagedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.class_name())
            .field("id", &self.id())
            .finish()
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn transport_error(err: io::Error, action: &str) -> Error {
    if is_timeout(&err) {
        return Error::Timeout(format!("Timeout {action} socket"));
    }
    Error::Io(err)
}
