//! # URL Configuration Parser
//!
//! Purpose: Turn a `redis://`, `rediss://` or `unix://` URL into the ordered
//! connection kwargs, the connection class, and the pool-level options.
//!
//! ## Design Principles
//! 1. **Open Kwargs, Typed Subset**: Unknown query keys pass through as
//!    strings; a fixed table coerces the known ones.
//! 2. **Stable Order**: Kwargs keep insertion order, which the pool's textual
//!    representation relies on.
//! 3. **Fail Fast**: Scheme and conversion errors surface at parse time.
//!
//! ## Precedence
//! `db` resolves as: `?db=` > numeric path segment > caller override.

use std::fmt;
use std::time::Duration;

use percent_encoding::percent_decode_str;

use crate::connection::ConnectionClass;
use crate::error::{Error, Result};

const SCHEME_ERROR: &str =
    "Redis URL must specify one of the following schemes (redis://, rediss://, unix://)";

/// A single kwarg value.
#[derive(Debug, Clone, PartialEq)]
pub enum KwargValue {
    /// Free-form string.
    Str(String),
    /// Integer option (`db`, `port`, `health_check_interval`).
    Int(i64),
    /// Float option (timeouts in seconds).
    Float(f64),
    /// Boolean option.
    Bool(bool),
}

impl fmt::Display for KwargValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KwargValue::Str(value) => f.write_str(value),
            KwargValue::Int(value) => write!(f, "{value}"),
            KwargValue::Float(value) if value.fract() == 0.0 && value.is_finite() => {
                write!(f, "{value:.1}")
            }
            KwargValue::Float(value) => write!(f, "{value}"),
            KwargValue::Bool(true) => f.write_str("True"),
            KwargValue::Bool(false) => f.write_str("False"),
        }
    }
}

impl From<&str> for KwargValue {
    fn from(value: &str) -> Self {
        KwargValue::Str(value.to_string())
    }
}

impl From<String> for KwargValue {
    fn from(value: String) -> Self {
        KwargValue::Str(value)
    }
}

impl From<i64> for KwargValue {
    fn from(value: i64) -> Self {
        KwargValue::Int(value)
    }
}

impl From<u16> for KwargValue {
    fn from(value: u16) -> Self {
        KwargValue::Int(i64::from(value))
    }
}

impl From<f64> for KwargValue {
    fn from(value: f64) -> Self {
        KwargValue::Float(value)
    }
}

impl From<bool> for KwargValue {
    fn from(value: bool) -> Self {
        KwargValue::Bool(value)
    }
}

/// Insertion-ordered connection keyword arguments.
///
/// Re-inserting an existing key replaces the value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionKwargs {
    entries: Vec<(String, KwargValue)>,
}

impl ConnectionKwargs {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<KwargValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| *existing == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Looks up `key`.
    pub fn get(&self, key: &str) -> Option<&KwargValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    /// Removes and returns `key`.
    pub fn remove(&mut self, key: &str) -> Option<KwargValue> {
        let idx = self.entries.iter().position(|(existing, _)| existing == key)?;
        Some(self.entries.remove(idx).1)
    }

    /// True if `key` is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &KwargValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Merges `other` into `self`; later values win, new keys are appended.
    pub fn extend(&mut self, other: ConnectionKwargs) {
        for (key, value) in other.entries {
            self.insert(key, value);
        }
    }
}

impl fmt::Display for ConnectionKwargs {
    /// Renders `key=value` pairs joined by commas, in insertion order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, (key, value)) in self.entries.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        Ok(())
    }
}

impl<K: Into<String>, V: Into<KwargValue>> FromIterator<(K, V)> for ConnectionKwargs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut kwargs = ConnectionKwargs::new();
        for (key, value) in iter {
            kwargs.insert(key, value);
        }
        kwargs
    }
}

/// Caller-supplied values that sit underneath (or, for the class, on top of)
/// what the URL says.
#[derive(Debug, Clone, Default)]
pub struct UrlOverrides {
    /// Database used when the URL names none.
    pub db: Option<i64>,
    /// Connection class that replaces the scheme default.
    pub connection_class: Option<ConnectionClass>,
    /// Extra kwargs; URL values replace them on conflict.
    pub kwargs: ConnectionKwargs,
}

impl UrlOverrides {
    /// Sets the fallback database.
    #[must_use]
    pub fn db(mut self, db: i64) -> Self {
        self.db = Some(db);
        self
    }

    /// Forces the connection class.
    #[must_use]
    pub fn connection_class(mut self, class: ConnectionClass) -> Self {
        self.connection_class = Some(class);
        self
    }

    /// Adds an extra kwarg.
    #[must_use]
    pub fn kwarg(mut self, key: impl Into<String>, value: impl Into<KwargValue>) -> Self {
        self.kwargs.insert(key, value);
        self
    }
}

/// Output of [`parse_url`].
#[derive(Debug, Clone)]
pub struct ParsedUrl {
    /// Connection class selected by scheme or override.
    pub connection_class: ConnectionClass,
    /// Ordered connection kwargs.
    pub kwargs: ConnectionKwargs,
    /// Pool capacity from `?max_connections=`.
    pub max_connections: Option<usize>,
    /// Blocking-pool wait from `?timeout=`.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Copy)]
enum QueryType {
    Int,
    Float,
    Bool,
    CertReqs,
}

/// Typed query keys; everything else is passed through as a string.
const QUERY_TYPES: &[(&str, QueryType)] = &[
    ("db", QueryType::Int),
    ("health_check_interval", QueryType::Int),
    ("max_connections", QueryType::Int),
    ("protocol", QueryType::Int),
    ("readonly", QueryType::Bool),
    ("retry_on_timeout", QueryType::Bool),
    ("socket_connect_timeout", QueryType::Float),
    ("socket_keepalive", QueryType::Bool),
    ("socket_timeout", QueryType::Float),
    ("ssl_cert_reqs", QueryType::CertReqs),
    ("ssl_check_hostname", QueryType::Bool),
    ("timeout", QueryType::Float),
];

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scheme {
    Redis,
    Rediss,
    Unix,
}

/// Parses a connection URL.
///
/// `redis://[user[:pass]@]host[:port][/db][?query]`,
/// `rediss://...` for TLS, `unix://[user[:pass]@]/path[?query]`.
pub fn parse_url(url: &str, overrides: UrlOverrides) -> Result<ParsedUrl> {
    let (scheme, rest) = if let Some(rest) = url.strip_prefix("redis://") {
        (Scheme::Redis, rest)
    } else if let Some(rest) = url.strip_prefix("rediss://") {
        (Scheme::Rediss, rest)
    } else if let Some(rest) = url.strip_prefix("unix://") {
        (Scheme::Unix, rest)
    } else {
        return Err(Error::Config(SCHEME_ERROR.to_string()));
    };

    let rest = rest.split_once('#').map_or(rest, |(head, _)| head);
    let (rest, query) = match rest.split_once('?') {
        Some((head, query)) => (head, Some(query)),
        None => (rest, None),
    };
    let (netloc, path) = match rest.find('/') {
        Some(idx) => rest.split_at(idx),
        None => (rest, ""),
    };

    let mut kwargs = overrides.kwargs;
    if let Some(db) = overrides.db {
        kwargs.insert("db", db);
    }
    let mut max_connections = None;
    let mut timeout = None;

    if let Some(query) = query {
        for (key, value) in ::url::form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                continue;
            }
            let typed = coerce_query_value(&key, &value)?;
            match key.as_ref() {
                "max_connections" => {
                    max_connections = Some(positive_usize(&key, &value, &typed)?);
                }
                "timeout" => {
                    timeout = Some(seconds(&key, &value, &typed)?);
                }
                _ => kwargs.insert(key.into_owned(), typed),
            }
        }
    }

    let (userinfo, hostinfo) = match netloc.rfind('@') {
        Some(idx) => (Some(&netloc[..idx]), &netloc[idx + 1..]),
        None => (None, netloc),
    };
    let (username, password) = match userinfo {
        Some(info) => match info.split_once(':') {
            Some((user, pass)) => (decode(user)?, decode(pass)?),
            None => (decode(info)?, String::new()),
        },
        None => (String::new(), String::new()),
    };

    if scheme == Scheme::Unix {
        let path = decode(path)?;
        if path.is_empty() {
            return Err(Error::Config("unix:// URL must include a socket path".into()));
        }
        kwargs.insert("path", path);
        insert_credentials(&mut kwargs, username, password);
    } else {
        let (host, port) = split_host_port(hostinfo);
        if let Some(host) = host {
            kwargs.insert("host", decode(&host.to_lowercase())?);
        }
        if let Some(port) = port {
            let port: u16 = port
                .parse()
                .map_err(|_| Error::invalid_value("port", port))?;
            kwargs.insert("port", port);
        }
        insert_credentials(&mut kwargs, username, password);

        if !path.is_empty() && !query_has_db(query) {
            if let Ok(db) = decode(path)?.replace('/', "").parse::<i64>() {
                kwargs.insert("db", db);
            }
        }
    }

    let connection_class = match overrides.connection_class {
        Some(class) => class,
        None => match scheme {
            Scheme::Redis => ConnectionClass::Tcp,
            Scheme::Rediss => ConnectionClass::Tls,
            Scheme::Unix => ConnectionClass::Unix,
        },
    };

    tracing::debug!(
        class = connection_class.name(),
        kwargs = %kwargs,
        "parsed connection url"
    );

    Ok(ParsedUrl {
        connection_class,
        kwargs,
        max_connections,
        timeout,
    })
}

fn query_has_db(query: Option<&str>) -> bool {
    query.is_some_and(|query| {
        ::url::form_urlencoded::parse(query.as_bytes()).any(|(key, value)| key == "db" && !value.is_empty())
    })
}

fn insert_credentials(kwargs: &mut ConnectionKwargs, username: String, password: String) {
    if !username.is_empty() {
        kwargs.insert("username", username);
    }
    if !password.is_empty() {
        kwargs.insert("password", password);
    }
}

fn split_host_port(hostinfo: &str) -> (Option<&str>, Option<&str>) {
    let (host, port) = if let Some(bracketed) = hostinfo.strip_prefix('[') {
        match bracketed.split_once(']') {
            Some((host, tail)) => (host, tail.strip_prefix(':').unwrap_or("")),
            None => (bracketed, ""),
        }
    } else {
        match hostinfo.split_once(':') {
            Some((host, port)) => (host, port),
            None => (hostinfo, ""),
        }
    };
    let host = (!host.is_empty()).then_some(host);
    let port = (!port.is_empty()).then_some(port);
    (host, port)
}

fn decode(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::Config(format!("URL component {raw:?} is not valid UTF-8")))
}

fn coerce_query_value(key: &str, value: &str) -> Result<KwargValue> {
    let kind = QUERY_TYPES
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, kind)| *kind);

    match kind {
        Some(QueryType::Int) => value
            .trim()
            .parse::<i64>()
            .map(KwargValue::Int)
            .map_err(|_| Error::invalid_value(key, value)),
        Some(QueryType::Float) => value
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|secs| secs.is_finite())
            .map(KwargValue::Float)
            .ok_or_else(|| Error::invalid_value(key, value)),
        Some(QueryType::Bool) => Ok(KwargValue::Bool(to_bool(value).unwrap_or(true))),
        Some(QueryType::CertReqs) => {
            CertReqs::parse(value)?;
            Ok(KwargValue::Str(value.to_ascii_lowercase()))
        }
        None => Ok(KwargValue::Str(value.to_string())),
    }
}

fn positive_usize(key: &str, raw: &str, value: &KwargValue) -> Result<usize> {
    match value {
        KwargValue::Int(n) if *n > 0 => Ok(*n as usize),
        _ => Err(Error::invalid_value(key, raw)),
    }
}

fn seconds(key: &str, raw: &str, value: &KwargValue) -> Result<Duration> {
    match value {
        KwargValue::Float(secs) if *secs >= 0.0 => {
            Duration::try_from_secs_f64(*secs).map_err(|_| Error::invalid_value(key, raw))
        }
        _ => Err(Error::invalid_value(key, raw)),
    }
}

/// Certificate verification level for `rediss://` connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CertReqs {
    /// Accept any server certificate.
    None,
    /// Verify the chain when one is presented.
    Optional,
    /// Verify the chain.
    #[default]
    Required,
}

impl CertReqs {
    /// Parses `none`, `optional` or `required` (case-insensitive).
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Ok(CertReqs::None),
            "optional" => Ok(CertReqs::Optional),
            "required" => Ok(CertReqs::Required),
            _ => Err(Error::invalid_value("ssl_cert_reqs", value)),
        }
    }
}

/// Values that can be read as an optional boolean flag.
pub trait AsBoolFlag {
    /// `None` means "unspecified", not `false`.
    fn as_bool_flag(&self) -> Option<bool>;
}

impl AsBoolFlag for str {
    fn as_bool_flag(&self) -> Option<bool> {
        if self.is_empty() {
            return None;
        }
        let falsy = ["0", "f", "false", "n", "no"];
        Some(!falsy.iter().any(|word| self.eq_ignore_ascii_case(word)))
    }
}

impl AsBoolFlag for String {
    fn as_bool_flag(&self) -> Option<bool> {
        self.as_str().as_bool_flag()
    }
}

impl AsBoolFlag for bool {
    fn as_bool_flag(&self) -> Option<bool> {
        Some(*self)
    }
}

macro_rules! int_bool_flag {
    ($($ty:ty),*) => {
        $(impl AsBoolFlag for $ty {
            fn as_bool_flag(&self) -> Option<bool> {
                Some(*self != 0)
            }
        })*
    };
}

int_bool_flag!(i32, i64, u32, u64, usize);

impl AsBoolFlag for KwargValue {
    fn as_bool_flag(&self) -> Option<bool> {
        match self {
            KwargValue::Str(value) => value.as_bool_flag(),
            KwargValue::Int(value) => value.as_bool_flag(),
            KwargValue::Float(value) => Some(*value != 0.0),
            KwargValue::Bool(value) => Some(*value),
        }
    }
}

impl<T: AsBoolFlag> AsBoolFlag for Option<T> {
    fn as_bool_flag(&self) -> Option<bool> {
        self.as_ref().and_then(AsBoolFlag::as_bool_flag)
    }
}

impl<T: AsBoolFlag + ?Sized> AsBoolFlag for &T {
    fn as_bool_flag(&self) -> Option<bool> {
        (**self).as_bool_flag()
    }
}

/// Reads a boolean option the way URL query strings spell them.
///
/// `None` and `""` are unspecified; `0`, `f`, `false`, `n`, `no` (any case)
/// are false; every other value is true.
pub fn to_bool<T: AsBoolFlag + ?Sized>(value: &T) -> Option<bool> {
    value.as_bool_flag()
}
