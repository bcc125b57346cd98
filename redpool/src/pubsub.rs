//! # Publish/Subscribe Session
//!
//! Purpose: Run SUBSCRIBE-family commands over one checked-out connection
//! and keep its health check alive while the session is idle.
//!
//! ## Design Principles
//! 1. **Overlay, Not Owner of Transport**: All I/O goes through the
//!    connection's own `send_command` and `read_response`.
//! 2. **Hand-Over of Health Checks**: Until the server confirms a
//!    subscription the connection checks itself; afterwards the session
//!    sends tagged PINGs from `get_message`.
//! 3. **Tagged Probes**: Probe replies carry a fixed token so they are
//!    swallowed without being mistaken for user PINGs.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::connection::BoxedConnection;
use crate::error::{Error, Result};
use crate::resp::RespValue;

/// Payload of the session's own health-check PINGs.
pub const HEALTH_CHECK_MESSAGE: &[u8] = b"redpool-health-check";

const DRAIN_ATTEMPTS: usize = 10;
const DRAIN_WAIT: Duration = Duration::from_millis(100);

/// Kind of a pub/sub push message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Subscribe,
    Unsubscribe,
    PSubscribe,
    PUnsubscribe,
    Message,
    PMessage,
    Pong,
}

impl MessageKind {
    fn parse(raw: &[u8]) -> Option<Self> {
        let kind = match raw.to_ascii_lowercase().as_slice() {
            b"subscribe" => MessageKind::Subscribe,
            b"unsubscribe" => MessageKind::Unsubscribe,
            b"psubscribe" => MessageKind::PSubscribe,
            b"punsubscribe" => MessageKind::PUnsubscribe,
            b"message" => MessageKind::Message,
            b"pmessage" => MessageKind::PMessage,
            b"pong" => MessageKind::Pong,
            _ => return None,
        };
        Some(kind)
    }

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Subscribe => "subscribe",
            MessageKind::Unsubscribe => "unsubscribe",
            MessageKind::PSubscribe => "psubscribe",
            MessageKind::PUnsubscribe => "punsubscribe",
            MessageKind::Message => "message",
            MessageKind::PMessage => "pmessage",
            MessageKind::Pong => "pong",
        }
    }
}

/// One decoded push message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub kind: MessageKind,
    /// Matching pattern, for `pmessage` and pattern confirmations.
    pub pattern: Option<Vec<u8>>,
    /// Channel; empty for `pong`.
    pub channel: Vec<u8>,
    /// Payload, or the subscription count for confirmations.
    pub data: RespValue,
}

/// Subscribe/publish session over one connection.
pub struct PubSub {
    conn: BoxedConnection,
    channels: HashSet<Vec<u8>>,
    patterns: HashSet<Vec<u8>>,
    confirmed: bool,
    pending_health_checks: usize,
}

impl PubSub {
    /// Starts a session on a checked-out connection.
    pub fn new(conn: BoxedConnection) -> Self {
        PubSub {
            conn,
            channels: HashSet::new(),
            patterns: HashSet::new(),
            confirmed: false,
            pending_health_checks: 0,
        }
    }

    /// True once the server confirmed at least one live subscription.
    pub fn is_subscribed(&self) -> bool {
        self.confirmed
    }

    /// Channels requested and not yet confirmed as unsubscribed.
    pub fn channels(&self) -> impl Iterator<Item = &[u8]> {
        self.channels.iter().map(Vec::as_slice)
    }

    /// Patterns requested and not yet confirmed as unsubscribed.
    pub fn patterns(&self) -> impl Iterator<Item = &[u8]> {
        self.patterns.iter().map(Vec::as_slice)
    }

    /// Underlying connection.
    pub fn connection(&self) -> &BoxedConnection {
        &self.conn
    }

    /// Underlying connection, mutably.
    pub fn connection_mut(&mut self) -> &mut BoxedConnection {
        &mut self.conn
    }

    /// Ends the session and hands the connection back.
    ///
    /// The server side may still consider it subscribed; disconnect it before
    /// returning it to a pool unless every subscription was dropped.
    pub fn into_connection(self) -> BoxedConnection {
        self.conn
    }

    pub fn subscribe(&mut self, channels: &[&[u8]]) -> Result<()> {
        self.command(b"SUBSCRIBE", channels)?;
        self.channels.extend(channels.iter().map(|channel| channel.to_vec()));
        Ok(())
    }

    pub fn psubscribe(&mut self, patterns: &[&[u8]]) -> Result<()> {
        self.command(b"PSUBSCRIBE", patterns)?;
        self.patterns.extend(patterns.iter().map(|pattern| pattern.to_vec()));
        Ok(())
    }

    /// An empty slice unsubscribes from every channel.
    pub fn unsubscribe(&mut self, channels: &[&[u8]]) -> Result<()> {
        self.command(b"UNSUBSCRIBE", channels)
    }

    /// An empty slice unsubscribes from every pattern.
    pub fn punsubscribe(&mut self, patterns: &[&[u8]]) -> Result<()> {
        self.command(b"PUNSUBSCRIBE", patterns)
    }

    /// Sends a user PING; its reply arrives through `get_message`.
    pub fn ping(&mut self, message: Option<&[u8]>) -> Result<()> {
        match message {
            Some(message) => self.command(b"PING", &[message]),
            None => self.command(b"PING", &[]),
        }
    }

    /// Sends a tagged PING when subscribed and the clock is due.
    pub fn check_health(&mut self) -> Result<()> {
        let now = Instant::now();
        if !self.confirmed || !self.conn.health_check().is_due(now) {
            return Ok(());
        }
        trace!(id = %self.conn.id(), "pubsub health check");
        self.conn.send_command(&[b"PING", HEALTH_CHECK_MESSAGE], false)?;
        self.pending_health_checks += 1;
        self.conn.health_check_mut().advance(now);
        Ok(())
    }

    /// Waits up to `timeout` for the next message.
    ///
    /// Returns `None` when nothing arrived or the reply was a swallowed
    /// health-check PONG.
    pub fn get_message(&mut self, timeout: Duration) -> Result<Option<PubSubMessage>> {
        self.check_health()?;
        if !self.conn.can_read(timeout)? {
            return Ok(None);
        }
        let reply = self.conn.read_response()?;
        self.handle_reply(reply)
    }

    fn command(&mut self, name: &[u8], args: &[&[u8]]) -> Result<()> {
        if !self.confirmed {
            self.drain_health_checks()?;
        }
        let mut full: Vec<&[u8]> = Vec::with_capacity(args.len() + 1);
        full.push(name);
        full.extend_from_slice(args);
        self.conn.send_command(&full, !self.confirmed)
    }

    /// Consumes probe replies still in flight from an earlier subscription.
    fn drain_health_checks(&mut self) -> Result<()> {
        let mut attempts = DRAIN_ATTEMPTS;
        while self.pending_health_checks > 0 && attempts > 0 {
            attempts -= 1;
            if !self.conn.can_read(DRAIN_WAIT)? {
                continue;
            }
            let reply = self.conn.read_response()?;
            if !is_health_check_reply(&reply) {
                return Err(Error::Protocol(
                    "a non health-check reply was pending on the pubsub connection".into(),
                ));
            }
            self.pending_health_checks -= 1;
        }
        self.pending_health_checks = 0;
        Ok(())
    }

    fn handle_reply(&mut self, reply: RespValue) -> Result<Option<PubSubMessage>> {
        if is_health_check_reply(&reply) {
            self.pending_health_checks = self.pending_health_checks.saturating_sub(1);
            return Ok(None);
        }

        let items = match reply {
            RespValue::Array(Some(items)) => items,
            RespValue::Simple(ref data) if data.eq_ignore_ascii_case(b"PONG") => {
                return Ok(Some(PubSubMessage {
                    kind: MessageKind::Pong,
                    pattern: None,
                    channel: Vec::new(),
                    data: RespValue::Bulk(None),
                }));
            }
            RespValue::Bulk(Some(data)) => {
                return Ok(Some(PubSubMessage {
                    kind: MessageKind::Pong,
                    pattern: None,
                    channel: Vec::new(),
                    data: RespValue::Bulk(Some(data)),
                }));
            }
            other => {
                return Err(Error::Protocol(format!("unexpected pubsub reply {other:?}")));
            }
        };

        let mut fields = items.into_iter();
        let kind = fields
            .next()
            .as_ref()
            .and_then(RespValue::as_bytes)
            .and_then(MessageKind::parse)
            .ok_or_else(|| Error::Protocol("pubsub reply without a known kind".into()))?;

        let message = match kind {
            MessageKind::PMessage => {
                let pattern = take_bytes(&mut fields);
                let channel = take_bytes(&mut fields).unwrap_or_default();
                let data = fields.next().unwrap_or(RespValue::Bulk(None));
                PubSubMessage { kind, pattern, channel, data }
            }
            MessageKind::PSubscribe | MessageKind::PUnsubscribe => {
                let pattern = take_bytes(&mut fields);
                let data = fields.next().unwrap_or(RespValue::Integer(0));
                PubSubMessage {
                    kind,
                    channel: pattern.clone().unwrap_or_default(),
                    pattern,
                    data,
                }
            }
            MessageKind::Pong => {
                let data = fields.next().unwrap_or(RespValue::Bulk(None));
                PubSubMessage { kind, pattern: None, channel: Vec::new(), data }
            }
            _ => {
                let channel = take_bytes(&mut fields).unwrap_or_default();
                let data = fields.next().unwrap_or(RespValue::Bulk(None));
                PubSubMessage { kind, pattern: None, channel, data }
            }
        };
        self.track(&message);
        Ok(Some(message))
    }

    fn track(&mut self, message: &PubSubMessage) {
        match message.kind {
            MessageKind::Subscribe | MessageKind::PSubscribe => {
                if !self.confirmed {
                    debug!(id = %self.conn.id(), "subscription confirmed; session takes over health checks");
                }
                self.confirmed = true;
            }
            MessageKind::Unsubscribe | MessageKind::PUnsubscribe => {
                if message.kind == MessageKind::Unsubscribe {
                    self.channels.remove(&message.channel);
                } else {
                    self.patterns.remove(&message.channel);
                }
                if message.data == RespValue::Integer(0) {
                    debug!(id = %self.conn.id(), "last subscription dropped");
                    self.confirmed = false;
                    self.conn.health_check_mut().expire();
                }
            }
            _ => {}
        }
    }
}

fn take_bytes(fields: &mut impl Iterator<Item = RespValue>) -> Option<Vec<u8>> {
    fields.next().and_then(|value| value.as_bytes().map(<[u8]>::to_vec))
}

fn is_health_check_reply(reply: &RespValue) -> bool {
    match reply {
        RespValue::Bulk(Some(data)) => data == HEALTH_CHECK_MESSAGE,
        RespValue::Array(Some(items)) => {
            reply.is_pong() && items.get(1).and_then(RespValue::as_bytes) == Some(HEALTH_CHECK_MESSAGE)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{bulk, push, ScriptedConnection};

    const INTERVAL: Duration = Duration::from_secs(60);

    fn assert_interval_advanced(session: &PubSub) {
        let remaining = session
            .connection()
            .health_check()
            .deadline()
            .expect("deadline within range")
            .saturating_duration_since(Instant::now());
        assert!(remaining > INTERVAL - Duration::from_secs(1));
        assert!(remaining <= INTERVAL);
    }

    #[test]
    fn health_check_before_first_subscribe() {
        let (conn, log) = ScriptedConnection::pubsub(INTERVAL);
        let mut session = PubSub::new(Box::new(conn));

        session.subscribe(&[b"foo"]).unwrap();
        assert_eq!(log.commands(), vec![vec!["PING"], vec!["SUBSCRIBE", "foo"]]);

        let message = session.get_message(Duration::ZERO).unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::Subscribe);
        assert_eq!(message.channel, b"foo");
        assert!(session.is_subscribed());
        assert_interval_advanced(&session);
    }

    #[test]
    fn health_check_after_subscribed() {
        let (conn, log) = ScriptedConnection::pubsub(INTERVAL);
        let mut session = PubSub::new(Box::new(conn));
        session.subscribe(&[b"foo"]).unwrap();
        session.get_message(Duration::ZERO).unwrap().unwrap();

        session.connection_mut().health_check_mut().expire();
        log.clear();
        session.subscribe(&[b"bar"]).unwrap();
        // Exactly one command and no probe.
        assert_eq!(log.commands(), vec![vec!["SUBSCRIBE", "bar"]]);
        assert!(session.connection().health_check().is_due(Instant::now()));

        let message = session.get_message(Duration::ZERO).unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::Subscribe);
        assert_eq!(session.get_message(Duration::ZERO).unwrap(), None);
        assert_eq!(
            log.commands(),
            vec![
                vec!["SUBSCRIBE", "bar"],
                vec!["PING", "redpool-health-check"],
            ]
        );
        assert_interval_advanced(&session);
    }

    #[test]
    fn poll_checks_health_only_when_due() {
        let (conn, log) = ScriptedConnection::pubsub(INTERVAL);
        let mut session = PubSub::new(Box::new(conn));
        session.subscribe(&[b"foo"]).unwrap();
        session.get_message(Duration::ZERO).unwrap().unwrap();

        log.clear();
        let deadline = session.connection().health_check().deadline();
        assert_eq!(session.get_message(Duration::ZERO).unwrap(), None);
        assert_eq!(session.connection().health_check().deadline(), deadline);
        assert!(log.commands().is_empty());

        session.connection_mut().health_check_mut().expire();
        assert_eq!(session.get_message(Duration::ZERO).unwrap(), None);
        assert_eq!(log.commands(), vec![vec!["PING", "redpool-health-check"]]);
        assert_interval_advanced(&session);
    }

    #[test]
    fn messages_are_decoded() {
        let (mut conn, _log) = ScriptedConnection::pubsub(Duration::ZERO);
        conn.push_reply(push(&[bulk(b"message"), bulk(b"news"), bulk(b"hello")]));
        conn.push_reply(push(&[bulk(b"pmessage"), bulk(b"n*"), bulk(b"news"), bulk(b"hi")]));
        let mut session = PubSub::new(Box::new(conn));

        let message = session.get_message(Duration::ZERO).unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::Message);
        assert_eq!(message.channel, b"news");
        assert_eq!(message.data, bulk(b"hello"));

        let message = session.get_message(Duration::ZERO).unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::PMessage);
        assert_eq!(message.pattern.as_deref(), Some(&b"n*"[..]));
        assert_eq!(message.channel, b"news");
    }

    #[test]
    fn last_unsubscribe_hands_health_back() {
        let (conn, log) = ScriptedConnection::pubsub(INTERVAL);
        let mut session = PubSub::new(Box::new(conn));
        session.subscribe(&[b"foo"]).unwrap();
        session.get_message(Duration::ZERO).unwrap().unwrap();
        session.unsubscribe(&[]).unwrap();

        let message = session.get_message(Duration::ZERO).unwrap().unwrap();
        assert_eq!(message.kind, MessageKind::Unsubscribe);
        assert!(!session.is_subscribed());
        assert_eq!(session.channels().count(), 0);
        assert!(session.connection().health_check().is_due(Instant::now()));

        log.clear();
        session.subscribe(&[b"again"]).unwrap();
        assert_eq!(log.commands(), vec![vec!["PING"], vec!["SUBSCRIBE", "again"]]);
    }

    #[test]
    fn health_check_replies_are_recognized() {
        assert!(is_health_check_reply(&bulk(HEALTH_CHECK_MESSAGE)));
        assert!(is_health_check_reply(&push(&[bulk(b"pong"), bulk(HEALTH_CHECK_MESSAGE)])));
        assert!(!is_health_check_reply(&push(&[bulk(b"pong"), bulk(b"")])));
        assert!(!is_health_check_reply(&RespValue::Simple(b"PONG".to_vec())));
    }
}
