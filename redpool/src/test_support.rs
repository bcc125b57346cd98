//! In-memory connection used by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::connection::{
    BoxedConnection, ConnectionClass, ConnectionFactory, ConnectionId, ConnectionSpec, Epoch,
    ManagedConnection,
};
use crate::error::{Error, Result};
use crate::health::HealthCheckClock;
use crate::pool::PoolBuilder;
use crate::resp::RespValue;

/// Connection that never touches the network.
pub(crate) struct DummyConnection {
    id: ConnectionId,
    epoch: Epoch,
    connected: bool,
    health: HealthCheckClock,
}

impl ManagedConnection for DummyConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn epoch(&self) -> Epoch {
        self.epoch
    }

    fn class_name(&self) -> &str {
        "DummyConnection"
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn can_read(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(false)
    }

    fn send_command(&mut self, _args: &[&[u8]], _check_health: bool) -> Result<()> {
        Ok(())
    }

    fn read_response(&mut self) -> Result<RespValue> {
        Ok(RespValue::Simple(b"OK".to_vec()))
    }

    fn health_check(&self) -> &HealthCheckClock {
        &self.health
    }

    fn health_check_mut(&mut self) -> &mut HealthCheckClock {
        &mut self.health
    }
}

#[derive(Debug)]
pub(crate) struct DummyFactory;

impl ConnectionFactory for DummyFactory {
    fn class_name(&self) -> &str {
        "DummyConnection"
    }

    fn create(&self, _spec: &ConnectionSpec, id: ConnectionId, epoch: Epoch) -> Result<BoxedConnection> {
        Ok(Box::new(DummyConnection {
            id,
            epoch,
            connected: false,
            health: HealthCheckClock::new(Duration::ZERO),
        }))
    }
}

/// Builder preset to dummy connections.
pub(crate) fn dummy_builder() -> PoolBuilder {
    PoolBuilder::new().connection_class(ConnectionClass::Custom(Arc::new(DummyFactory)))
}

/// Bulk string reply.
pub(crate) fn bulk(data: &[u8]) -> RespValue {
    RespValue::Bulk(Some(data.to_vec()))
}

/// Array reply.
pub(crate) fn push(items: &[RespValue]) -> RespValue {
    RespValue::Array(Some(items.to_vec()))
}

/// Commands written to a [`ScriptedConnection`], shared with the test.
#[derive(Clone, Default)]
pub(crate) struct CommandLog(Arc<Mutex<Vec<Vec<String>>>>);

impl CommandLog {
    pub(crate) fn commands(&self) -> Vec<Vec<String>> {
        self.0.lock().clone()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().clear();
    }

    fn record(&self, args: &[&[u8]]) {
        let args = args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        self.0.lock().push(args);
    }
}

/// In-memory connection that answers PING and the SUBSCRIBE family the way
/// a server would.
pub(crate) struct ScriptedConnection {
    id: ConnectionId,
    health: HealthCheckClock,
    replies: VecDeque<RespValue>,
    subscriptions: Vec<Vec<u8>>,
    log: CommandLog,
}

impl ScriptedConnection {
    pub(crate) fn pubsub(interval: Duration) -> (Self, CommandLog) {
        let log = CommandLog::default();
        let conn = ScriptedConnection {
            id: ConnectionId::next(0),
            health: HealthCheckClock::new(interval),
            replies: VecDeque::new(),
            subscriptions: Vec::new(),
            log: log.clone(),
        };
        (conn, log)
    }

    pub(crate) fn push_reply(&mut self, reply: RespValue) {
        self.replies.push_back(reply);
    }

    fn respond(&mut self, args: &[&[u8]]) {
        let name = args.first().map(|name| name.to_ascii_uppercase()).unwrap_or_default();
        match name.as_slice() {
            b"PING" => {
                let payload = args.get(1).copied();
                let reply = match (self.subscriptions.is_empty(), payload) {
                    (true, None) => RespValue::Simple(b"PONG".to_vec()),
                    (true, Some(payload)) => bulk(payload),
                    (false, payload) => push(&[bulk(b"pong"), bulk(payload.unwrap_or_default())]),
                };
                self.replies.push_back(reply);
            }
            b"SUBSCRIBE" => {
                for channel in &args[1..] {
                    self.subscriptions.push(channel.to_vec());
                    let count = self.subscriptions.len() as i64;
                    self.replies
                        .push_back(push(&[bulk(b"subscribe"), bulk(channel), RespValue::Integer(count)]));
                }
            }
            b"UNSUBSCRIBE" => {
                let channels: Vec<Vec<u8>> = if args.len() > 1 {
                    args[1..].iter().map(|channel| channel.to_vec()).collect()
                } else {
                    self.subscriptions.clone()
                };
                for channel in channels {
                    self.subscriptions.retain(|existing| *existing != channel);
                    let count = self.subscriptions.len() as i64;
                    self.replies
                        .push_back(push(&[bulk(b"unsubscribe"), bulk(&channel), RespValue::Integer(count)]));
                }
            }
            _ => self.replies.push_back(RespValue::Simple(b"OK".to_vec())),
        }
    }
}

impl ManagedConnection for ScriptedConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn epoch(&self) -> Epoch {
        Epoch::current(0)
    }

    fn class_name(&self) -> &str {
        "ScriptedConnection"
    }

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn disconnect(&mut self) {
        self.replies.clear();
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn can_read(&mut self, _timeout: Duration) -> Result<bool> {
        Ok(!self.replies.is_empty())
    }

    fn send_command(&mut self, args: &[&[u8]], check_health: bool) -> Result<()> {
        if check_health {
            self.check_health()?;
        }
        self.log.record(args);
        self.respond(args);
        Ok(())
    }

    fn read_response(&mut self) -> Result<RespValue> {
        let reply = self
            .replies
            .pop_front()
            .ok_or_else(|| Error::Connection("no scripted reply".into()))?;
        self.health.advance(Instant::now());
        Ok(reply)
    }

    fn health_check(&self) -> &HealthCheckClock {
        &self.health
    }

    fn health_check_mut(&mut self) -> &mut HealthCheckClock {
        &mut self.health
    }
}
