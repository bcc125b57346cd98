mod common;

use std::time::Duration;

use common::{init_tracing, MockServer, Reply};
use redpool::{Client, ErrorKind, MessageKind, RespValue, Ttl};

fn client_for(server: &MockServer) -> Client {
    init_tracing();
    Client::from_url(&server.url()).expect("client")
}

#[test]
fn client_set_get_roundtrip() {
    let server = MockServer::start();
    let client = client_for(&server);

    client.set(b"key", b"value").expect("set");
    assert_eq!(client.get(b"key").expect("get"), Some(b"value".to_vec()));
    assert_eq!(client.get(b"missing").expect("get"), None);

    assert_eq!(server.command_names(), ["SET", "GET", "GET"]);
    // Every call reused the one pooled connection.
    assert_eq!(server.accepted(), 1);
    assert_eq!(client.pool().status().available, 1);
}

#[test]
fn client_ttl_and_delete() {
    let server = MockServer::with_handler(|args| match args[0].as_slice() {
        b"TTL" => Some(Reply::Integer(5)),
        _ => None,
    });
    let client = client_for(&server);

    let ttl = client.ttl(b"key").expect("ttl");
    assert_eq!(ttl, Ttl::ExpiresIn(Duration::from_secs(5)));
    client.set(b"key", b"value").expect("set");
    assert!(client.delete(b"key").expect("delete"));
    assert!(!client.delete(b"key").expect("delete"));
}

#[test]
fn client_set_with_ttl_sends_expiry() {
    let server = MockServer::start();
    let client = client_for(&server);

    client
        .set_with_ttl(b"key", b"value", Duration::from_secs(30))
        .expect("set");
    assert_eq!(server.commands()[0], ["SET", "key", "value", "EX", "30"]);
}

#[test]
fn client_ping_and_info() {
    let server = MockServer::start();
    let client = client_for(&server);

    assert_eq!(client.ping(None).expect("ping"), b"PONG");
    assert_eq!(client.ping(Some(b"hello")).expect("ping"), b"hello");
    let info = client.info().expect("info");
    assert!(String::from_utf8_lossy(&info).contains("redis_version"));
}

#[test]
fn client_rejects_unexpected_reply_type() {
    let server = MockServer::with_handler(|args| match args[0].as_slice() {
        b"GET" => Some(Reply::Integer(1)),
        _ => None,
    });
    let client = client_for(&server);

    let err = client.get(b"key").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
}

#[test]
fn client_execute_returns_raw_reply() {
    let server = MockServer::with_handler(|args| match args[0].as_slice() {
        b"LRANGE" => Some(Reply::Array(vec![Reply::Bulk(b"a".to_vec()), Reply::Nil])),
        _ => None,
    });
    let client = client_for(&server);

    let reply = client.execute(&[b"LRANGE", b"list", b"0", b"-1"]).expect("execute");
    assert_eq!(
        reply,
        RespValue::Array(Some(vec![RespValue::Bulk(Some(b"a".to_vec())), RespValue::Bulk(None)]))
    );
}

#[test]
fn client_over_blocking_pool() {
    let server = MockServer::start();
    init_tracing();
    let url = format!("{}?max_connections=2&timeout=1", server.url());
    let client = Client::from_url_blocking(&url).expect("client");

    client.set(b"key", b"value").expect("set");
    assert_eq!(client.get(b"key").expect("get"), Some(b"value".to_vec()));
    assert_eq!(client.pool().max_connections(), 2);
    assert_eq!(client.pool().timeout(), Duration::from_secs(1));
    assert_eq!(client.pool().free_permits(), 2);
}

#[test]
fn releasing_a_subscribed_session_closes_its_connection() {
    let server = MockServer::with_handler(|args| match args[0].as_slice() {
        b"SUBSCRIBE" => Some(Reply::Array(vec![
            Reply::Bulk(b"subscribe".to_vec()),
            Reply::Bulk(args[1].clone()),
            Reply::Integer(1),
        ])),
        _ => None,
    });
    let client = client_for(&server);

    let mut session = client.pubsub().expect("pubsub");
    session.subscribe(&[b"news"]).expect("subscribe");
    let message = session
        .get_message(Duration::from_secs(1))
        .expect("read")
        .expect("confirmation");
    assert_eq!(message.kind, MessageKind::Subscribe);
    assert_eq!(message.channel, b"news");
    assert!(session.is_subscribed());

    client.release_pubsub(session);
    assert!(server.wait_closed(1, Duration::from_secs(2)));
    assert_eq!(client.pool().status().available, 0);
    assert_eq!(client.pool().status().in_use, 0);
}

#[test]
fn releasing_an_idle_session_keeps_its_connection() {
    let server = MockServer::start();
    let client = client_for(&server);

    let session = client.pubsub().expect("pubsub");
    client.release_pubsub(session);
    assert_eq!(client.pool().status().available, 1);
    assert_eq!(server.closed(), 0);
}
