#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustls::pki_types::PrivateKeyDer;

/// Reply written back by the mock server.
#[derive(Debug, Clone)]
pub enum Reply {
    Simple(String),
    Error(String),
    Bulk(Vec<u8>),
    Nil,
    Integer(i64),
    Array(Vec<Reply>),
    /// Several replies written back to back.
    Many(Vec<Reply>),
    /// Drops the connection instead of answering.
    Close,
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn error(message: &str) -> Self {
        Reply::Error(message.to_string())
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Reply::Simple(text) => {
                out.push(b'+');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Error(text) => {
                out.push(b'-');
                out.extend_from_slice(text.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Bulk(data) => {
                out.push(b'$');
                out.extend_from_slice(data.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                out.extend_from_slice(data);
                out.extend_from_slice(b"\r\n");
            }
            Reply::Nil => out.extend_from_slice(b"$-1\r\n"),
            Reply::Integer(value) => {
                out.push(b':');
                out.extend_from_slice(value.to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            Reply::Array(items) => {
                out.push(b'*');
                out.extend_from_slice(items.len().to_string().as_bytes());
                out.extend_from_slice(b"\r\n");
                for item in items {
                    item.encode(out);
                }
            }
            Reply::Many(replies) => {
                for reply in replies {
                    reply.encode(out);
                }
            }
            Reply::Close => {}
        }
    }
}

type Handler = Arc<dyn Fn(&[Vec<u8>]) -> Option<Reply> + Send + Sync>;

#[derive(Clone)]
struct Shared {
    handler: Handler,
    log: Arc<Mutex<Vec<(usize, Vec<String>)>>>,
    store: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
    accepted: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Shared {
    fn new(handler: Handler) -> Self {
        Shared {
            handler,
            log: Arc::default(),
            store: Arc::default(),
            accepted: Arc::default(),
            closed: Arc::default(),
        }
    }

    /// Small in-memory server: PING, SET/GET/DEL, and OK for the handshake.
    fn default_reply(&self, args: &[Vec<u8>]) -> Reply {
        let name = args[0].to_ascii_uppercase();
        match name.as_slice() {
            b"PING" => match args.get(1) {
                Some(payload) => Reply::Bulk(payload.clone()),
                None => Reply::Simple("PONG".to_string()),
            },
            b"SET" => {
                self.store.lock().insert(args[1].clone(), args[2].clone());
                Reply::ok()
            }
            b"GET" => match self.store.lock().get(&args[1]) {
                Some(value) => Reply::Bulk(value.clone()),
                None => Reply::Nil,
            },
            b"DEL" => {
                let removed = self.store.lock().remove(&args[1]).is_some();
                Reply::Integer(i64::from(removed))
            }
            b"INFO" => Reply::Bulk(b"# Server\r\nredis_version:7.2.0\r\n".to_vec()),
            _ => Reply::ok(),
        }
    }
}

/// Scripted RESP server on a background thread, one thread per connection.
pub struct MockServer {
    port: u16,
    shared: Shared,
}

impl MockServer {
    pub fn start() -> Self {
        Self::with_handler(|_| None)
    }

    /// `handler` answers first; `None` falls back to the default replies.
    pub fn with_handler(handler: impl Fn(&[Vec<u8>]) -> Option<Reply> + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let shared = Shared::new(Arc::new(handler));

        let accept = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let idx = accept.accepted.fetch_add(1, Ordering::SeqCst);
                let shared = accept.clone();
                thread::spawn(move || serve(idx, stream, shared));
            }
        });

        MockServer { port, shared }
    }

    /// Serves a Unix socket at `path` with the default replies.
    #[cfg(unix)]
    pub fn start_unix(path: &std::path::Path) -> Self {
        let listener = std::os::unix::net::UnixListener::bind(path).expect("bind unix");
        let shared = Shared::new(Arc::new(|_: &[Vec<u8>]| -> Option<Reply> { None }));

        let accept = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let idx = accept.accepted.fetch_add(1, Ordering::SeqCst);
                let shared = accept.clone();
                thread::spawn(move || serve(idx, stream, shared));
            }
        });

        MockServer { port: 0, shared }
    }

    /// Serves TLS on loopback with a fresh self-signed certificate for
    /// `localhost`, with the default replies.
    pub fn start_tls() -> Self {
        let key_pair = rcgen::KeyPair::generate().expect("key pair");
        let cert = rcgen::CertificateParams::new(vec!["localhost".to_string()])
            .expect("params")
            .self_signed(&key_pair)
            .expect("self signed");
        let key = PrivateKeyDer::try_from(key_pair.serialize_der()).expect("key der");
        let config = Arc::new(
            rustls::ServerConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
                .with_safe_default_protocol_versions()
                .expect("protocol versions")
                .with_no_client_auth()
                .with_single_cert(vec![cert.der().clone()], key)
                .expect("server config"),
        );

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let shared = Shared::new(Arc::new(|_: &[Vec<u8>]| -> Option<Reply> { None }));

        let accept = shared.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let Ok(session) = rustls::ServerConnection::new(Arc::clone(&config)) else { break };
                let idx = accept.accepted.fetch_add(1, Ordering::SeqCst);
                let shared = accept.clone();
                thread::spawn(move || serve(idx, rustls::StreamOwned::new(session, stream), shared));
            }
        });

        MockServer { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("redis://127.0.0.1:{}", self.port)
    }

    /// Every command received, in arrival order.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.shared.log.lock().iter().map(|(_, args)| args.clone()).collect()
    }

    /// Command names only.
    pub fn command_names(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .map(|args| args[0].to_ascii_uppercase())
            .collect()
    }

    pub fn clear(&self) {
        self.shared.log.lock().clear();
    }

    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Polls until `count` connections have been closed or `timeout` passes.
    pub fn wait_closed(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.closed() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.closed() >= count
    }
}

fn serve<S: Read + Write>(conn: usize, stream: S, shared: Shared) {
    let mut reader = BufReader::new(stream);
    while let Ok(args) = read_command(&mut reader) {
        let logged = args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        shared.log.lock().push((conn, logged));

        let reply = (shared.handler)(&args).unwrap_or_else(|| shared.default_reply(&args));
        if matches!(reply, Reply::Close) {
            break;
        }
        let mut out = Vec::new();
        reply.encode(&mut out);
        let writer = reader.get_mut();
        if writer.write_all(&out).and_then(|()| writer.flush()).is_err() {
            break;
        }
    }
    shared.closed.fetch_add(1, Ordering::SeqCst);
}

fn read_command<R: Read>(reader: &mut BufReader<R>) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?;
    if line.first() != Some(&b'*') {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?;
        if line.first() != Some(&b'$') {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != [b'\r', b'\n'] {
            return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line<R: Read>(reader: &mut BufReader<R>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "digit"))
}

/// Routes `tracing` output through the test harness; set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
