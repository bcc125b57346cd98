//! # RESP2 Framing
//!
//! Purpose: Encode commands as RESP2 arrays and read one reply at a time from
//! a buffered transport.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down; the only state is
//!    the caller's line buffer.
//! 2. **Buffer Reuse**: Encoding writes into a caller-owned `BytesMut`.
//! 3. **Binary-Safe**: Bulk strings are raw bytes.
//! 4. **Fail Fast**: Framing violations become `Error::Protocol`, and a closed
//!    stream becomes a connection error, so the connection can be dropped.

use std::io::{BufRead, Read};

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// One RESP2 reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// `+OK`, `+PONG`.
    Simple(Vec<u8>),
    /// `-ERR ...`; classification happens in the connection layer.
    Error(Vec<u8>),
    /// `:123`.
    Integer(i64),
    /// `$n` bulk string, `None` for the null bulk.
    Bulk(Option<Vec<u8>>),
    /// `*n` array, `None` for the null array.
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    /// Payload bytes of a simple or bulk string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::Simple(data) => Some(data),
            RespValue::Bulk(Some(data)) => Some(data),
            _ => None,
        }
    }

    /// True when the reply is `+OK`.
    pub fn is_ok(&self) -> bool {
        matches!(self, RespValue::Simple(data) if data == b"OK")
    }

    /// True for `+PONG`, or the subscribed-mode `["pong", ""]` reply.
    pub fn is_pong(&self) -> bool {
        match self {
            RespValue::Simple(data) => data.eq_ignore_ascii_case(b"PONG"),
            RespValue::Array(Some(items)) => items
                .first()
                .and_then(RespValue::as_bytes)
                .is_some_and(|kind| kind.eq_ignore_ascii_case(b"pong")),
            _ => false,
        }
    }
}

/// Appends one command, encoded as a RESP2 array of bulk strings.
pub fn encode_command(args: &[&[u8]], out: &mut BytesMut) {
    out.reserve(16 + args.iter().map(|arg| arg.len() + 16).sum::<usize>());
    out.put_u8(b'*');
    put_decimal(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        out.put_u8(b'$');
        put_decimal(out, arg.len());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Reads one complete reply.
///
/// Error replies are returned as `RespValue::Error`, not as `Err`.
pub fn read_response<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> Result<RespValue> {
    read_value(reader, line_buf, 0)
}

/// Largest bulk string accepted, matching the server's `proto-max-bulk-len`.
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Upper bound on memory reserved before any element bytes arrive.
const PREALLOC_LIMIT: usize = 64 * 1024;

/// Nested arrays deeper than this are rejected.
const MAX_DEPTH: usize = 128;

fn read_value<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>, depth: usize) -> Result<RespValue> {
    read_line(reader, line_buf)?;
    let Some((&tag, rest)) = line_buf.split_first() else {
        return Err(Error::Protocol("empty reply line".into()));
    };

    match tag {
        b'+' => Ok(RespValue::Simple(rest.to_vec())),
        b'-' => Ok(RespValue::Error(rest.to_vec())),
        b':' => Ok(RespValue::Integer(parse_i64(rest)?)),
        b'$' => {
            let len = parse_i64(rest)?;
            read_bulk(reader, len)
        }
        b'*' => {
            let len = parse_i64(rest)?;
            read_array(reader, len, line_buf, depth)
        }
        other => Err(Error::Protocol(format!(
            "unexpected reply type byte {:?}",
            other as char
        ))),
    }
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64) -> Result<RespValue> {
    if len < 0 {
        return Ok(RespValue::Bulk(None));
    }
    if len > MAX_BULK_LEN {
        return Err(Error::Protocol(format!("bulk length {len} exceeds {MAX_BULK_LEN}")));
    }
    let len = len as usize;
    // Grow with the bytes actually received rather than the announced length.
    let mut data = Vec::with_capacity(len.min(PREALLOC_LIMIT));
    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(Error::Connection("Connection closed by server.".into()));
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != *b"\r\n" {
        return Err(Error::Protocol("bulk string not terminated by CRLF".into()));
    }
    Ok(RespValue::Bulk(Some(data)))
}

fn read_array<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
    depth: usize,
) -> Result<RespValue> {
    if len < 0 {
        return Ok(RespValue::Array(None));
    }
    if depth >= MAX_DEPTH {
        return Err(Error::Protocol(format!("reply nested deeper than {MAX_DEPTH} arrays")));
    }
    let mut items = Vec::with_capacity((len as usize).min(PREALLOC_LIMIT / 16));
    for _ in 0..len {
        items.push(read_value(reader, line_buf, depth + 1)?);
    }
    Ok(RespValue::Array(Some(items)))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> Result<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(Error::Connection("Connection closed by server.".into()));
    }
    if !buf.ends_with(b"\r\n") {
        return Err(Error::Protocol("reply line not terminated by CRLF".into()));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn parse_i64(data: &[u8]) -> Result<i64> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Protocol(format!(
                "invalid integer {:?}",
                String::from_utf8_lossy(data)
            ))
        })
}

fn put_decimal(out: &mut BytesMut, mut value: usize) {
    // Digits go into a stack buffer first to avoid a String allocation.
    let mut buf = [0u8; 20];
    let mut pos = buf.len();
    loop {
        pos -= 1;
        buf[pos] = b'0' + (value % 10) as u8;
        value /= 10;
        if value == 0 {
            break;
        }
    }
    out.put_slice(&buf[pos..]);
}
