//! # RESP2 Framing
//!
//! Purpose: Frame outgoing commands and parse store replies over a blocking
//! buffered stream.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Replies are parsed top-down with minimal state.
//! 2. **Buffer Reuse**: Callers own the line and write buffers.
//! 3. **Binary-Safe**: Bulk strings are raw bytes; decoding is the codec's job.
//! 4. **Nil Is A Value**: Null bulk strings and null arrays both become `Reply::Nil`.

use std::fmt;
use std::io::{BufRead, Read};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{ClientError, ClientResult};

/// Largest bulk payload accepted, matching the server's `proto-max-bulk-len` default.
pub const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Deepest array nesting accepted in one reply.
pub const MAX_NESTING: usize = 32;

// Array headers are untrusted; grow past this as items actually arrive.
const MAX_PREALLOC_ITEMS: usize = 1024;
const MAX_PREALLOC_BYTES: usize = 64 * 1024;

/// A single reply from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK` style status line.
    Status(String),
    /// `-ERR ...` error line.
    Error(String),
    /// `:123` integer.
    Integer(i64),
    /// `$n` bulk payload.
    Data(Bytes),
    /// `$-1` or `*-1`.
    Nil,
    /// `*n` array.
    Array(Vec<Reply>),
}

impl Reply {
    /// Short type name used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Data(_) => "bulk",
            Reply::Nil => "nil",
            Reply::Array(_) => "array",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(text) => write!(f, "+{}", text),
            Reply::Error(text) => write!(f, "-{}", text),
            Reply::Integer(value) => write!(f, ":{}", value),
            Reply::Data(data) if data.len() <= 32 => {
                write!(f, "\"{}\"", String::from_utf8_lossy(data))
            }
            Reply::Data(data) => write!(f, "<{} bytes>", data.len()),
            Reply::Nil => write!(f, "(nil)"),
            Reply::Array(items) => write!(f, "<array of {}>", items.len()),
        }
    }
}

/// Encodes a command as a RESP2 array of bulk strings into `out`.
pub fn write_command(args: &[Bytes], out: &mut BytesMut) {
    out.put_u8(b'*');
    push_usize(out, args.len());
    out.put_slice(b"\r\n");
    for arg in args {
        out.put_u8(b'$');
        push_usize(out, arg.len());
        out.put_slice(b"\r\n");
        out.put_slice(arg);
        out.put_slice(b"\r\n");
    }
}

/// Reads one reply from the buffered reader.
///
/// Bulk lengths above `MAX_BULK_LEN` and arrays nested deeper than
/// `MAX_NESTING` are rejected as protocol errors.
pub fn read_reply<R: BufRead>(reader: &mut R, line_buf: &mut Vec<u8>) -> ClientResult<Reply> {
    read_nested(reader, line_buf, 0)
}

fn read_nested<R: BufRead>(
    reader: &mut R,
    line_buf: &mut Vec<u8>,
    depth: usize,
) -> ClientResult<Reply> {
    read_line(reader, line_buf)?;
    if line_buf.is_empty() {
        return Err(ClientError::Protocol("empty reply line".into()));
    }

    match line_buf[0] {
        b'+' => Ok(Reply::Status(text(&line_buf[1..]))),
        b'-' => Ok(Reply::Error(text(&line_buf[1..]))),
        b':' => Ok(Reply::Integer(parse_i64(&line_buf[1..])?)),
        b'$' => {
            let len = parse_i64(&line_buf[1..])?;
            read_bulk(reader, len, line_buf)
        }
        b'*' => {
            let len = parse_i64(&line_buf[1..])?;
            read_array(reader, len, line_buf, depth)
        }
        other => Err(ClientError::Protocol(format!(
            "unknown reply prefix {:?}",
            other as char
        ))),
    }
}

fn read_bulk<R: BufRead>(reader: &mut R, len: i64, line_buf: &mut Vec<u8>) -> ClientResult<Reply> {
    if len < 0 {
        return Ok(Reply::Nil);
    }
    if len > MAX_BULK_LEN {
        return Err(ClientError::Protocol(format!(
            "bulk length {} exceeds limit {}",
            len, MAX_BULK_LEN
        )));
    }

    let len = len as usize;
    let mut data = Vec::with_capacity(len.min(MAX_PREALLOC_BYTES));
    (&mut *reader).take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(ClientError::Protocol("connection closed inside bulk string".into()));
    }

    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf)?;
    if crlf != *b"\r\n" {
        return Err(ClientError::Protocol("bulk string missing CRLF".into()));
    }

    line_buf.clear();
    Ok(Reply::Data(Bytes::from(data)))
}

fn read_array<R: BufRead>(
    reader: &mut R,
    len: i64,
    line_buf: &mut Vec<u8>,
    depth: usize,
) -> ClientResult<Reply> {
    if len < 0 {
        return Ok(Reply::Nil);
    }
    if depth >= MAX_NESTING {
        return Err(ClientError::Protocol(format!(
            "reply nested deeper than {} arrays",
            MAX_NESTING
        )));
    }

    let mut items = Vec::with_capacity((len as usize).min(MAX_PREALLOC_ITEMS));
    for _ in 0..len {
        items.push(read_nested(reader, line_buf, depth + 1)?);
    }
    Ok(Reply::Array(items))
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> ClientResult<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(ClientError::Protocol("connection closed by peer".into()));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(ClientError::Protocol("reply line missing CRLF".into()));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn text(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn parse_i64(data: &[u8]) -> ClientResult<i64> {
    let invalid = || ClientError::Protocol(format!("invalid integer {:?}", text(data)));
    let (negative, digits) = match data.split_first() {
        Some((b'-', rest)) => (true, rest),
        Some(_) => (false, data),
        None => return Err(invalid()),
    };
    if digits.is_empty() {
        return Err(invalid());
    }

    // Negative values accumulate downward so i64::MIN is reachable.
    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(invalid());
        }
        let digit = (b - b'0') as i64;
        let next = value.checked_mul(10).and_then(|v| {
            if negative {
                v.checked_sub(digit)
            } else {
                v.checked_add(digit)
            }
        });
        value = next.ok_or_else(invalid)?;
    }
    Ok(value)
}

fn push_usize(out: &mut BytesMut, value: usize) {
    // itoa-style stack buffer; lengths never need a heap allocation.
    let mut buf = [0u8; 20];
    let mut len = 0;
    let mut value = value;
    loop {
        buf[len] = b'0' + (value % 10) as u8;
        value /= 10;
        len += 1;
        if value == 0 {
            break;
        }
    }
    buf[..len].reverse();
    out.put_slice(&buf[..len]);
}
