//! # Connection Factory
//!
//! Purpose: Dial a TCP connection to the store, authenticate, select the
//! configured database, and expose a liveness probe for the pool.
//!
//! ## Design Principles
//! 1. **Factory Pattern**: `Connection::dial` is the only way to build one.
//! 2. **Fail The Dial, Not The Caller Later**: AUTH and SELECT failures
//!    surface as `ClientError::Dial` before the connection is handed out.
//! 3. **Buffer Reuse**: Each connection owns its read and write buffers.
//! 4. **No Retries**: A failed dial is reported once; retry is the caller's call.

use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use bytes::{Bytes, BytesMut};
use tracing::debug;

use crate::config::PoolConfig;
use crate::error::{ClientError, ClientResult};
use crate::resp::{read_reply, write_command, Reply};

/// Single TCP connection with reusable buffers.
pub struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<TcpStream>,
    line_buf: Vec<u8>,
    write_buf: BytesMut,
}

impl Connection {
    /// Opens, authenticates and selects a database according to `config`.
    pub fn dial(config: &PoolConfig) -> ClientResult<Self> {
        let dial_err = |reason: String| ClientError::Dial {
            addr: config.addr.clone(),
            reason,
        };

        let stream = connect_stream(config).map_err(|err| dial_err(err.to_string()))?;
        let mut conn = Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: BytesMut::with_capacity(256),
        };

        if let Some(password) = config.password.as_deref() {
            let args = [Bytes::from_static(b"AUTH"), Bytes::copy_from_slice(password.as_bytes())];
            conn.expect_ok(&args)
                .map_err(|err| dial_err(format!("AUTH rejected: {}", err)))?;
        }

        if config.database != 0 {
            let args = [
                Bytes::from_static(b"SELECT"),
                Bytes::from(config.database.to_string()),
            ];
            conn.expect_ok(&args).map_err(|err| {
                dial_err(format!("SELECT {} rejected: {}", config.database, err))
            })?;
        }

        debug!(addr = %config.addr, database = config.database, "dialed connection");
        Ok(conn)
    }

    /// Sends PING and expects PONG.
    pub fn ping(&mut self) -> ClientResult<()> {
        match self.exec(&[Bytes::from_static(b"PING")])? {
            Reply::Status(text) if text.eq_ignore_ascii_case("PONG") => Ok(()),
            Reply::Error(message) => Err(ClientError::Command {
                command: "PING".into(),
                message,
            }),
            other => Err(ClientError::UnexpectedReply {
                command: "PING".into(),
                reply: other.to_string(),
            }),
        }
    }

    /// Writes one command and reads its reply.
    ///
    /// Error replies are returned as `Reply::Error`; only transport and
    /// framing failures are `Err`.
    pub fn exec(&mut self, args: &[Bytes]) -> ClientResult<Reply> {
        self.write_buf.clear();
        write_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_reply(&mut self.reader, &mut self.line_buf)
    }

    /// Closes both halves of the socket.
    pub(crate) fn close(self) {
        let _ = self.reader.get_ref().shutdown(Shutdown::Both);
    }

    fn expect_ok(&mut self, args: &[Bytes]) -> ClientResult<()> {
        match self.exec(args)? {
            Reply::Status(text) if text == "OK" => Ok(()),
            Reply::Error(message) => Err(ClientError::Command {
                command: String::from_utf8_lossy(&args[0]).into_owned(),
                message,
            }),
            other => Err(ClientError::UnexpectedReply {
                command: String::from_utf8_lossy(&args[0]).into_owned(),
                reply: other.to_string(),
            }),
        }
    }
}

fn connect_stream(config: &PoolConfig) -> ClientResult<TcpStream> {
    let addr = resolve(&config.addr)?;
    let stream = match config.connect_timeout {
        Some(timeout) => TcpStream::connect_timeout(&addr, timeout)?,
        None => TcpStream::connect(addr)?,
    };
    stream.set_read_timeout(config.read_timeout)?;
    stream.set_write_timeout(config.write_timeout)?;
    // Disable Nagle to keep request latency low for small payloads.
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn resolve(addr: &str) -> ClientResult<SocketAddr> {
    addr.to_socket_addrs()?
        .next()
        .ok_or_else(|| ClientError::Config(format!("address {:?} did not resolve", addr)))
}
