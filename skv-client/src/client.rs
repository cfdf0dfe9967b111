//! # Typed Store Client
//!
//! Purpose: Expose typed, blocking operations (strings, counters, hashes,
//! sets, queues) over the pooled connection layer.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `StoreClient` hides pooling, framing and encoding.
//! 2. **Validate Before Borrowing**: Blank keys and unencodable values fail
//!    before a connection is touched.
//! 3. **Guarded Release**: Connections return to the pool when the
//!    `PooledConnection` guard drops, on success and error paths alike.
//! 4. **Absence Is Typed**: Nil replies become `ClientError::NotFound`.
//!
//! ## Struct Storage
//!
//! - `set`/`get` with `Json<T>` or `Binary<T>`: one string value per key.
//! - `set_object`/`get_object`: one hash field per struct field. Writes
//!   replace the whole hash in one MULTI/EXEC.
//!
//! The two layouts are not interchangeable; pick one per key space.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::alert::{AlertHook, LogAlertHook};
use crate::codec::{flatten_fields, unflatten_fields, FromWire, ToWire};
use crate::config::PoolConfig;
use crate::error::{ClientError, ClientResult};
use crate::executor::Executor;
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};
use crate::resp::Reply;

/// TTL state returned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Blocking client with connection pooling. Clones share the pool.
#[derive(Clone)]
pub struct StoreClient {
    pool: ConnectionPool,
    executor: Executor,
}

impl StoreClient {
    /// Creates a client with default pool settings.
    pub fn connect(addr: impl Into<String>) -> ClientResult<Self> {
        Self::with_config(PoolConfig::with_addr(addr))
    }

    /// Creates a client that logs alerts through `tracing`.
    pub fn with_config(config: PoolConfig) -> ClientResult<Self> {
        Self::with_alert_hook(config, Arc::new(LogAlertHook))
    }

    /// Creates a client that delivers alerts to `hook`.
    pub fn with_alert_hook(config: PoolConfig, hook: Arc<dyn AlertHook>) -> ClientResult<Self> {
        let pool = ConnectionPool::new(config)?;
        Ok(Self::from_parts(pool, Executor::new(hook)))
    }

    pub fn from_parts(pool: ConnectionPool, executor: Executor) -> Self {
        StoreClient { pool, executor }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Idle/active connection counts.
    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Pings the store.
    pub fn ping(&self) -> ClientResult<()> {
        match self.run(vec![arg("PING")])? {
            Reply::Status(_) | Reply::Data(_) => Ok(()),
            other => Err(unexpected("PING", &other)),
        }
    }

    /// Fetches a value. Fails with `NotFound` when the key is absent.
    pub fn get<T: FromWire>(&self, key: &str) -> ClientResult<T> {
        check_key(key)?;
        let reply = self.run(vec![arg("GET"), arg(key)])?;
        let value = decode_value("GET", reply)?;
        debug!(key, "get ok");
        Ok(value)
    }

    /// Fetches a value, mapping an absent key to `None`.
    pub fn get_opt<T: FromWire>(&self, key: &str) -> ClientResult<Option<T>> {
        match self.get(key) {
            Ok(value) => Ok(Some(value)),
            Err(ClientError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Fetches several values in one round trip.
    pub fn get_many<T: FromWire>(&self, keys: &[&str]) -> ClientResult<Vec<Option<T>>> {
        for key in keys {
            check_key(key)?;
        }
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = Vec::with_capacity(keys.len() + 1);
        args.push(arg("MGET"));
        args.extend(keys.iter().map(arg));
        match self.run(args)? {
            Reply::Array(items) => items
                .into_iter()
                .map(|item| match decode_value("MGET", item) {
                    Ok(value) => Ok(Some(value)),
                    Err(ClientError::NotFound) => Ok(None),
                    Err(err) => Err(err),
                })
                .collect(),
            other => Err(unexpected("MGET", &other)),
        }
    }

    /// Stores a value without expiration.
    pub fn set<V: ToWire + ?Sized>(&self, key: &str, value: &V) -> ClientResult<()> {
        check_key(key)?;
        let value = value.to_wire()?;
        let kind = value.kind();
        let reply = self.run(vec![arg("SET"), arg(key), value.into_bytes()])?;
        expect_ok("SET", reply)?;
        debug!(key, kind, "set ok");
        Ok(())
    }

    /// Stores a value that expires after `ttl`.
    pub fn set_ex<V: ToWire + ?Sized>(&self, key: &str, value: &V, ttl: Duration) -> ClientResult<()> {
        check_key(key)?;
        let value = value.to_wire()?;
        let args = vec![arg("SET"), arg(key), value.into_bytes(), arg("EX"), ttl_arg(ttl)];
        expect_ok("SET", self.run(args)?)?;
        debug!(key, ttl_secs = ttl.as_secs(), "set with expiry ok");
        Ok(())
    }

    /// Stores a value only if the key is absent, as one `SET .. NX`.
    ///
    /// Returns `true` when this call wrote the value.
    pub fn set_nx<V: ToWire + ?Sized>(
        &self,
        key: &str,
        value: &V,
        ttl: Option<Duration>,
    ) -> ClientResult<bool> {
        check_key(key)?;
        let value = value.to_wire()?;
        let mut args = vec![arg("SET"), arg(key), value.into_bytes()];
        if let Some(ttl) = ttl {
            args.push(arg("EX"));
            args.push(ttl_arg(ttl));
        }
        args.push(arg("NX"));

        let written = match self.run(args)? {
            Reply::Status(text) if text == "OK" => true,
            Reply::Nil => false,
            other => return Err(unexpected("SET", &other)),
        };
        debug!(key, written, "set if absent");
        Ok(written)
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete(&self, key: &str) -> ClientResult<bool> {
        check_key(key)?;
        let removed = expect_int("DEL", self.run(vec![arg("DEL"), arg(key)])?)?;
        Ok(removed > 0)
    }

    pub fn exists(&self, key: &str) -> ClientResult<bool> {
        check_key(key)?;
        let count = expect_int("EXISTS", self.run(vec![arg("EXISTS"), arg(key)])?)?;
        Ok(count > 0)
    }

    /// Sets a time-to-live. Returns false when the key does not exist.
    pub fn expire(&self, key: &str, ttl: Duration) -> ClientResult<bool> {
        check_key(key)?;
        let set = expect_int("EXPIRE", self.run(vec![arg("EXPIRE"), arg(key), ttl_arg(ttl)])?)?;
        Ok(set == 1)
    }

    /// Returns the TTL status for a key.
    pub fn ttl(&self, key: &str) -> ClientResult<KeyTtl> {
        check_key(key)?;
        match expect_int("TTL", self.run(vec![arg("TTL"), arg(key)])?)? {
            -2 => Ok(KeyTtl::Missing),
            -1 => Ok(KeyTtl::NoExpiry),
            secs if secs >= 0 => Ok(KeyTtl::ExpiresIn(Duration::from_secs(secs as u64))),
            other => Err(unexpected("TTL", &Reply::Integer(other))),
        }
    }

    /// Increments an integer value by one and returns the new value.
    pub fn incr(&self, key: &str) -> ClientResult<i64> {
        check_key(key)?;
        let value = expect_int("INCR", self.run(vec![arg("INCR"), arg(key)])?)?;
        debug!(key, value, "incr ok");
        Ok(value)
    }

    /// Increments a hash field by `delta` and returns the new value.
    pub fn hincrby(&self, key: &str, field: &str, delta: i64) -> ClientResult<i64> {
        check_key(key)?;
        let args = vec![arg("HINCRBY"), arg(key), arg(field), arg(delta.to_string())];
        let value = expect_int("HINCRBY", self.run(args)?)?;
        debug!(key, field, value, "hincrby ok");
        Ok(value)
    }

    /// Stores a struct as one hash field per struct field.
    ///
    /// The previous hash is replaced, so fields that are now `None` do not
    /// survive from an earlier write.
    pub fn set_object<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> ClientResult<()> {
        check_key(key)?;
        let hmset = hmset_args(key, value)?;
        self.replace_hash(key, hmset, None)?;
        debug!(key, "set object ok");
        Ok(())
    }

    /// Stores a struct as a hash that expires after `ttl`.
    pub fn set_object_ex<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> ClientResult<()> {
        check_key(key)?;
        let hmset = hmset_args(key, value)?;
        self.replace_hash(key, hmset, Some(ttl))?;
        debug!(key, ttl_secs = ttl.as_secs(), "set object with expiry ok");
        Ok(())
    }

    /// Reads a struct stored with `set_object`. Fails with `NotFound` on an
    /// absent key.
    pub fn get_object<T: DeserializeOwned>(&self, key: &str) -> ClientResult<T> {
        check_key(key)?;
        let items = match self.run(vec![arg("HGETALL"), arg(key)])? {
            Reply::Array(items) => items,
            other => return Err(unexpected("HGETALL", &other)),
        };
        if items.is_empty() {
            return Err(ClientError::NotFound);
        }

        let fields = field_pairs(items)?;
        let object = unflatten_fields(fields).map_err(|err| {
            warn!(key, error = %err, "get object decode failed");
            err
        })?;
        debug!(key, "get object ok");
        Ok(object)
    }

    /// Adds members to a string set, optionally refreshing its expiry.
    ///
    /// Returns the number of members that were newly added.
    pub fn add_strings<S: AsRef<str>>(
        &self,
        key: &str,
        members: &[S],
        ttl: Option<Duration>,
    ) -> ClientResult<i64> {
        check_key(key)?;
        if members.is_empty() {
            return Ok(0);
        }

        let mut args = Vec::with_capacity(members.len() + 2);
        args.push(arg("SADD"));
        args.push(arg(key));
        args.extend(members.iter().map(|member| arg(member.as_ref())));

        let mut conn = self.acquire("SADD")?;
        let added = expect_int("SADD", self.executor.execute(&mut conn, &args)?)?;
        if let Some(ttl) = ttl {
            expect_int(
                "EXPIRE",
                self.executor
                    .execute(&mut conn, &[arg("EXPIRE"), arg(key), ttl_arg(ttl)])?,
            )?;
        }
        debug!(key, added, "add strings ok");
        Ok(added)
    }

    /// Lists the members of a string set. An absent key yields an empty list.
    pub fn get_strings(&self, key: &str) -> ClientResult<Vec<String>> {
        check_key(key)?;
        expect_strings("SMEMBERS", self.run(vec![arg("SMEMBERS"), arg(key)])?)
    }

    /// Appends a value to the tail of a queue. Returns the new queue length.
    pub fn push<V: ToWire + ?Sized>(&self, key: &str, value: &V) -> ClientResult<i64> {
        check_key(key)?;
        let value = value.to_wire()?;
        let len = expect_int("RPUSH", self.run(vec![arg("RPUSH"), arg(key), value.into_bytes()])?)?;
        debug!(key, len, "push ok");
        Ok(len)
    }

    /// Removes the head of a queue. Fails with `NotFound` when it is empty.
    pub fn pop<T: FromWire>(&self, key: &str) -> ClientResult<T> {
        check_key(key)?;
        let value = decode_value("LPOP", self.run(vec![arg("LPOP"), arg(key)])?)?;
        debug!(key, "pop ok");
        Ok(value)
    }

    /// Adds a member to a geo index. Returns the number of new members.
    pub fn geo_add(
        &self,
        index: &str,
        member: &str,
        longitude: f64,
        latitude: f64,
    ) -> ClientResult<i64> {
        check_key(index)?;
        let args = vec![
            arg("GEOADD"),
            arg(index),
            arg(longitude.to_string()),
            arg(latitude.to_string()),
            arg(member),
        ];
        expect_int("GEOADD", self.run(args)?)
    }

    /// Lists keys starting with `prefix`.
    ///
    /// KEYS scans the whole keyspace on the server; keep it off hot paths.
    pub fn keys_with_prefix(&self, prefix: &str) -> ClientResult<Vec<String>> {
        let pattern = format!("{}*", prefix);
        expect_strings("KEYS", self.run(vec![arg("KEYS"), arg(pattern)])?)
    }

    // DEL + HMSET [+ EXPIRE] as one transaction.
    fn replace_hash(&self, key: &str, hmset: Vec<Bytes>, ttl: Option<Duration>) -> ClientResult<()> {
        let mut commands = vec![vec![arg("DEL"), arg(key)], hmset];
        if let Some(ttl) = ttl {
            commands.push(vec![arg("EXPIRE"), arg(key), ttl_arg(ttl)]);
        }

        let replies = self.transaction(&commands)?;
        match replies.as_slice() {
            [deleted, stored, expiry @ ..] => {
                expect_int("DEL", deleted.clone())?;
                expect_ok("HMSET", stored.clone())?;
                for reply in expiry {
                    expect_int("EXPIRE", reply.clone())?;
                }
                Ok(())
            }
            _ => Err(ClientError::UnexpectedReply {
                command: "EXEC".into(),
                reply: format!("<array of {}>", replies.len()),
            }),
        }
    }

    /// Runs `commands` inside MULTI/EXEC on one connection and returns one
    /// reply per command.
    ///
    /// A connection that fails before EXEC completes is closed, never
    /// recycled with a transaction still open.
    fn transaction(&self, commands: &[Vec<Bytes>]) -> ClientResult<Vec<Reply>> {
        let mut conn = self.acquire("MULTI")?;
        let replies = match self.queue_and_exec(&mut conn, commands) {
            Ok(replies) => replies,
            Err(err) => {
                conn.mark_broken();
                return Err(err);
            }
        };

        commands
            .iter()
            .zip(replies)
            .map(|(command, reply)| match reply {
                Reply::Error(message) => {
                    let command = command_name(command);
                    let err = ClientError::Command {
                        command: command.clone(),
                        message,
                    };
                    self.executor.report(&command, &err);
                    Err(err)
                }
                reply => Ok(reply),
            })
            .collect()
    }

    fn queue_and_exec(
        &self,
        conn: &mut PooledConnection,
        commands: &[Vec<Bytes>],
    ) -> ClientResult<Vec<Reply>> {
        expect_ok("MULTI", self.executor.execute(conn, &[arg("MULTI")])?)?;
        for command in commands {
            match self.executor.execute(conn, command)? {
                Reply::Status(text) if text == "QUEUED" => {}
                other => return Err(unexpected(&command_name(command), &other)),
            }
        }
        match self.executor.execute(conn, &[arg("EXEC")])? {
            Reply::Array(replies) if replies.len() == commands.len() => Ok(replies),
            other => Err(unexpected("EXEC", &other)),
        }
    }

    fn run(&self, args: Vec<Bytes>) -> ClientResult<Reply> {
        let command = command_name(&args);
        let mut conn = self.acquire(&command)?;
        self.executor.execute(&mut conn, &args)
    }

    fn acquire(&self, command: &str) -> ClientResult<PooledConnection> {
        self.pool.acquire().map_err(|err| {
            self.executor.report(command, &err);
            err
        })
    }
}

fn command_name(args: &[Bytes]) -> String {
    args.first()
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .unwrap_or_default()
}

fn check_key(key: &str) -> ClientResult<()> {
    if key.trim().is_empty() {
        return Err(ClientError::BlankKey);
    }
    Ok(())
}

fn arg(text: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(text.as_ref())
}

/// Whole seconds, rounded up, never below one.
fn ttl_arg(ttl: Duration) -> Bytes {
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs += 1;
    }
    arg(secs.max(1).to_string())
}

fn hmset_args<T: Serialize + ?Sized>(key: &str, value: &T) -> ClientResult<Vec<Bytes>> {
    let fields = flatten_fields(value)?;
    if fields.is_empty() {
        return Err(ClientError::InvalidValue("object has no fields to store".into()));
    }
    let mut args = Vec::with_capacity(fields.len() * 2 + 2);
    args.push(arg("HMSET"));
    args.push(arg(key));
    for (name, value) in fields {
        args.push(Bytes::from(name));
        args.push(Bytes::from(value));
    }
    Ok(args)
}

fn decode_value<T: FromWire>(command: &str, reply: Reply) -> ClientResult<T> {
    let decoded = match reply {
        Reply::Data(data) => T::from_wire(&data),
        Reply::Status(text) => T::from_wire(text.as_bytes()),
        Reply::Integer(value) => T::from_wire(value.to_string().as_bytes()),
        Reply::Nil => return Err(ClientError::NotFound),
        other => return Err(unexpected(command, &other)),
    };
    decoded.map_err(|err| {
        warn!(command, error = %err, "decode failed");
        err
    })
}

/// Pairs a flat HGETALL reply into `(field, value)` strings.
fn field_pairs(items: Vec<Reply>) -> ClientResult<Vec<(String, String)>> {
    if items.len() % 2 != 0 {
        return Err(ClientError::UnexpectedReply {
            command: "HGETALL".into(),
            reply: format!("<odd array of {}>", items.len()),
        });
    }

    let mut fields = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(name), Some(value)) = (items.next(), items.next()) {
        fields.push((decode_value("HGETALL", name)?, decode_value("HGETALL", value)?));
    }
    Ok(fields)
}

fn expect_ok(command: &str, reply: Reply) -> ClientResult<()> {
    match reply {
        Reply::Status(text) if text == "OK" => Ok(()),
        other => Err(unexpected(command, &other)),
    }
}

fn expect_int(command: &str, reply: Reply) -> ClientResult<i64> {
    match reply {
        Reply::Integer(value) => Ok(value),
        other => Err(unexpected(command, &other)),
    }
}

fn expect_strings(command: &str, reply: Reply) -> ClientResult<Vec<String>> {
    match reply {
        Reply::Array(items) => items
            .into_iter()
            .map(|item| decode_value(command, item))
            .collect(),
        other => Err(unexpected(command, &other)),
    }
}

fn unexpected(command: &str, reply: &Reply) -> ClientError {
    ClientError::UnexpectedReply {
        command: command.to_string(),
        reply: reply.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_keys_are_rejected() {
        assert!(matches!(check_key(""), Err(ClientError::BlankKey)));
        assert!(matches!(check_key("  \t"), Err(ClientError::BlankKey)));
        assert!(check_key("user:1").is_ok());
    }

    #[test]
    fn ttl_rounds_up_to_whole_seconds() {
        assert_eq!(ttl_arg(Duration::from_secs(10)), Bytes::from_static(b"10"));
        assert_eq!(ttl_arg(Duration::from_millis(1500)), Bytes::from_static(b"2"));
        assert_eq!(ttl_arg(Duration::ZERO), Bytes::from_static(b"1"));
    }

    #[test]
    fn nil_decodes_to_not_found() {
        let err = decode_value::<String>("GET", Reply::Nil).unwrap_err();
        assert!(matches!(err, ClientError::NotFound));
        let empty: String = decode_value("GET", Reply::Data(Bytes::new())).unwrap();
        assert_eq!(empty, "");
    }

    #[test]
    fn odd_hash_reply_is_unexpected_not_protocol() {
        let items = vec![
            Reply::Data(Bytes::from_static(b"name")),
            Reply::Data(Bytes::from_static(b"ann")),
            Reply::Data(Bytes::from_static(b"age")),
        ];
        let err = field_pairs(items).unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedReply { .. }));
        assert!(!err.breaks_connection());
        assert!(!err.is_alertable());

        let pairs = field_pairs(vec![
            Reply::Data(Bytes::from_static(b"age")),
            Reply::Data(Bytes::from_static(b"7")),
        ])
        .unwrap();
        assert_eq!(pairs, vec![("age".to_string(), "7".to_string())]);
    }

    #[test]
    fn hmset_requires_fields() {
        #[derive(Serialize)]
        struct Empty {}
        assert!(matches!(hmset_args("k", &Empty {}), Err(ClientError::InvalidValue(_))));
    }
}
