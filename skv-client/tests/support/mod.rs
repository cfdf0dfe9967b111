//! In-process RESP2 store used by the integration tests.
//!
//! Implements just enough of the command set for the client: strings with
//! EX/NX, counters, hashes, sets, lists, a geo index, prefix KEYS and
//! MULTI/EXEC. Each accepted connection is served on its own thread.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use skv_client::PoolConfig;

enum Stored {
    Str(Vec<u8>),
    Hash(BTreeMap<Vec<u8>, Vec<u8>>),
    Set(BTreeSet<Vec<u8>>),
    List(VecDeque<Vec<u8>>),
    Geo(BTreeMap<Vec<u8>, (f64, f64)>),
}

struct Entry {
    value: Stored,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Shared {
    data: Mutex<HashMap<Vec<u8>, Entry>>,
    password: Option<String>,
    accepted: AtomicUsize,
    streams: Mutex<Vec<TcpStream>>,
    log: Mutex<Vec<Vec<String>>>,
}

/// Handle to a running fake store.
pub struct FakeStore {
    addr: String,
    shared: Arc<Shared>,
}

impl FakeStore {
    pub fn start() -> Self {
        Self::spawn(None)
    }

    pub fn with_password(password: &str) -> Self {
        Self::spawn(Some(password.to_string()))
    }

    fn spawn(password: Option<String>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let shared = Arc::new(Shared {
            password,
            ..Default::default()
        });

        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                if let Ok(clone) = stream.try_clone() {
                    accept_shared.streams.lock().unwrap().push(clone);
                }
                let conn_shared = Arc::clone(&accept_shared);
                thread::spawn(move || serve(stream, conn_shared));
            }
        });

        FakeStore { addr, shared }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Pool config with short timeouts pointed at this store.
    pub fn config(&self) -> PoolConfig {
        PoolConfig {
            addr: self.addr(),
            connect_timeout: Some(Duration::from_secs(2)),
            read_timeout: Some(Duration::from_secs(2)),
            write_timeout: Some(Duration::from_secs(2)),
            ..PoolConfig::default()
        }
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Forcibly closes every accepted connection.
    pub fn drop_connections(&self) {
        for stream in self.shared.streams.lock().unwrap().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Every command received, as upper-cased name followed by raw args.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.shared.log.lock().unwrap().clone()
    }

    /// Names of commands received, excluding connection housekeeping.
    pub fn command_names(&self) -> Vec<String> {
        self.commands()
            .into_iter()
            .map(|args| args[0].clone())
            .filter(|name| name != "PING" && name != "AUTH" && name != "SELECT")
            .collect()
    }
}

fn serve(stream: TcpStream, shared: Arc<Shared>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    let mut authed = shared.password.is_none();
    let mut queued: Option<Vec<(String, Vec<Vec<u8>>)>> = None;

    while let Ok(args) = read_command(&mut reader) {
        if args.is_empty() {
            continue;
        }
        let name = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
        let mut logged = vec![name.clone()];
        logged.extend(args[1..].iter().map(|a| String::from_utf8_lossy(a).into_owned()));
        shared.log.lock().unwrap().push(logged);

        let response = if name == "AUTH" {
            if args.len() == 2 && shared.password.as_deref().map(str::as_bytes) == Some(&args[1][..]) {
                authed = true;
                resp_simple("OK")
            } else {
                resp_error("WRONGPASS invalid username-password pair")
            }
        } else if !authed {
            resp_error("NOAUTH Authentication required.")
        } else if name == "MULTI" {
            if queued.is_some() {
                resp_error("ERR MULTI calls can not be nested")
            } else {
                queued = Some(Vec::new());
                resp_simple("OK")
            }
        } else if name == "EXEC" {
            match queued.take() {
                None => resp_error("ERR EXEC without MULTI"),
                Some(commands) => {
                    // One lock for the whole batch keeps it atomic.
                    let mut data = shared.data.lock().unwrap();
                    let mut out = format!("*{}\r\n", commands.len()).into_bytes();
                    for (name, args) in &commands {
                        out.extend(dispatch(name, &args[1..], &mut data));
                    }
                    out
                }
            }
        } else if let Some(commands) = queued.as_mut() {
            commands.push((name.clone(), args));
            resp_simple("QUEUED")
        } else {
            let mut data = shared.data.lock().unwrap();
            dispatch(&name, &args[1..], &mut data)
        };

        if writer.write_all(&response).is_err() || writer.flush().is_err() {
            break;
        }
    }
}

fn dispatch(name: &str, args: &[Vec<u8>], data: &mut HashMap<Vec<u8>, Entry>) -> Vec<u8> {
    purge_expired(data);

    match (name, args.len()) {
        ("PING", 0) => resp_simple("PONG"),
        ("SELECT", 1) => match parse_i64(&args[0]) {
            Some(db) if (0..16).contains(&db) => resp_simple("OK"),
            _ => resp_error("ERR DB index is out of range"),
        },
        ("GET", 1) => match data.get(&args[0]) {
            Some(Entry { value: Stored::Str(v), .. }) => resp_bulk(v),
            Some(_) => wrong_type(),
            None => resp_null(),
        },
        ("MGET", n) if n > 0 => {
            let items: Vec<Option<Vec<u8>>> = args
                .iter()
                .map(|key| match data.get(key) {
                    Some(Entry { value: Stored::Str(v), .. }) => Some(v.clone()),
                    _ => None,
                })
                .collect();
            resp_array(&items)
        }
        ("SET", n) if n >= 2 => handle_set(data, args),
        ("DEL", n) if n > 0 => resp_integer(args.iter().filter(|k| data.remove(*k).is_some()).count() as i64),
        ("EXISTS", n) if n > 0 => resp_integer(args.iter().filter(|k| data.contains_key(*k)).count() as i64),
        ("EXPIRE", 2) => {
            let Some(secs) = parse_i64(&args[1]) else { return not_integer() };
            match data.get_mut(&args[0]) {
                Some(entry) => {
                    entry.expires_at = Some(Instant::now() + Duration::from_secs(secs.max(0) as u64));
                    resp_integer(1)
                }
                None => resp_integer(0),
            }
        }
        ("TTL", 1) => match data.get(&args[0]) {
            None => resp_integer(-2),
            Some(Entry { expires_at: None, .. }) => resp_integer(-1),
            Some(Entry { expires_at: Some(at), .. }) => {
                let left = at.saturating_duration_since(Instant::now());
                resp_integer(((left.as_millis() + 500) / 1000) as i64)
            }
        },
        ("INCR", 1) => {
            let entry = data.entry(args[0].clone()).or_insert_with(|| Entry {
                value: Stored::Str(b"0".to_vec()),
                expires_at: None,
            });
            match &mut entry.value {
                Stored::Str(v) => match parse_i64(v) {
                    Some(n) => {
                        *v = (n + 1).to_string().into_bytes();
                        resp_integer(n + 1)
                    }
                    None => not_integer(),
                },
                _ => wrong_type(),
            }
        }
        ("HINCRBY", 3) => {
            let Some(delta) = parse_i64(&args[2]) else { return not_integer() };
            let entry = data.entry(args[0].clone()).or_insert_with(|| Entry {
                value: Stored::Hash(BTreeMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Stored::Hash(fields) => {
                    let current = fields.get(&args[1]).map(|v| parse_i64(v));
                    let current = match current {
                        None => 0,
                        Some(Some(n)) => n,
                        Some(None) => return not_integer(),
                    };
                    fields.insert(args[1].clone(), (current + delta).to_string().into_bytes());
                    resp_integer(current + delta)
                }
                _ => wrong_type(),
            }
        }
        ("HMSET", n) if n >= 3 && n % 2 == 1 => {
            let entry = data.entry(args[0].clone()).or_insert_with(|| Entry {
                value: Stored::Hash(BTreeMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Stored::Hash(fields) => {
                    for pair in args[1..].chunks(2) {
                        fields.insert(pair[0].clone(), pair[1].clone());
                    }
                    resp_simple("OK")
                }
                _ => wrong_type(),
            }
        }
        ("HGETALL", 1) => match data.get(&args[0]) {
            Some(Entry { value: Stored::Hash(fields), .. }) => {
                let items: Vec<Option<Vec<u8>>> = fields
                    .iter()
                    .flat_map(|(k, v)| [Some(k.clone()), Some(v.clone())])
                    .collect();
                resp_array(&items)
            }
            Some(_) => wrong_type(),
            None => resp_array(&[]),
        },
        ("SADD", n) if n >= 2 => {
            let entry = data.entry(args[0].clone()).or_insert_with(|| Entry {
                value: Stored::Set(BTreeSet::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Stored::Set(members) => {
                    let added = args[1..].iter().filter(|m| members.insert((*m).clone())).count();
                    resp_integer(added as i64)
                }
                _ => wrong_type(),
            }
        }
        ("SMEMBERS", 1) => match data.get(&args[0]) {
            Some(Entry { value: Stored::Set(members), .. }) => {
                let items: Vec<Option<Vec<u8>>> = members.iter().cloned().map(Some).collect();
                resp_array(&items)
            }
            Some(_) => wrong_type(),
            None => resp_array(&[]),
        },
        ("GEOADD", 4) => {
            let (Some(lon), Some(lat)) = (parse_f64(&args[1]), parse_f64(&args[2])) else {
                return resp_error("ERR value is not a valid float");
            };
            if !(-180.0..=180.0).contains(&lon) || !(-85.05112878..=85.05112878).contains(&lat) {
                return resp_error("ERR invalid longitude,latitude pair");
            }
            let entry = data.entry(args[0].clone()).or_insert_with(|| Entry {
                value: Stored::Geo(BTreeMap::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Stored::Geo(points) => {
                    let added = points.insert(args[3].clone(), (lon, lat)).is_none();
                    resp_integer(added as i64)
                }
                _ => wrong_type(),
            }
        }
        ("KEYS", 1) => {
            let pattern = &args[0];
            let mut keys: Vec<Vec<u8>> = data
                .keys()
                .filter(|key| match pattern.split_last() {
                    Some((b'*', prefix)) => key.starts_with(prefix),
                    _ => *key == pattern,
                })
                .cloned()
                .collect();
            keys.sort();
            let items: Vec<Option<Vec<u8>>> = keys.into_iter().map(Some).collect();
            resp_array(&items)
        }
        ("RPUSH", n) if n >= 2 => {
            let entry = data.entry(args[0].clone()).or_insert_with(|| Entry {
                value: Stored::List(VecDeque::new()),
                expires_at: None,
            });
            match &mut entry.value {
                Stored::List(items) => {
                    items.extend(args[1..].iter().cloned());
                    resp_integer(items.len() as i64)
                }
                _ => wrong_type(),
            }
        }
        ("LPOP", 1) => {
            let (popped, now_empty) = match data.get_mut(&args[0]) {
                Some(Entry { value: Stored::List(items), .. }) => {
                    let popped = items.pop_front();
                    (popped, items.is_empty())
                }
                Some(_) => return wrong_type(),
                None => return resp_null(),
            };
            if now_empty {
                data.remove(&args[0]);
            }
            match popped {
                Some(value) => resp_bulk(&value),
                None => resp_null(),
            }
        }
        _ => resp_error(&format!("ERR unknown command or wrong arity '{}'", name)),
    }
}

fn handle_set(data: &mut HashMap<Vec<u8>, Entry>, args: &[Vec<u8>]) -> Vec<u8> {
    let mut expires_at = None;
    let mut only_if_absent = false;
    let mut idx = 2;
    while idx < args.len() {
        let option = String::from_utf8_lossy(&args[idx]).to_ascii_uppercase();
        match option.as_str() {
            "NX" => {
                only_if_absent = true;
                idx += 1;
            }
            "EX" if idx + 1 < args.len() => {
                match parse_i64(&args[idx + 1]) {
                    Some(secs) if secs > 0 => {
                        expires_at = Some(Instant::now() + Duration::from_secs(secs as u64));
                    }
                    _ => return resp_error("ERR invalid expire time in 'set' command"),
                }
                idx += 2;
            }
            _ => return resp_error("ERR syntax error"),
        }
    }

    if only_if_absent && data.contains_key(&args[0]) {
        return resp_null();
    }
    data.insert(
        args[0].clone(),
        Entry {
            value: Stored::Str(args[1].clone()),
            expires_at,
        },
    );
    resp_simple("OK")
}

fn purge_expired(data: &mut HashMap<Vec<u8>, Entry>) {
    let now = Instant::now();
    data.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
}

pub fn read_command<R: BufRead>(reader: &mut R) -> std::io::Result<Vec<Vec<u8>>> {
    let mut line = Vec::new();
    read_line(reader, &mut line)?;
    if line.first() != Some(&b'*') {
        return Err(invalid("expected array"));
    }
    let count = parse_usize(&line[1..])?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        read_line(reader, &mut line)?;
        if line.first() != Some(&b'$') {
            return Err(invalid("expected bulk"));
        }
        let len = parse_usize(&line[1..])?;
        let mut data = vec![0u8; len];
        reader.read_exact(&mut data)?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf)?;
        if crlf != *b"\r\n" {
            return Err(invalid("missing crlf"));
        }
        args.push(data);
    }
    Ok(args)
}

fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<()> {
    buf.clear();
    let bytes = reader.read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"));
    }
    if buf.len() < 2 || buf[buf.len() - 2] != b'\r' {
        return Err(invalid("invalid line"));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

fn invalid(msg: &str) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string())
}

fn parse_usize(data: &[u8]) -> std::io::Result<usize> {
    std::str::from_utf8(data)
        .ok()
        .and_then(|text| text.parse().ok())
        .ok_or_else(|| invalid("digit"))
}

fn parse_i64(data: &[u8]) -> Option<i64> {
    std::str::from_utf8(data).ok()?.parse().ok()
}

fn parse_f64(data: &[u8]) -> Option<f64> {
    std::str::from_utf8(data).ok()?.parse().ok()
}

pub fn resp_simple(msg: &str) -> Vec<u8> {
    format!("+{}\r\n", msg).into_bytes()
}

pub fn resp_error(msg: &str) -> Vec<u8> {
    format!("-{}\r\n", msg).into_bytes()
}

pub fn resp_integer(value: i64) -> Vec<u8> {
    format!(":{}\r\n", value).into_bytes()
}

pub fn resp_null() -> Vec<u8> {
    b"$-1\r\n".to_vec()
}

pub fn resp_bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn resp_array(items: &[Option<Vec<u8>>]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", items.len()).into_bytes();
    for item in items {
        match item {
            Some(data) => out.extend(resp_bulk(data)),
            None => out.extend(resp_null()),
        }
    }
    out
}

fn wrong_type() -> Vec<u8> {
    resp_error("WRONGTYPE Operation against a key holding the wrong kind of value")
}

fn not_integer() -> Vec<u8> {
    resp_error("ERR value is not an integer or out of range")
}
