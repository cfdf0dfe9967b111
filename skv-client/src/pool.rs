//! # Connection Pool
//!
//! Purpose: Reuse TCP connections across callers, bound how many exist, and
//! retire the ones that went stale or broke.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: One mutex guards bookkeeping only; dialing,
//!    probing and closing happen outside it.
//! 3. **RAII Return**: `PooledConnection` gives its connection back on drop,
//!    so every exit path releases exactly once.
//! 4. **Lazy Validation**: Idle connections are probed with PING on checkout.
//!
//! ## Accounting
//!
//! `total` counts idle connections, borrowed connections and dials in
//! flight. A slot is reserved under the lock before dialing and released if
//! the dial fails, so a failed or timed-out `acquire` never leaks capacity.
//!
//! ```text
//! ConnectionPool ──Arc──> PoolInner
//!                           ├── config: PoolConfig
//!                           ├── state: Mutex<PoolState>
//!                           │     ├── idle: VecDeque<IdleConnection>  (front = newest)
//!                           │     └── total: usize
//!                           └── available: Condvar   (wait-mode)
//! ```

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::resp::Reply;

/// Point-in-time pool counters, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections parked in the pool.
    pub idle: usize,
    /// Connections borrowed or being dialed.
    pub active: usize,
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleConnection>,
    total: usize,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    initialized: AtomicBool,
}

enum Checkout {
    Idle(Connection),
    Reserved,
}

/// Connection pool handle. Cloning shares the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool and runs its one-time initialization.
    ///
    /// No connection is dialed until the first `acquire`.
    pub fn new(config: PoolConfig) -> ClientResult<Self> {
        config.validate()?;
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
        };
        let pool = ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
                available: Condvar::new(),
                initialized: AtomicBool::new(false),
            }),
        };
        pool.init();
        Ok(pool)
    }

    /// Starts the idle sweeper if an idle timeout is configured.
    ///
    /// Safe to call from many threads; only the first call does any work and
    /// returns `true`.
    pub fn init(&self) -> bool {
        if self
            .inner
            .initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if let Some(interval) = self.inner.config.effective_sweep_interval() {
            let weak = Arc::downgrade(&self.inner);
            let spawned = thread::Builder::new()
                .name("skv-idle-sweeper".into())
                .spawn(move || sweep_loop(weak, interval));
            if let Err(err) = spawned {
                warn!(error = %err, "failed to start idle sweeper; stale connections are dropped on checkout only");
            }
        }

        info!(
            addr = %self.inner.config.addr,
            max_active = self.inner.config.max_active,
            max_idle = self.inner.config.max_idle,
            wait = self.inner.config.wait,
            "connection pool initialized"
        );
        true
    }

    /// Borrows a connection, reusing an idle one when possible.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        match self.checkout()? {
            Checkout::Idle(mut conn) => match conn.ping() {
                Ok(()) => return Ok(self.wrap(conn)),
                Err(err) => {
                    // The slot stays reserved for the replacement dial.
                    debug!(error = %err, "idle connection failed PING; redialing");
                    conn.close();
                }
            },
            Checkout::Reserved => {}
        }

        match Connection::dial(&self.inner.config) {
            Ok(conn) => Ok(self.wrap(conn)),
            Err(err) => {
                self.inner.release_slot();
                Err(err)
            }
        }
    }

    /// Current idle and active counts.
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.total - state.idle.len(),
        }
    }

    /// Configuration the pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn wrap(&self, conn: Connection) -> PooledConnection {
        PooledConnection {
            pool: Arc::clone(&self.inner),
            conn: Some(conn),
            broken: false,
        }
    }

    fn checkout(&self) -> ClientResult<Checkout> {
        let config = &self.inner.config;
        let started = Instant::now();
        let deadline = config.wait_timeout.map(|timeout| started + timeout);

        // Declared before the guard so stale sockets close after unlocking.
        let mut stale = Vec::new();
        let mut state = self.inner.state.lock();
        let mut timed_out = false;

        loop {
            while let Some(idle) = state.idle.pop_front() {
                if self.inner.is_stale(&idle, Instant::now()) {
                    state.total -= 1;
                    stale.push(idle.conn);
                    continue;
                }
                return Ok(Checkout::Idle(idle.conn));
            }

            if config.max_active == 0 || state.total < config.max_active {
                state.total += 1;
                return Ok(Checkout::Reserved);
            }

            if !config.wait || timed_out {
                return Err(ClientError::PoolExhausted {
                    max_active: config.max_active,
                    waited: config.wait.then(|| started.elapsed()),
                });
            }

            match deadline {
                Some(deadline) => {
                    timed_out = self.inner.available.wait_until(&mut state, deadline).timed_out();
                }
                None => self.inner.available.wait(&mut state),
            }
        }
    }
}

impl PoolInner {
    fn is_stale(&self, idle: &IdleConnection, now: Instant) -> bool {
        match self.config.idle_timeout {
            Some(timeout) => now.saturating_duration_since(idle.since) >= timeout,
            None => false,
        }
    }

    fn release_slot(&self) {
        {
            let mut state = self.state.lock();
            state.total = state.total.saturating_sub(1);
        }
        self.available.notify_one();
    }

    fn put_back(&self, conn: Connection, broken: bool) {
        let rejected = {
            let mut state = self.state.lock();
            if broken || state.idle.len() >= self.config.max_idle {
                state.total = state.total.saturating_sub(1);
                Some(conn)
            } else {
                state.idle.push_front(IdleConnection {
                    conn,
                    since: Instant::now(),
                });
                None
            }
        };
        self.available.notify_one();
        if let Some(conn) = rejected {
            conn.close();
        }
    }

    /// Closes idle connections older than the idle timeout.
    fn evict_idle(&self, now: Instant) -> usize {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some(oldest) = state.idle.back() {
                if !self.is_stale(oldest, now) {
                    break;
                }
                if let Some(idle) = state.idle.pop_back() {
                    evicted.push(idle.conn);
                }
            }
            state.total -= evicted.len();
        }

        let count = evicted.len();
        if count > 0 {
            self.available.notify_all();
        }
        for conn in evicted {
            conn.close();
        }
        count
    }
}

fn sweep_loop(pool: Weak<PoolInner>, interval: Duration) {
    loop {
        thread::sleep(interval);
        let Some(inner) = pool.upgrade() else {
            break;
        };
        let evicted = inner.evict_idle(Instant::now());
        if evicted > 0 {
            debug!(evicted, "evicted idle connections");
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    broken: bool,
}

impl PooledConnection {
    /// Executes a command. Transport failures mark the connection broken so
    /// it is closed instead of recycled.
    pub fn exec(&mut self, args: &[Bytes]) -> ClientResult<Reply> {
        let response = self.deref_mut().exec(args);
        if let Err(err) = &response {
            if err.breaks_connection() {
                self.broken = true;
            }
        }
        response
    }

    /// Marks the connection as unusable.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        self.conn.as_ref().expect("pooled connection already released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("pooled connection already released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put_back(conn, self.broken);
        }
    }
}
