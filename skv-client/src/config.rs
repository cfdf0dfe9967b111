//! # Pool Configuration
//!
//! Purpose: Describe how the pool dials, authenticates and sizes its
//! connections, and load that description from a declarative file.
//!
//! ## Design Principles
//! 1. **Plain Data**: `PoolConfig` is a cloneable struct with sane defaults.
//! 2. **File Shape Separate From Runtime Shape**: `StoreConfig` mirrors the
//!    on-disk field names and converts into `PoolConfig`.
//! 3. **Immutable After Construction**: the pool copies the config once.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{ClientError, ClientResult};

/// Runtime configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Server address, e.g. "127.0.0.1:6379".
    pub addr: String,
    /// Optional password sent with AUTH after connecting.
    pub password: Option<String>,
    /// Database index selected after connecting. 0 skips SELECT.
    pub database: u32,
    /// Optional TCP connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Optional TCP read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional TCP write timeout.
    pub write_timeout: Option<Duration>,
    /// Maximum connections (idle + borrowed). 0 means unlimited.
    pub max_active: usize,
    /// Maximum idle connections kept for reuse.
    pub max_idle: usize,
    /// Idle connections older than this are closed.
    pub idle_timeout: Option<Duration>,
    /// Block in `acquire` when the pool is exhausted instead of failing.
    pub wait: bool,
    /// Upper bound on a blocked `acquire`. `None` waits indefinitely.
    pub wait_timeout: Option<Duration>,
    /// How often the idle sweeper runs. Defaults to half the idle timeout.
    pub sweep_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            addr: "127.0.0.1:6379".to_string(),
            password: None,
            database: 0,
            connect_timeout: None,
            read_timeout: None,
            write_timeout: None,
            max_active: 16,
            max_idle: 8,
            idle_timeout: None,
            wait: false,
            wait_timeout: None,
            sweep_interval: None,
        }
    }
}

impl PoolConfig {
    /// Creates a default config pointed at `addr`.
    pub fn with_addr(addr: impl Into<String>) -> Self {
        PoolConfig {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Checks the config for values the pool cannot honor.
    pub fn validate(&self) -> ClientResult<()> {
        if self.addr.trim().is_empty() {
            return Err(ClientError::Config("address must not be empty".into()));
        }
        if self.max_active > 0 && self.max_idle > self.max_active {
            return Err(ClientError::Config(format!(
                "max_idle ({}) exceeds max_active ({})",
                self.max_idle, self.max_active
            )));
        }
        Ok(())
    }

    /// Interval between idle sweeps, if an idle timeout is configured.
    pub(crate) fn effective_sweep_interval(&self) -> Option<Duration> {
        let idle_timeout = self.idle_timeout?;
        let interval = self
            .sweep_interval
            .unwrap_or_else(|| (idle_timeout / 2).max(Duration::from_secs(1)));
        if interval.is_zero() {
            Some(Duration::from_millis(1))
        } else {
            Some(interval)
        }
    }
}

/// On-disk configuration shape.
///
/// Timeouts are whole seconds; zero disables the corresponding limit.
/// `redisMaxActive` 0 means unlimited; `redisMaxIdle` 0 takes the default
/// idle cap (8, or `redisMaxActive` when that is smaller).
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(rename = "redisUrl")]
    pub url: String,
    #[serde(rename = "redisPassword")]
    pub password: String,
    #[serde(rename = "redisDB")]
    pub database: u32,
    #[serde(rename = "redisTimeout")]
    pub timeout_secs: u64,
    #[serde(rename = "redisMaxActive")]
    pub max_active: usize,
    #[serde(rename = "redisMaxIdle")]
    pub max_idle: usize,
    #[serde(rename = "redisMaxIdleSeconds")]
    pub max_idle_secs: u64,
    #[serde(rename = "redisWaitExhaust")]
    pub wait_exhaust: bool,
}

impl StoreConfig {
    /// Parses a JSON document.
    pub fn from_json_str(text: &str) -> ClientResult<Self> {
        serde_json::from_str(text).map_err(|err| ClientError::Config(err.to_string()))
    }

    /// Reads and parses a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> ClientResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| ClientError::Config(format!("{}: {}", path.display(), err)))?;
        Self::from_json_str(&text)
    }

    /// Converts the file shape into a runtime `PoolConfig`.
    pub fn into_pool_config(self) -> PoolConfig {
        let defaults = PoolConfig::default();
        let timeout = secs(self.timeout_secs);
        PoolConfig {
            addr: if self.url.is_empty() { defaults.addr } else { self.url },
            password: Some(self.password).filter(|p| !p.is_empty()),
            database: self.database,
            connect_timeout: timeout,
            read_timeout: timeout,
            write_timeout: timeout,
            max_active: self.max_active,
            max_idle: idle_limit(self.max_idle, self.max_active, defaults.max_idle),
            idle_timeout: secs(self.max_idle_secs),
            wait: self.wait_exhaust,
            wait_timeout: timeout,
            sweep_interval: None,
        }
    }
}

// 0 idle would close every released connection, so it takes the default,
// bounded by a non-zero `max_active`.
fn idle_limit(max_idle: usize, max_active: usize, default: usize) -> usize {
    match (max_idle, max_active) {
        (0, 0) => default,
        (0, active) => default.min(active),
        (idle, _) => idle,
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}
