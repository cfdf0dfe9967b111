//! # StashKV Client
//!
//! Purpose: Provide a synchronous, pooled client for Redis-compatible stores
//! with typed values and predictable error semantics.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections; bound how many exist.
//! 2. **Explicit Handles**: Build one `StoreClient` at startup and clone it
//!    into every consumer; there is no global pool.
//! 3. **Declared Encodings**: Values pick their wire form through
//!    `ToWire`/`FromWire`; structs choose `Json` or `Binary` at the call site.
//! 4. **Protocol Clarity**: RESP2 is framed and parsed explicitly.
//!
//! ## Layers
//!
//! ```text
//! StoreClient ── validates keys, encodes values, decodes replies
//!   ├── ConnectionPool ── acquire / release, idle sweep, wait-mode
//!   │     └── Connection::dial ── TCP + AUTH + SELECT, PING probe
//!   └── Executor ── one command per call, failures to AlertHook
//! ```

mod alert;
mod client;
mod codec;
mod config;
mod connection;
mod error;
mod executor;
mod pool;
mod resp;

pub use alert::{AlertDispatcher, AlertEvent, AlertHook, LogAlertHook};
pub use client::{KeyTtl, StoreClient};
pub use codec::{flatten_fields, unflatten_fields, Binary, EncodedValue, FromWire, Json, ToWire};
pub use config::{PoolConfig, StoreConfig};
pub use connection::Connection;
pub use error::{ClientError, ClientResult};
pub use executor::Executor;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use resp::Reply;
