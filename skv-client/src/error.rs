//! # Client Errors
//!
//! Purpose: One error taxonomy for every layer of the client, from dialing a
//! connection to decoding a typed value.
//!
//! ## Design Principles
//! 1. **Validation Before I/O**: `BlankKey` and `InvalidValue` are produced
//!    before a connection is borrowed.
//! 2. **Absence Is Not Failure**: `NotFound` is distinct from decode errors.
//! 3. **Alert Classification**: `is_alertable` decides which failures reach
//!    the alerting hook.

use std::time::Duration;

/// Result type for the client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The key argument was empty or whitespace.
    #[error("key should not be blank")]
    BlankKey,

    /// The value cannot be stored through the requested path.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// The key is absent, expired, or refers to an empty list/hash.
    #[error("key not found or expired")]
    NotFound,

    /// Opening, authenticating, or selecting a database on a new connection failed.
    #[error("dial {addr} failed: {reason}")]
    Dial {
        /// Configured server address.
        addr: String,
        /// Human readable failure cause.
        reason: String,
    },

    /// No connection slot was available.
    #[error("connection pool exhausted (max active: {max_active}, waited: {waited:?})")]
    PoolExhausted {
        /// Configured upper bound on active connections.
        max_active: usize,
        /// How long the caller waited, if wait-mode is enabled.
        waited: Option<Duration>,
    },

    /// The store answered with an error reply.
    #[error("{command} failed: {message}")]
    Command {
        /// Command name, e.g. `SET`.
        command: String,
        /// Error text returned by the store.
        message: String,
    },

    /// A value could not be serialized or deserialized.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Network failure on an established connection.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// RESP2 framing violation.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reply type did not match the command.
    #[error("unexpected reply to {command}: {reply}")]
    UnexpectedReply {
        /// Command name.
        command: String,
        /// Short description of the reply received.
        reply: String,
    },

    /// Configuration could not be read or is invalid.
    #[error("config error: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns true for transport, dial and command failures.
    ///
    /// Validation errors, absence and pool exhaustion are not alerted.
    pub fn is_alertable(&self) -> bool {
        matches!(
            self,
            ClientError::Dial { .. }
                | ClientError::Command { .. }
                | ClientError::Io(_)
                | ClientError::Protocol(_)
        )
    }

    /// Returns true when the connection that produced this error must not be reused.
    pub fn breaks_connection(&self) -> bool {
        matches!(self, ClientError::Io(_) | ClientError::Protocol(_))
    }

    pub(crate) fn encoding(err: impl std::fmt::Display) -> Self {
        ClientError::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::encoding(err)
    }
}

impl From<bincode::Error> for ClientError {
    fn from(err: bincode::Error) -> Self {
        ClientError::encoding(err)
    }
}
