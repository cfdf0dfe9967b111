//! # Alerting
//!
//! Purpose: Forward transport and command failures to an operator-facing
//! notification path without slowing down or changing the failing call.
//!
//! ## Design Principles
//! 1. **Fire And Forget**: Callers enqueue with `try_send`; a worker thread
//!    runs the hook.
//! 2. **Never Mask**: The caller's error is returned unchanged; the hook only
//!    sees a rendered copy.
//! 3. **Contained Failure**: Hook errors and panics are logged and dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;

use tracing::{error, warn};

use crate::error::ClientError;

/// Pending alerts beyond this are dropped.
const ALERT_QUEUE_CAPACITY: usize = 256;

/// A failure worth telling someone about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertEvent {
    /// Command that failed, or `DIAL` for connection setup.
    pub command: String,
    /// Rendered error.
    pub error: String,
}

impl AlertEvent {
    pub fn new(command: impl Into<String>, err: &ClientError) -> Self {
        AlertEvent {
            command: command.into(),
            error: err.to_string(),
        }
    }
}

/// Notification sink invoked for every alertable failure.
pub trait AlertHook: Send + Sync {
    /// Delivers one alert. Errors are logged by the dispatcher and otherwise ignored.
    fn alert(&self, event: &AlertEvent) -> anyhow::Result<()>;
}

/// Default hook: emits an `error` level tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertHook;

impl AlertHook for LogAlertHook {
    fn alert(&self, event: &AlertEvent) -> anyhow::Result<()> {
        error!(command = %event.command, error = %event.error, "store alert");
        Ok(())
    }
}

/// Queues alerts for delivery on a background thread.
#[derive(Clone)]
pub struct AlertDispatcher {
    sender: Option<SyncSender<AlertEvent>>,
}

impl AlertDispatcher {
    /// Spawns the delivery thread for `hook`.
    pub fn new(hook: Arc<dyn AlertHook>) -> Self {
        let (sender, receiver) = mpsc::sync_channel(ALERT_QUEUE_CAPACITY);
        let spawned = thread::Builder::new()
            .name("skv-alerts".into())
            .spawn(move || deliver_loop(receiver, hook));
        match spawned {
            Ok(_) => AlertDispatcher {
                sender: Some(sender),
            },
            Err(err) => {
                warn!(error = %err, "failed to start alert thread; alerts disabled");
                AlertDispatcher { sender: None }
            }
        }
    }

    /// Enqueues an alert without blocking.
    pub fn notify(&self, event: AlertEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        match sender.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(command = %event.command, "alert queue full; dropping alert");
            }
            Err(TrySendError::Disconnected(event)) => {
                warn!(command = %event.command, "alert thread gone; dropping alert");
            }
        }
    }
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        AlertDispatcher::new(Arc::new(LogAlertHook))
    }
}

// Exits once every dispatcher clone is dropped.
fn deliver_loop(receiver: Receiver<AlertEvent>, hook: Arc<dyn AlertHook>) {
    for event in receiver {
        match panic::catch_unwind(AssertUnwindSafe(|| hook.alert(&event))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(command = %event.command, error = %err, "alert hook failed");
            }
            Err(_) => {
                warn!(command = %event.command, "alert hook panicked");
            }
        }
    }
}
