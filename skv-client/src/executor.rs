//! # Command Executor
//!
//! Purpose: Run one command on a borrowed connection and funnel every
//! transport or command failure through the alerting path exactly once.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{trace, warn};

use crate::alert::{AlertDispatcher, AlertEvent, AlertHook};
use crate::error::{ClientError, ClientResult};
use crate::pool::PooledConnection;
use crate::resp::Reply;

/// Executes commands and reports failures.
#[derive(Clone, Default)]
pub struct Executor {
    alerts: AlertDispatcher,
}

impl Executor {
    pub fn new(hook: Arc<dyn AlertHook>) -> Self {
        Executor {
            alerts: AlertDispatcher::new(hook),
        }
    }

    /// Sends `args` and returns the reply.
    ///
    /// `Reply::Error` is converted into `ClientError::Command`, so a returned
    /// `Ok` never carries an error reply.
    pub fn execute(&self, conn: &mut PooledConnection, args: &[Bytes]) -> ClientResult<Reply> {
        let command = command_name(args);
        let result = match conn.exec(args) {
            Ok(Reply::Error(message)) => Err(ClientError::Command {
                command: command.clone(),
                message,
            }),
            other => other,
        };

        match result {
            Ok(reply) => {
                trace!(%command, reply = %reply, "command ok");
                Ok(reply)
            }
            Err(err) => {
                self.report(&command, &err);
                Err(err)
            }
        }
    }

    /// Logs `err` and forwards it to the alert hook when it is alertable.
    pub fn report(&self, command: &str, err: &ClientError) {
        warn!(%command, error = %err, "store command failed");
        if err.is_alertable() {
            self.alerts.notify(AlertEvent::new(command, err));
        }
    }
}

fn command_name(args: &[Bytes]) -> String {
    args.first()
        .map(|name| String::from_utf8_lossy(name).into_owned())
        .unwrap_or_default()
}
