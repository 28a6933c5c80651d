//! Body-side handle of a MULTI/EXEC transaction.

use crate::cmd::Cmd;
use crate::connection::Connection;
use crate::types::{RedisResult, Value};
use std::future::Future;

/// Command surface handed to a [`Connection::multi`] body.
///
/// Every command issued through the handle is queued in the open
/// transaction. Its future resolves only once `EXEC` distributes its
/// reply array, so bodies should hold on to the futures rather than
/// await them before returning.
#[derive(Debug)]
pub struct MultiHandle {
    connection: Connection,
}

impl MultiHandle {
    pub(crate) fn new(connection: Connection) -> MultiHandle {
        MultiHandle { connection }
    }

    /// Queues one command. The returned future resolves with the
    /// command's element of the `EXEC` array, or fails with the discard
    /// error if the transaction is abandoned.
    pub fn execute(&self, command: Cmd) -> impl Future<Output = RedisResult<Value>> {
        self.connection.queue_command(command)
    }
}
