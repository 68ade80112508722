use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::DEFAULT_SEND_TIMEOUT;
use crate::error::{Result, ShardingError};
use crate::protocol::ServerMessage;
use crate::scheduler::repo_state::ConnectionId;

/// Send side of one worker connection.
///
/// The transport owns the receiving end and is responsible for serializing
/// and flushing whatever is queued here.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    connection_id: ConnectionId,
    tx: mpsc::Sender<ServerMessage>,
    send_timeout: Duration,
}

impl ConsumerHandle {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            connection_id,
            tx,
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// Create a handle together with the receiver the transport drains.
    pub fn channel(
        connection_id: ConnectionId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(connection_id, tx), rx)
    }

    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Queue a message. Waits up to the send timeout while the outbound buffer
    /// is full; fails after that or once the transport has dropped the receiver.
    pub async fn send(&self, message: ServerMessage) -> Result<()> {
        self.tx
            .send_timeout(message, self.send_timeout)
            .await
            .map_err(|_| ShardingError::SendFailed(self.connection_id))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Thread-safe table of connection id → handle.
///
/// The lock is only ever held for the map operation itself; callers clone the
/// handle out and send without it.
#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    consumers: Mutex<HashMap<ConnectionId, ConsumerHandle>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a handle, replacing any previous one for the same id.
    pub fn add(&self, connection_id: ConnectionId, handle: ConsumerHandle) {
        self.consumers.lock().insert(connection_id, handle);
    }

    pub fn remove(&self, connection_id: &ConnectionId) {
        self.consumers.lock().remove(connection_id);
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Result<ConsumerHandle> {
        self.consumers
            .lock()
            .get(connection_id)
            .cloned()
            .ok_or(ShardingError::ConsumerNotFound(*connection_id))
    }

    pub fn count(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Look up `connection_id` and queue `message` on it.
    pub async fn send(&self, connection_id: &ConnectionId, message: ServerMessage) -> Result<()> {
        let handle = self.get(connection_id)?;
        handle.send(message).await
    }
}
