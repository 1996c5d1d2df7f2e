//! Connection registry and broadcast coordinator.
//!
//! Every dashboard push-channel owns a bounded FIFO queue.  The registry
//! holds the sending half of each queue; a per-connection writer task drains
//! the receiving half into the socket.  [`ConnectionRegistry::broadcast`]
//! never waits on a consumer: a closed or full queue counts as a delivery
//! failure and the connection is pruned once the pass is complete.

use std::collections::HashMap;
use std::fmt;

use gestura_types::{RelayError, RobotState};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Default capacity of each connection's outbound queue.
pub const DEFAULT_CHANNEL_BUFFER: usize = 32;

/// Opaque identity of a registered push-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Receiving side of a registered connection.
///
/// The owner forwards every queued frame to its transport in order.  Dropping
/// the channel closes the queue, and the next broadcast prunes the entry.
pub struct PushChannel {
    pub id: ConnectionId,
    pub frames: mpsc::Receiver<String>,
}

/// Outcome of a single [`ConnectionRegistry::broadcast`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
}

/// The open set of dashboard push-channels.
pub struct ConnectionRegistry {
    members: Mutex<HashMap<ConnectionId, mpsc::Sender<String>>>,
    buffer: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry whose connections queue at most `buffer`
    /// frames each.
    pub fn new(buffer: usize) -> Self {
        Self {
            members: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a new connection whose first frame is produced by `initial`.
    ///
    /// `initial` runs under the membership lock, so no broadcast can be
    /// enqueued ahead of it on this connection.
    pub fn register_with(&self, initial: impl FnOnce() -> String) -> PushChannel {
        let (tx, frames) = mpsc::channel(self.buffer);
        let id = ConnectionId::new();

        let mut members = self.members.lock();
        // A fresh queue always has room for the first frame.
        let _ = tx.try_send(initial());
        members.insert(id, tx);
        debug!(connection = %id, members = members.len(), "push-channel registered");

        PushChannel { id, frames }
    }

    /// Remove `id` from the set.  Returns `false` if it was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let mut members = self.members.lock();
        let removed = members.remove(&id).is_some();
        if removed {
            debug!(connection = %id, members = members.len(), "push-channel unregistered");
        }
        removed
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.members.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push `snapshot` to every registered connection.
    pub fn broadcast(&self, snapshot: &RobotState) -> BroadcastReport {
        let frame = match serde_json::to_string(snapshot) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "snapshot serialization failed; broadcast skipped");
                return BroadcastReport::default();
            }
        };
        self.broadcast_frame(&frame)
    }

    /// Push a pre-serialized frame to every registered connection.
    pub fn broadcast_frame(&self, frame: &str) -> BroadcastReport {
        let targets: Vec<(ConnectionId, mpsc::Sender<String>)> = self
            .members
            .lock()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();
        for (id, tx) in targets {
            match deliver(id, &tx, frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    debug!(error = %e, "dropping push-channel");
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut members = self.members.lock();
            for id in &failed {
                if members.remove(id).is_some() {
                    report.pruned += 1;
                }
            }
            warn!(
                delivered = report.delivered,
                pruned = report.pruned,
                remaining = members.len(),
                "broadcast pruned failed connections"
            );
        }

        report
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_BUFFER)
    }
}

fn deliver(id: ConnectionId, tx: &mpsc::Sender<String>, frame: &str) -> Result<(), RelayError> {
    tx.try_send(frame.to_string()).map_err(|e| match e {
        TrySendError::Full(_) => RelayError::DeliveryFailure(format!("{id} (queue full)")),
        TrySendError::Closed(_) => RelayError::DeliveryFailure(format!("{id} (closed)")),
    })
}
