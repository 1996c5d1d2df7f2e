//! [`StateStore`] – owner of the canonical [`RobotState`].
//!
//! Every other component only ever sees owned snapshots.  Merges are computed
//! on a copy and committed under the write lock together with the revision
//! bump and the history append, so readers never observe a half-applied
//! update.

use std::collections::VecDeque;

use chrono::Utc;
use gestura_types::{RelayError, RobotState, StateRecord, UpdateSource};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

/// Default number of accepted updates kept in the in-memory window.
pub const DEFAULT_HISTORY_LEN: usize = 50;

struct Inner {
    state: RobotState,
    revision: u64,
    history: VecDeque<StateRecord>,
}

/// Thread-safe holder of the single process-wide [`RobotState`].
///
/// # Example
///
/// ```
/// use gestura_middleware::StateStore;
/// use gestura_types::UpdateSource;
/// use serde_json::json;
///
/// let store = StateStore::default();
/// let snapshot = store
///     .merge(&json!({ "stopped": true }), UpdateSource::Http)
///     .unwrap();
/// assert!(snapshot.stopped);
/// assert_eq!(store.revision(), 1);
/// ```
pub struct StateStore {
    inner: RwLock<Inner>,
    history_len: usize,
}

impl StateStore {
    /// Create a store holding the default state, keeping at most
    /// `history_len` recent updates (at least one).
    pub fn new(history_len: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                state: RobotState::default(),
                revision: 0,
                history: VecDeque::new(),
            }),
            history_len: history_len.max(1),
        }
    }

    /// Snapshot of the current state.
    pub fn read(&self) -> RobotState {
        self.inner.read().state.clone()
    }

    /// Number of merges accepted since process start.
    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    /// Apply `patch` and return the resulting snapshot.
    ///
    /// # Errors
    ///
    /// Propagates [`RelayError::InvalidPayload`] from [`RobotState::merged`];
    /// the stored state, revision and history are untouched in that case.
    pub fn merge(&self, patch: &Value, source: UpdateSource) -> Result<RobotState, RelayError> {
        let mut inner = self.inner.write();
        let next = inner.state.merged(patch)?;

        inner.revision += 1;
        inner.state = next.clone();
        let record = StateRecord {
            revision: inner.revision,
            at: Utc::now(),
            source,
            state: next.clone(),
        };
        if inner.history.len() == self.history_len {
            inner.history.pop_front();
        }
        inner.history.push_back(record);

        debug!(revision = inner.revision, %source, "state merged");
        Ok(next)
    }

    /// Recent accepted updates, oldest first.
    pub fn history(&self) -> Vec<StateRecord> {
        self.inner.read().history.iter().cloned().collect()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}
