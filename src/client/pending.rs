//! Correlation table for in-flight requests.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::ResponseEnvelope;

type Settler = oneshot::Sender<BridgeResult<Value>>;

/// Map of pending request ids to the callers waiting on them.
///
/// Each entry is removed exactly once: by its response, a timeout, a failed
/// send, or [`PendingTable::fail_all`] when the channel closes.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: DashMap<String, Settler>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh id and register a waiter for it.
    pub fn register(&self) -> (String, oneshot::Receiver<BridgeResult<Value>>) {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if let Entry::Vacant(slot) = self.entries.entry(id.clone()) {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                return (id, rx);
            }
        }
    }

    /// Deliver a response to its waiter. Returns `false` if no request with
    /// that id is pending.
    pub fn settle(&self, response: ResponseEnvelope) -> bool {
        match self.entries.remove(&response.id) {
            Some((_, tx)) => {
                // The caller may have stopped waiting; nothing to do then.
                let _ = tx.send(response.into_outcome());
                true
            }
            None => false,
        }
    }

    /// Fail one pending request with `error`. Returns `false` if it was not
    /// pending.
    pub fn reject(&self, id: &str, error: BridgeError) -> bool {
        match self.entries.remove(id) {
            Some((_, tx)) => {
                let _ = tx.send(Err(error));
                true
            }
            None => false,
        }
    }

    /// Forget a request without settling it.
    pub fn remove(&self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Reject every pending request with `error`. Returns how many there were.
    pub fn fail_all(&self, error: &BridgeError) -> usize {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, tx)) = self.entries.remove(&id) {
                let _ = tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
