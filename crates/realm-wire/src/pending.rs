//! Pending query table: correlates request ids with waiting callers.
//!
//! Each entry owns a oneshot sender and a timeout task. Whichever of
//! response, rejection, timeout or cancellation arrives first removes the
//! entry; every later outcome finds nothing and is a no-op.

use dashmap::DashMap;
use realm_types::{RealmError, RealmResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

struct PendingEntry<T> {
    target: String,
    tx: oneshot::Sender<RealmResult<T>>,
    timer: Option<AbortHandle>,
}

/// Receiving side of a pending entry.
pub type PendingReceiver<T> = oneshot::Receiver<RealmResult<T>>;

/// Outstanding requests keyed by correlation id.
///
/// The table is generic so discovery lookups and peer queries can keep
/// separate id namespaces.
pub struct PendingTable<T> {
    entries: Arc<DashMap<String, PendingEntry<T>>>,
    capacity: usize,
}

impl<T> Clone for PendingTable<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
            capacity: self.capacity,
        }
    }
}

impl<T: Send + 'static> PendingTable<T> {
    /// Create a table holding at most `capacity` outstanding entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            capacity,
        }
    }

    /// Register a new request addressed to `target` and arm its timer.
    ///
    /// Returns the fresh request id and the receiver the caller awaits.
    /// Must be called from within a tokio runtime.
    pub fn create(
        &self,
        target: &str,
        timeout: Duration,
    ) -> RealmResult<(String, PendingReceiver<T>)> {
        if self.entries.len() >= self.capacity {
            return Err(RealmError::TooManyPending(self.capacity));
        }
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id.clone(),
            PendingEntry {
                target: target.to_string(),
                tx,
                timer: None,
            },
        );

        let entries = Arc::clone(&self.entries);
        let timer_id = id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some((_, entry)) = entries.remove(&timer_id) {
                debug!(request_id = %timer_id, "Pending request timed out");
                let _ = entry.tx.send(Err(RealmError::QueryTimeout {
                    request_id: timer_id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                }));
            }
        });
        if let Some(mut entry) = self.entries.get_mut(&id) {
            entry.timer = Some(timer.abort_handle());
        }
        Ok((id, rx))
    }

    /// Resolve an entry with a value. Returns false if the id is unknown.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        self.finish(id, None, Ok(value))
    }

    /// Resolve an entry only if it was addressed to `from`.
    ///
    /// A response arriving from a different peer leaves the entry untouched.
    pub fn resolve_from(&self, id: &str, from: &str, value: RealmResult<T>) -> bool {
        self.finish(id, Some(from), value)
    }

    /// Reject an entry with an error. Returns false if the id is unknown.
    pub fn reject(&self, id: &str, error: RealmError) -> bool {
        self.finish(id, None, Err(error))
    }

    /// Drop an entry without an answer; the caller observes `Cancelled`.
    pub fn cancel(&self, id: &str) -> bool {
        self.finish(id, None, Err(RealmError::Cancelled(id.to_string())))
    }

    /// Reject every outstanding entry (used on shutdown).
    pub fn reject_all(&self, error: RealmError) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.reject(&id, error.clone());
        }
    }

    /// Number of outstanding entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn finish(&self, id: &str, from: Option<&str>, outcome: RealmResult<T>) -> bool {
        let removed = match from {
            Some(from) => self.entries.remove_if(id, |_, entry| entry.target == from),
            None => self.entries.remove(id),
        };
        match removed {
            Some((_, entry)) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                let _ = entry.tx.send(outcome);
                true
            }
            None => {
                debug!(request_id = %id, "No pending entry (already settled)");
                false
            }
        }
    }
}
