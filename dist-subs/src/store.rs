//! In-memory subscriber storage shared by the client and replication paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::proto::{Status, Subscriber};

/// Result of [`SubscriberStore::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// New registration stored as given.
    Inserted(Subscriber),
    /// Existing record took the candidate's status and a fresh access time.
    Merged(Subscriber),
    /// Update attempt against an id this node has never stored.
    Rejected,
}

impl UpsertOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, UpsertOutcome::Rejected)
    }

    pub fn record(&self) -> Option<&Subscriber> {
        match self {
            UpsertOutcome::Inserted(record) | UpsertOutcome::Merged(record) => Some(record),
            UpsertOutcome::Rejected => None,
        }
    }
}

/// Authoritative id -> subscriber map of one node.
///
/// Every compound operation runs under one mutex so a check and the write
/// that depends on it cannot interleave with a concurrent client or peer.
///
/// Ids minted here are only unique within this process. Two nodes can hand
/// out the same id, and replication of both records then collides on the
/// receivers with the last write winning.
pub struct SubscriberStore {
    records: Mutex<BTreeMap<i32, Subscriber>>,
    next_id: AtomicI32,
}

impl Default for SubscriberStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberStore {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            next_id: AtomicI32::new(1),
        }
    }

    /// Next local id: 1, 2, 3, ...
    pub fn mint_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Inserts a new registration or merges a status change.
    ///
    /// `now_ms` becomes the merged record's `last_accessed`.
    pub fn upsert(&self, candidate: Subscriber, now_ms: i64) -> UpsertOutcome {
        let mut records = self.lock();

        if candidate.is_registration() && !records.contains_key(&candidate.id) {
            records.insert(candidate.id, candidate.clone());
            return UpsertOutcome::Inserted(candidate);
        }

        match records.get_mut(&candidate.id) {
            Some(existing) => {
                existing.status = candidate.status;
                existing.last_accessed = now_ms;
                UpsertOutcome::Merged(existing.clone())
            }
            None => UpsertOutcome::Rejected,
        }
    }

    /// Stores a record received from a peer, replacing whatever was there.
    pub fn apply_replica(&self, record: Subscriber) -> Option<Subscriber> {
        self.lock().insert(record.id, record)
    }

    pub fn get(&self, id: i32) -> Option<Subscriber> {
        self.lock().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of records currently ONLN, counted from live state.
    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|record| record.status() == Status::Onln)
            .count()
    }

    pub fn snapshot(&self) -> BTreeMap<i32, Subscriber> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<i32, Subscriber>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
