//! Durable pending-transaction queue and dead-letter list.
//!
//! Both stores keep their contents in memory and rewrite the whole list to a
//! named record after every mutation, before reporting success. When a write
//! fails the in-memory copy is kept and marked dirty; the next mutation or an
//! explicit [`PendingTransactionStore::flush`] retries the write.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::RecordStore;
use crate::error::{EnqueueError, QueueError, StorageError};
use crate::model::{DeadLetter, LocalId, SyncState, Transaction};

/// Record holding the serialized pending queue.
pub const PENDING_RECORD: &str = "pending_transactions";
/// Record holding transactions rejected by the server.
pub const DEAD_LETTER_RECORD: &str = "dead_letter_transactions";

fn load_json<T: DeserializeOwned>(
    records: &dyn RecordStore,
    name: &str,
) -> Result<Option<T>, StorageError> {
    let Some(raw) = records.load(name)? else {
        return Ok(None);
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| StorageError::Corrupt {
            record: name.to_string(),
            message: e.to_string(),
        })
}

fn save_json<T: Serialize + ?Sized>(
    records: &dyn RecordStore,
    name: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value).map_err(|e| StorageError::Encode {
        record: name.to_string(),
        message: e.to_string(),
    })?;
    records.save(name, &raw)
}

// ---------------------------------------------------------------------------
// Pending queue
// ---------------------------------------------------------------------------

#[derive(Default)]
struct QueueInner {
    entries: VecDeque<Transaction>,
    dirty: bool,
}

/// FIFO queue of sales not yet acknowledged by the admin dashboard.
pub struct PendingTransactionStore {
    records: Arc<dyn RecordStore>,
    inner: Mutex<QueueInner>,
}

impl PendingTransactionStore {
    /// Rehydrate the queue from durable storage.
    ///
    /// A transaction still marked in flight was being submitted when the
    /// process stopped; its outcome is unknown, so it goes back to `queued` and
    /// is resubmitted under the same idempotency key.
    pub fn open(records: Arc<dyn RecordStore>) -> Result<Self, StorageError> {
        let mut entries: VecDeque<Transaction> =
            load_json::<Vec<Transaction>>(records.as_ref(), PENDING_RECORD)?
                .unwrap_or_default()
                .into();

        for tx in entries.iter_mut() {
            if tx.sync_state == SyncState::InFlight {
                warn!(
                    local_id = %tx.local_id,
                    attempts = tx.attempts,
                    "Transaction was in flight at shutdown, returning it to the queue"
                );
                tx.sync_state = SyncState::Queued;
            }
        }

        if !entries.is_empty() {
            info!(pending = entries.len(), "Rehydrated pending transaction queue");
        }

        Ok(Self {
            records,
            inner: Mutex::new(QueueInner {
                entries,
                dirty: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, inner: &mut QueueInner) -> Result<(), StorageError> {
        let (front, back) = inner.entries.as_slices();
        let ordered: Vec<&Transaction> = front.iter().chain(back.iter()).collect();
        match save_json(self.records.as_ref(), PENDING_RECORD, &ordered) {
            Ok(()) => {
                inner.dirty = false;
                Ok(())
            }
            Err(e) => {
                inner.dirty = true;
                warn!(error = %e, pending = ordered.len(), "Failed to persist pending queue");
                Err(e)
            }
        }
    }

    /// Append a transaction and persist the queue.
    ///
    /// Enqueueing an id that is already queued is a no-op.
    pub fn enqueue(&self, mut transaction: Transaction) -> Result<(), EnqueueError> {
        let mut inner = self.lock();
        if inner
            .entries
            .iter()
            .any(|t| t.local_id == transaction.local_id)
        {
            debug!(local_id = %transaction.local_id, "Transaction already queued");
            return Ok(());
        }

        transaction.sync_state = SyncState::Queued;
        inner.entries.push_back(transaction.clone());
        self.persist(&mut inner).map_err(|source| EnqueueError {
            transaction: Box::new(transaction),
            source,
        })
    }

    /// Copy of the queue in submission order. Nothing is removed.
    pub fn drain_snapshot(&self) -> Vec<Transaction> {
        self.lock().entries.iter().cloned().collect()
    }

    /// Mark a queued transaction as in flight and count the attempt.
    ///
    /// On a storage failure the in-memory state is still updated; the marker
    /// only matters across restarts, where an in-flight entry is requeued
    /// anyway.
    pub fn mark_in_flight(&self, local_id: &LocalId) -> Result<Transaction, QueueError> {
        let mut inner = self.lock();
        if let Some(current) = inner
            .entries
            .iter()
            .find(|t| t.sync_state == SyncState::InFlight && &t.local_id != local_id)
        {
            return Err(QueueError::AlreadyInFlight(current.local_id.clone()));
        }

        let tx = inner
            .entries
            .iter_mut()
            .find(|t| &t.local_id == local_id)
            .ok_or_else(|| QueueError::NotQueued(local_id.clone()))?;
        tx.sync_state = SyncState::InFlight;
        tx.attempts += 1;
        let updated = tx.clone();

        self.persist(&mut inner)?;
        Ok(updated)
    }

    /// Remove a confirmed transaction.
    ///
    /// The entry is gone from memory even when the write fails, so it is never
    /// submitted twice in this session.
    pub fn remove(&self, local_id: &LocalId) -> Result<Option<Transaction>, StorageError> {
        let mut inner = self.lock();
        let Some(pos) = inner.entries.iter().position(|t| &t.local_id == local_id) else {
            return Ok(None);
        };
        let removed = inner.entries.remove(pos);
        self.persist(&mut inner)?;
        Ok(removed)
    }

    /// Put transactions back at the head of the queue, in the order given,
    /// ahead of anything queued since. Existing copies are replaced.
    pub fn requeue(&self, transactions: Vec<Transaction>) -> Result<(), StorageError> {
        if transactions.is_empty() {
            return Ok(());
        }
        let mut inner = self.lock();
        let ids: HashSet<LocalId> = transactions.iter().map(|t| t.local_id.clone()).collect();
        inner.entries.retain(|t| !ids.contains(&t.local_id));

        let mut seen = HashSet::new();
        let mut head: Vec<Transaction> = transactions
            .into_iter()
            .filter(|t| seen.insert(t.local_id.clone()))
            .collect();
        for tx in head.iter_mut() {
            tx.sync_state = SyncState::Queued;
        }
        for tx in head.into_iter().rev() {
            inner.entries.push_front(tx);
        }
        self.persist(&mut inner)
    }

    /// Return a transaction to `Queued` where it stands, recording why its
    /// attempt failed. Queue order is untouched. Returns false when the id is
    /// not queued.
    pub fn release(
        &self,
        local_id: &LocalId,
        last_error: Option<String>,
    ) -> Result<bool, StorageError> {
        let mut inner = self.lock();
        let Some(tx) = inner.entries.iter_mut().find(|t| &t.local_id == local_id) else {
            return Ok(false);
        };
        tx.sync_state = SyncState::Queued;
        if last_error.is_some() {
            tx.last_error = last_error;
        }
        self.persist(&mut inner)?;
        Ok(true)
    }

    /// Retry a previously failed write, if any.
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if !inner.dirty {
            return Ok(());
        }
        self.persist(&mut inner)?;
        info!(pending = inner.entries.len(), "Pending queue flushed to storage");
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn contains(&self, local_id: &LocalId) -> bool {
        self.lock().entries.iter().any(|t| &t.local_id == local_id)
    }

    pub fn in_flight(&self) -> Option<LocalId> {
        self.lock()
            .entries
            .iter()
            .find(|t| t.sync_state == SyncState::InFlight)
            .map(|t| t.local_id.clone())
    }
}

// ---------------------------------------------------------------------------
// Dead letters
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DeadLetterInner {
    entries: Vec<DeadLetter>,
    dirty: bool,
}

/// Transactions the server rejected, kept for operator review.
pub struct DeadLetterStore {
    records: Arc<dyn RecordStore>,
    inner: Mutex<DeadLetterInner>,
}

impl DeadLetterStore {
    pub fn open(records: Arc<dyn RecordStore>) -> Result<Self, StorageError> {
        let entries = load_json::<Vec<DeadLetter>>(records.as_ref(), DEAD_LETTER_RECORD)?
            .unwrap_or_default();
        if !entries.is_empty() {
            warn!(dead_letters = entries.len(), "Rejected transactions awaiting review");
        }
        Ok(Self {
            records,
            inner: Mutex::new(DeadLetterInner {
                entries,
                dirty: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, DeadLetterInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, inner: &mut DeadLetterInner) -> Result<(), StorageError> {
        let result = save_json(self.records.as_ref(), DEAD_LETTER_RECORD, &inner.entries);
        inner.dirty = result.is_err();
        result
    }

    /// Record a rejection. A second rejection of the same id replaces the first.
    ///
    /// On failure nothing is kept, so the caller can leave the transaction in
    /// the pending queue instead.
    pub fn push(&self, dead_letter: DeadLetter) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let was_dirty = inner.dirty;
        let local_id = dead_letter.transaction.local_id.clone();
        let previous = inner
            .entries
            .iter()
            .position(|d| d.transaction.local_id == local_id)
            .map(|pos| (pos, inner.entries.remove(pos)));
        inner.entries.push(dead_letter);

        if let Err(e) = self.persist(&mut inner) {
            inner.entries.pop();
            if let Some((pos, previous)) = previous {
                inner.entries.insert(pos, previous);
            }
            // An earlier unsaved change is still unsaved.
            inner.dirty = was_dirty;
            return Err(e);
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<DeadLetter> {
        self.lock().entries.clone()
    }

    pub fn get(&self, local_id: &LocalId) -> Option<DeadLetter> {
        self.lock()
            .entries
            .iter()
            .find(|d| &d.transaction.local_id == local_id)
            .cloned()
    }

    /// Drop a dead letter after the operator has dealt with it.
    pub fn discard(&self, local_id: &LocalId) -> Result<Option<DeadLetter>, StorageError> {
        let mut inner = self.lock();
        let Some(pos) = inner
            .entries
            .iter()
            .position(|d| &d.transaction.local_id == local_id)
        else {
            return Ok(None);
        };
        let removed = inner.entries.remove(pos);
        self.persist(&mut inner)?;
        Ok(Some(removed))
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if !inner.dirty {
            return Ok(());
        }
        self.persist(&mut inner)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
