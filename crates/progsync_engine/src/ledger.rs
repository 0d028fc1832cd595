//! Durable record of scheduled retries.
//!
//! Rows live in the `retries` table keyed by `scheduled_for (BE) | id`, so
//! a range scan below a bound returns every due retry in time order.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use progsync_protocol::Timestamp;
use progsync_storage::{KeyRange, KvStore, WriteBatch};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const RETRIES: &str = "retries";

/// A retry that must run even if the process restarts first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedRetry {
    /// Record id.
    pub id: String,
    /// Operation to retry.
    pub operation_id: String,
    /// When the retry is due.
    pub scheduled_for: Timestamp,
    /// When the retry was scheduled.
    pub created_at: Timestamp,
}

impl PersistedRetry {
    fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(8 + self.id.len());
        key.extend_from_slice(&self.scheduled_for.to_sortable_bytes());
        key.extend_from_slice(self.id.as_bytes());
        key
    }
}

/// The persisted retry ledger.
///
/// An in-memory timer and the startup scan can both try to run the same
/// retry. Both go through [`RetryLedger::claim`], which deletes the row and
/// reports whether this caller removed it, so exactly one of them wins.
pub struct RetryLedger {
    store: Arc<dyn KvStore>,
    lock: Mutex<()>,
}

impl fmt::Debug for RetryLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLedger").finish_non_exhaustive()
    }
}

impl RetryLedger {
    /// Creates a ledger over `store`.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// Records a retry of `operation_id` at `scheduled_for`, replacing any
    /// earlier record for the same operation.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be committed.
    pub fn schedule(
        &self,
        operation_id: &str,
        scheduled_for: Timestamp,
        now: Timestamp,
    ) -> SyncResult<PersistedRetry> {
        let _guard = self.lock.lock();
        let record = PersistedRetry {
            id: uuid::Uuid::new_v4().to_string(),
            operation_id: operation_id.to_string(),
            scheduled_for,
            created_at: now,
        };

        let mut batch = WriteBatch::new();
        for stale in self.all()?.iter().filter(|r| r.operation_id == operation_id) {
            batch.delete(RETRIES, &stale.key());
        }
        batch.put(RETRIES, &record.key(), &encode(&record)?);
        self.store.write_batch(batch)?;

        tracing::debug!(
            operation_id,
            scheduled_for = %scheduled_for,
            "persisted retry"
        );
        Ok(record)
    }

    /// Returns every retry due at or before `now`, earliest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn due(&self, now: Timestamp) -> SyncResult<Vec<PersistedRetry>> {
        let bound = Timestamp::from_millis(now.as_millis().saturating_add(1));
        self.scan(&KeyRange::Before(bound.to_sortable_bytes().to_vec()))
    }

    /// Returns every retry, earliest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn all(&self) -> SyncResult<Vec<PersistedRetry>> {
        self.scan(&KeyRange::All)
    }

    /// Returns every retry scheduled after `now`, earliest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn waiting(&self, now: Timestamp) -> SyncResult<Vec<PersistedRetry>> {
        let bound = Timestamp::from_millis(now.as_millis().saturating_add(1));
        self.scan(&KeyRange::AtLeast(bound.to_sortable_bytes().to_vec()))
    }

    /// Removes `record` and returns true if it was still present.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn claim(&self, record: &PersistedRetry) -> SyncResult<bool> {
        let _guard = self.lock.lock();
        let key = record.key();
        if self.store.get(RETRIES, &key)?.is_none() {
            return Ok(false);
        }
        self.store.delete(RETRIES, &key)?;
        Ok(true)
    }

    /// Removes every retry of an operation. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn remove_for_operation(&self, operation_id: &str) -> SyncResult<usize> {
        let _guard = self.lock.lock();
        let mut batch = WriteBatch::new();
        for record in self.all()?.iter().filter(|r| r.operation_id == operation_id) {
            batch.delete(RETRIES, &record.key());
        }
        let removed = batch.len();
        if removed > 0 {
            self.store.write_batch(batch)?;
        }
        Ok(removed)
    }

    /// Removes every retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn clear(&self) -> SyncResult<()> {
        let _guard = self.lock.lock();
        let mut batch = WriteBatch::new();
        for (key, _) in self.store.scan(RETRIES, &KeyRange::All)? {
            batch.delete(RETRIES, &key);
        }
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        Ok(())
    }

    fn scan(&self, range: &KeyRange) -> SyncResult<Vec<PersistedRetry>> {
        self.store
            .scan(RETRIES, range)?
            .iter()
            .map(|(_, value)| decode(value))
            .collect()
    }
}

fn encode(record: &PersistedRetry) -> SyncResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes).map_err(SyncError::codec)?;
    Ok(bytes)
}

fn decode(bytes: &[u8]) -> SyncResult<PersistedRetry> {
    ciborium::from_reader(bytes).map_err(SyncError::codec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use progsync_storage::InMemoryStore;

    fn ts(millis: i64) -> Timestamp {
        Timestamp::from_millis(millis)
    }

    #[test]
    fn due_returns_only_expired_records() {
        let ledger = RetryLedger::new(Arc::new(InMemoryStore::new()));
        ledger.schedule("op-1", ts(1_000), ts(0)).unwrap();
        ledger.schedule("op-2", ts(2_000), ts(0)).unwrap();
        ledger.schedule("op-3", ts(3_000), ts(0)).unwrap();

        let due: Vec<_> = ledger
            .due(ts(2_000))
            .unwrap()
            .into_iter()
            .map(|r| r.operation_id)
            .collect();
        assert_eq!(due, vec!["op-1", "op-2"]);

        let waiting: Vec<_> = ledger
            .waiting(ts(2_000))
            .unwrap()
            .into_iter()
            .map(|r| r.operation_id)
            .collect();
        assert_eq!(waiting, vec!["op-3"]);
        assert_eq!(ledger.all().unwrap().len(), 3);
    }

    #[test]
    fn rescheduling_replaces_previous_record() {
        let ledger = RetryLedger::new(Arc::new(InMemoryStore::new()));
        ledger.schedule("op-1", ts(1_000), ts(0)).unwrap();
        ledger.schedule("op-1", ts(5_000), ts(10)).unwrap();

        let all = ledger.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].scheduled_for, ts(5_000));
        assert_eq!(ledger.waiting(ts(4_999)).unwrap(), all);
    }

    #[test]
    fn claim_has_a_single_winner() {
        let ledger = RetryLedger::new(Arc::new(InMemoryStore::new()));
        let record = ledger.schedule("op-1", ts(1_000), ts(0)).unwrap();

        assert!(ledger.claim(&record).unwrap());
        assert!(!ledger.claim(&record).unwrap());
        assert!(ledger.all().unwrap().is_empty());
    }

    #[test]
    fn remove_for_operation_and_clear() {
        let ledger = RetryLedger::new(Arc::new(InMemoryStore::new()));
        ledger.schedule("op-1", ts(1_000), ts(0)).unwrap();
        ledger.schedule("op-2", ts(1_000), ts(0)).unwrap();

        assert_eq!(ledger.remove_for_operation("op-1").unwrap(), 1);
        assert_eq!(ledger.remove_for_operation("op-1").unwrap(), 0);
        let left: Vec<_> = ledger.all().unwrap().into_iter().map(|r| r.operation_id).collect();
        assert_eq!(left, vec!["op-2"]);

        ledger.clear().unwrap();
        assert!(ledger.all().unwrap().is_empty());
    }
}
