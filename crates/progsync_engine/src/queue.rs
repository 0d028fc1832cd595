//! Durable operation queue.
//!
//! Records live in the `operations` table keyed by id. Two secondary
//! indexes are maintained in the same atomic batch as every record change:
//!
//! - `operations_by_status`: `status byte | timestamp (BE) | id` so a prefix
//!   scan yields one status in logical-time order
//! - `operations_by_dedupe`: `Kind:key` to the id of the Pending record that
//!   currently owns that key
//!
//! Logical timestamps are strictly increasing per queue, so two operations
//! never tie.

use crate::clock::Clock;
use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use progsync_protocol::{Channel, DedupeKey, Operation, OperationKind, Timestamp};
use progsync_storage::{KeyRange, KvStore, WriteBatch};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const OPERATIONS: &str = "operations";
const BY_STATUS: &str = "operations_by_status";
const BY_DEDUPE: &str = "operations_by_dedupe";
const META: &str = "queue_meta";
const DEVICE_ID_KEY: &[u8] = b"device_id";

/// Lifecycle status of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationStatus {
    /// Waiting to be sent.
    Pending,
    /// Accepted by the remote.
    Completed,
    /// Given up on; only an explicit requeue revives it.
    Failed,
    /// Parked until a human resolves a conflict.
    ManualResolution,
}

impl OperationStatus {
    /// Every status.
    pub const ALL: [OperationStatus; 4] = [
        OperationStatus::Pending,
        OperationStatus::Completed,
        OperationStatus::Failed,
        OperationStatus::ManualResolution,
    ];

    /// Returns the status name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "Pending",
            OperationStatus::Completed => "Completed",
            OperationStatus::Failed => "Failed",
            OperationStatus::ManualResolution => "ManualResolution",
        }
    }

    /// Returns true once the operation has left Pending.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OperationStatus::Pending)
    }

    fn index_byte(self) -> u8 {
        match self {
            OperationStatus::Pending => 0,
            OperationStatus::Completed => 1,
            OperationStatus::Failed => 2,
            OperationStatus::ManualResolution => 3,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable record of one intended mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    /// Unique id, never reused.
    pub id: String,
    /// The operation and its payload.
    pub operation: Operation,
    /// Logical write time.
    pub timestamp: Timestamp,
    /// Device that recorded the operation.
    pub device_id: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Lifecycle status.
    pub status: OperationStatus,
    /// Why the operation failed or needs a human.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// When the record was first created.
    pub created_at: Timestamp,
    /// Key used to fold repeated edits into this record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<DedupeKey>,
}

impl QueuedOperation {
    /// Returns the operation kind.
    pub fn kind(&self) -> OperationKind {
        self.operation.kind()
    }

    /// Returns the channel the operation is sent on.
    pub fn channel(&self) -> Channel {
        self.operation.channel()
    }

    /// Returns the id of the targeted entity.
    pub fn entity_id(&self) -> &str {
        self.operation.entity_id()
    }
}

/// Record counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Pending records.
    pub pending: usize,
    /// Completed records.
    pub completed: usize,
    /// Failed records.
    pub failed: usize,
    /// Records awaiting manual resolution.
    pub manual: usize,
}

impl QueueStats {
    /// Returns the number of records of every status.
    pub fn total(&self) -> usize {
        self.pending + self.completed + self.failed + self.manual
    }
}

/// A durable, ordered queue of operations awaiting transmission.
///
/// Every mutation is a single read-modify-write committed as one atomic
/// batch. Writers are serialized inside the process.
pub struct OperationQueue {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    device_id: String,
    last_timestamp: Mutex<i64>,
}

impl fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationQueue")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl OperationQueue {
    /// Opens a queue over `store`, generating and persisting a device id on
    /// first use.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn open(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> SyncResult<Self> {
        Self::open_with_device_id(store, clock, None)
    }

    /// Opens a queue, persisting `device_id` if one is given.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn open_with_device_id(
        store: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        device_id: Option<String>,
    ) -> SyncResult<Self> {
        let stored = store
            .get(META, DEVICE_ID_KEY)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned());

        let device_id = match (device_id, stored) {
            (Some(requested), Some(stored)) if requested == stored => stored,
            (Some(requested), _) => {
                store.put(META, DEVICE_ID_KEY, requested.as_bytes())?;
                requested
            }
            (None, Some(stored)) => stored,
            (None, None) => {
                let generated = uuid::Uuid::new_v4().to_string();
                store.put(META, DEVICE_ID_KEY, generated.as_bytes())?;
                tracing::info!(device_id = %generated, "generated device id");
                generated
            }
        };

        let last_timestamp = store
            .scan(BY_STATUS, &KeyRange::All)?
            .iter()
            .filter_map(|(key, _)| index_timestamp(key))
            .max()
            .unwrap_or(i64::MIN);

        Ok(Self {
            store,
            clock,
            device_id,
            last_timestamp: Mutex::new(last_timestamp),
        })
    }

    /// Returns this device's id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Adds an operation and returns its id.
    ///
    /// When `dedupe` matches a Pending record, that record's payload and
    /// timestamp are overwritten in place and its id is returned.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a malformed payload and `Persistence` if the
    /// record cannot be committed.
    pub fn enqueue(&self, operation: Operation, dedupe: Option<DedupeKey>) -> SyncResult<String> {
        operation.validate()?;

        let mut last = self.last_timestamp.lock();
        let timestamp = self.next_timestamp(&mut last);

        if let Some(key) = &dedupe {
            if let Some(mut existing) = self.pending_for_dedupe(key)? {
                let old_index = status_key(existing.status, existing.timestamp, &existing.id);
                existing.operation = operation;
                existing.timestamp = timestamp;

                let mut batch = WriteBatch::new();
                batch.delete(BY_STATUS, &old_index);
                self.stage_record(&mut batch, &existing)?;
                self.store.write_batch(batch)?;

                tracing::debug!(
                    operation_id = %existing.id,
                    dedupe_key = %key.storage_key(),
                    "folded operation into pending record"
                );
                return Ok(existing.id);
            }
        }

        let record = QueuedOperation {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            timestamp,
            device_id: self.device_id.clone(),
            retry_count: 0,
            status: OperationStatus::Pending,
            error_message: None,
            created_at: self.clock.now(),
            dedupe_key: dedupe,
        };

        let mut batch = WriteBatch::new();
        self.stage_record(&mut batch, &record)?;
        if let Some(key) = &record.dedupe_key {
            batch.put(BY_DEDUPE, key.storage_key().as_bytes(), record.id.as_bytes());
        }
        self.store.write_batch(batch)?;

        tracing::debug!(
            operation_id = %record.id,
            kind = %record.kind(),
            entity_id = record.entity_id(),
            "enqueued operation"
        );
        Ok(record.id)
    }

    /// Enqueues each item in order.
    ///
    /// # Errors
    ///
    /// Stops at the first failure. Items before it stay enqueued.
    pub fn enqueue_batch<I>(&self, items: I) -> SyncResult<Vec<String>>
    where
        I: IntoIterator<Item = (Operation, Option<DedupeKey>)>,
    {
        items
            .into_iter()
            .map(|(operation, dedupe)| self.enqueue(operation, dedupe))
            .collect()
    }

    /// Returns a record by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn get(&self, id: &str) -> SyncResult<Option<QueuedOperation>> {
        self.store
            .get(OPERATIONS, id.as_bytes())?
            .map(|bytes| decode_record(&bytes))
            .transpose()
    }

    /// Returns Pending records, oldest logical time first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list_pending(&self) -> SyncResult<Vec<QueuedOperation>> {
        self.list_by_status(OperationStatus::Pending)
    }

    /// Returns Pending records of one kind.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list_by_type(&self, kind: OperationKind) -> SyncResult<Vec<QueuedOperation>> {
        Ok(self
            .list_pending()?
            .into_iter()
            .filter(|op| op.kind() == kind)
            .collect())
    }

    /// Returns Failed records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list_failed(&self) -> SyncResult<Vec<QueuedOperation>> {
        self.list_by_status(OperationStatus::Failed)
    }

    /// Returns records awaiting manual resolution.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list_manual(&self) -> SyncResult<Vec<QueuedOperation>> {
        self.list_by_status(OperationStatus::ManualResolution)
    }

    /// Returns every record with `status`, in logical-time order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn list_by_status(&self, status: OperationStatus) -> SyncResult<Vec<QueuedOperation>> {
        let rows = self
            .store
            .scan(BY_STATUS, &KeyRange::Prefix(vec![status.index_byte()]))?;

        let mut records = Vec::with_capacity(rows.len());
        for (key, _) in rows {
            let Some(id) = index_id(&key) else {
                continue;
            };
            match self.get(id)? {
                Some(record) => records.push(record),
                None => tracing::warn!(operation_id = id, "status index points at missing record"),
            }
        }
        Ok(records)
    }

    /// Returns the number of Pending records.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn pending_count(&self) -> SyncResult<usize> {
        self.count(OperationStatus::Pending)
    }

    /// Marks an operation Completed.
    ///
    /// Returns `Ok(false)` if it had already left Pending.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `Persistence` on store
    /// failure.
    pub fn mark_completed(&self, id: &str) -> SyncResult<bool> {
        self.finish(id, OperationStatus::Completed, None)
    }

    /// Marks an operation Failed with a reason.
    ///
    /// Returns `Ok(false)` if it had already left Pending.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `Persistence` on store
    /// failure.
    pub fn mark_failed(&self, id: &str, message: impl Into<String>) -> SyncResult<bool> {
        self.finish(id, OperationStatus::Failed, Some(message.into()))
    }

    /// Parks an operation for manual resolution.
    ///
    /// Returns `Ok(false)` if it had already left Pending.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `Persistence` on store
    /// failure.
    pub fn mark_manual_resolution(&self, id: &str, message: impl Into<String>) -> SyncResult<bool> {
        self.finish(id, OperationStatus::ManualResolution, Some(message.into()))
    }

    /// Increments an operation's retry count and returns the new count.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id.
    pub fn increment_retry(&self, id: &str) -> SyncResult<u32> {
        let _guard = self.last_timestamp.lock();
        let mut record = self.require(id)?;
        record.retry_count = record.retry_count.saturating_add(1);

        let mut batch = WriteBatch::new();
        batch.put(OPERATIONS, record.id.as_bytes(), &encode_record(&record)?);
        self.store.write_batch(batch)?;
        Ok(record.retry_count)
    }

    /// Returns an operation to Pending with a fresh timestamp.
    ///
    /// Pending records only get the new timestamp. Failed and
    /// ManualResolution records also lose their error message. The retry
    /// count is kept.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown id and `InvalidTransition` for a
    /// Completed record.
    pub fn requeue(&self, id: &str) -> SyncResult<()> {
        let mut last = self.last_timestamp.lock();
        let mut record = self.require(id)?;
        if record.status == OperationStatus::Completed {
            return Err(SyncError::InvalidTransition {
                id: id.to_string(),
                from: record.status.as_str(),
                to: OperationStatus::Pending.as_str(),
            });
        }

        let old_index = status_key(record.status, record.timestamp, &record.id);
        record.status = OperationStatus::Pending;
        record.error_message = None;
        record.timestamp = self.next_timestamp(&mut last);

        let mut batch = WriteBatch::new();
        batch.delete(BY_STATUS, &old_index);
        self.stage_record(&mut batch, &record)?;
        if let Some(key) = &record.dedupe_key {
            let storage_key = key.storage_key();
            if self.store.get(BY_DEDUPE, storage_key.as_bytes())?.is_none() {
                batch.put(BY_DEDUPE, storage_key.as_bytes(), record.id.as_bytes());
            }
        }
        self.store.write_batch(batch)?;

        tracing::debug!(operation_id = id, "requeued operation");
        Ok(())
    }

    /// Requeues every Failed operation and returns how many were revived.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn requeue_failed(&self) -> SyncResult<usize> {
        let failed = self.list_failed()?;
        for record in &failed {
            self.requeue(&record.id)?;
        }
        Ok(failed.len())
    }

    /// Returns record counts per status.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn stats(&self) -> SyncResult<QueueStats> {
        Ok(QueueStats {
            pending: self.count(OperationStatus::Pending)?,
            completed: self.count(OperationStatus::Completed)?,
            failed: self.count(OperationStatus::Failed)?,
            manual: self.count(OperationStatus::ManualResolution)?,
        })
    }

    /// Deletes Completed and Failed records whose last logical write is
    /// older than `max_age_days`. Returns the number deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn cleanup(&self, max_age_days: u32) -> SyncResult<usize> {
        let _guard = self.last_timestamp.lock();
        let cutoff = self
            .clock
            .now()
            .saturating_sub(Duration::from_secs(u64::from(max_age_days) * 24 * 60 * 60));

        let mut batch = WriteBatch::new();
        let mut deleted = 0;
        for status in [OperationStatus::Completed, OperationStatus::Failed] {
            let start = vec![status.index_byte()];
            let mut end = start.clone();
            end.extend_from_slice(&cutoff.to_sortable_bytes());

            for (key, _) in self.store.scan(BY_STATUS, &KeyRange::Between(start, end))? {
                let Some(id) = index_id(&key) else {
                    continue;
                };
                if let Some(record) = self.get(id)? {
                    self.stage_dedupe_release(&mut batch, &record)?;
                }
                batch.delete(OPERATIONS, id.as_bytes());
                batch.delete(BY_STATUS, &key);
                deleted += 1;
            }
        }

        if !batch.is_empty() {
            self.store.write_batch(batch)?;
            tracing::info!(deleted, max_age_days, "cleaned up old operations");
        }
        Ok(deleted)
    }

    /// Deletes every queued record. The device id is kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn clear_all(&self) -> SyncResult<()> {
        let _guard = self.last_timestamp.lock();
        let mut batch = WriteBatch::new();
        for table in [OPERATIONS, BY_STATUS, BY_DEDUPE] {
            for (key, _) in self.store.scan(table, &KeyRange::All)? {
                batch.delete(table, &key);
            }
        }
        if !batch.is_empty() {
            self.store.write_batch(batch)?;
        }
        tracing::info!("cleared operation queue");
        Ok(())
    }

    fn next_timestamp(&self, last: &mut i64) -> Timestamp {
        let now = self.clock.now().as_millis();
        let next = now.max(last.saturating_add(1));
        *last = next;
        Timestamp::from_millis(next)
    }

    fn require(&self, id: &str) -> SyncResult<QueuedOperation> {
        self.get(id)?.ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    fn count(&self, status: OperationStatus) -> SyncResult<usize> {
        Ok(self
            .store
            .scan(BY_STATUS, &KeyRange::Prefix(vec![status.index_byte()]))?
            .len())
    }

    fn pending_for_dedupe(&self, key: &DedupeKey) -> SyncResult<Option<QueuedOperation>> {
        let Some(id) = self.store.get(BY_DEDUPE, key.storage_key().as_bytes())? else {
            return Ok(None);
        };
        let id = String::from_utf8_lossy(&id).into_owned();
        Ok(self
            .get(&id)?
            .filter(|record| record.status == OperationStatus::Pending))
    }

    fn finish(&self, id: &str, to: OperationStatus, message: Option<String>) -> SyncResult<bool> {
        let _guard = self.last_timestamp.lock();
        let mut record = self.require(id)?;
        if record.status.is_terminal() {
            tracing::debug!(operation_id = id, status = %record.status, "operation already settled");
            return Ok(false);
        }

        let old_index = status_key(record.status, record.timestamp, &record.id);
        record.status = to;
        record.error_message = message;

        let mut batch = WriteBatch::new();
        batch.delete(BY_STATUS, &old_index);
        self.stage_record(&mut batch, &record)?;
        self.stage_dedupe_release(&mut batch, &record)?;
        self.store.write_batch(batch)?;

        tracing::debug!(operation_id = id, status = %to, "operation settled");
        Ok(true)
    }

    fn stage_record(&self, batch: &mut WriteBatch, record: &QueuedOperation) -> SyncResult<()> {
        batch.put(OPERATIONS, record.id.as_bytes(), &encode_record(record)?);
        batch.put(
            BY_STATUS,
            &status_key(record.status, record.timestamp, &record.id),
            &[],
        );
        Ok(())
    }

    /// Drops the dedupe entry if it still points at `record`.
    fn stage_dedupe_release(&self, batch: &mut WriteBatch, record: &QueuedOperation) -> SyncResult<()> {
        let Some(key) = &record.dedupe_key else {
            return Ok(());
        };
        let storage_key = key.storage_key();
        if self.store.get(BY_DEDUPE, storage_key.as_bytes())?.as_deref() == Some(record.id.as_bytes()) {
            batch.delete(BY_DEDUPE, storage_key.as_bytes());
        }
        Ok(())
    }
}

fn status_key(status: OperationStatus, timestamp: Timestamp, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(9 + id.len());
    key.push(status.index_byte());
    key.extend_from_slice(&timestamp.to_sortable_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn index_timestamp(key: &[u8]) -> Option<i64> {
    let bytes: [u8; 8] = key.get(1..9)?.try_into().ok()?;
    i64::try_from(u64::from_be_bytes(bytes)).ok()
}

fn index_id(key: &[u8]) -> Option<&str> {
    std::str::from_utf8(key.get(9..)?).ok()
}

fn encode_record(record: &QueuedOperation) -> SyncResult<Vec<u8>> {
    let mut bytes = Vec::new();
    ciborium::into_writer(record, &mut bytes).map_err(SyncError::codec)?;
    Ok(bytes)
}

fn decode_record(bytes: &[u8]) -> SyncResult<QueuedOperation> {
    ciborium::from_reader(bytes).map_err(SyncError::codec)
}
