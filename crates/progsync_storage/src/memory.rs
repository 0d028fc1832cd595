//! In-memory store for testing.

use crate::batch::{Mutation, WriteBatch};
use crate::error::{StorageError, StorageResult};
use crate::store::{KeyRange, KvStore};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

/// Ordered tables shared by the in-memory and file stores.
#[derive(Debug, Default, Clone)]
pub(crate) struct Tables {
    tables: HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Tables {
    pub(crate) fn get(&self, table: &str, key: &[u8]) -> Option<Vec<u8>> {
        self.tables.get(table).and_then(|rows| rows.get(key)).cloned()
    }

    pub(crate) fn scan(&self, table: &str, range: &KeyRange) -> Vec<(Vec<u8>, Vec<u8>)> {
        let Some(rows) = self.tables.get(table) else {
            return Vec::new();
        };

        let start = match range.lower_bound() {
            Some(bound) => Bound::Included(bound.to_vec()),
            None => Bound::Unbounded,
        };

        rows.range((start, Bound::Unbounded))
            .skip_while(|(key, _)| !range.contains(key))
            .take_while(|(key, _)| range.contains(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    pub(crate) fn apply(&mut self, batch: &WriteBatch) {
        for mutation in batch.mutations() {
            match mutation {
                Mutation::Put { table, key, value } => {
                    self.tables
                        .entry(table.clone())
                        .or_default()
                        .insert(key.clone(), value.clone());
                }
                Mutation::Delete { table, key } => {
                    if let Some(rows) = self.tables.get_mut(table) {
                        rows.remove(key);
                        if rows.is_empty() {
                            self.tables.remove(table);
                        }
                    }
                }
            }
        }
    }

    /// Rebuilds the live contents as a single batch of puts.
    pub(crate) fn snapshot(&self) -> WriteBatch {
        let mut names: Vec<&String> = self.tables.keys().collect();
        names.sort();

        let mut batch = WriteBatch::new();
        for name in names {
            for (key, value) in &self.tables[name] {
                batch.put(name, key, value);
            }
        }
        batch
    }

    pub(crate) fn row_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub(crate) fn clear(&mut self) {
        self.tables.clear();
    }
}

/// An in-memory store.
///
/// This store keeps everything in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Sessions that intentionally do not persist their queue
///
/// Writes can be made to fail on demand with [`InMemoryStore::fail_writes`],
/// which lets callers exercise their persistence-failure paths.
///
/// # Example
///
/// ```rust
/// use progsync_storage::{InMemoryStore, KvStore};
///
/// let store = InMemoryStore::new();
/// store.put("settings", b"theme", b"dark").unwrap();
/// assert_eq!(store.get("settings", b"theme").unwrap(), Some(b"dark".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    fail_writes: AtomicBool,
}

impl InMemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail (or succeed again).
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns the total number of rows across all tables.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.tables.read().row_count()
    }
}

impl KvStore for InMemoryStore {
    fn get(&self, table: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.tables.read().get(table, key))
    }

    fn scan(&self, table: &str, range: &KeyRange) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>> {
        Ok(self.tables.read().scan(table, range))
    }

    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::WriteRejected(
                "in-memory store is failing writes".into(),
            ));
        }
        self.tables.write().apply(&batch);
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        self.tables.write().clear();
        Ok(())
    }
}
