//! Key-value store trait definition.

use crate::batch::WriteBatch;
use crate::error::StorageResult;

/// A range of keys within one table.
///
/// Ranges are evaluated against raw key bytes in lexicographic order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    /// Every key in the table.
    All,
    /// Keys starting with the given prefix.
    Prefix(Vec<u8>),
    /// Keys strictly less than the given bound.
    Before(Vec<u8>),
    /// Keys in `[start, end)`.
    Between(Vec<u8>, Vec<u8>),
    /// Keys greater than or equal to the given bound.
    AtLeast(Vec<u8>),
}

impl KeyRange {
    /// Returns true if `key` falls inside this range.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        match self {
            KeyRange::All => true,
            KeyRange::Prefix(prefix) => key.starts_with(prefix),
            KeyRange::Before(end) => key < end.as_slice(),
            KeyRange::Between(start, end) => key >= start.as_slice() && key < end.as_slice(),
            KeyRange::AtLeast(start) => key >= start.as_slice(),
        }
    }

    /// Returns the smallest key that can match, if bounded below.
    #[must_use]
    pub fn lower_bound(&self) -> Option<&[u8]> {
        match self {
            KeyRange::Prefix(prefix) => Some(prefix),
            KeyRange::Between(start, _) | KeyRange::AtLeast(start) => Some(start),
            KeyRange::All | KeyRange::Before(_) => None,
        }
    }
}

/// A durable, ordered key-value store.
///
/// Stores group keys into named tables. Keys are ordered bytewise inside a
/// table, which lets callers build secondary indexes by encoding the sort
/// order into the key (for example a status byte followed by a big-endian
/// timestamp).
///
/// # Invariants
///
/// - `write_batch` is atomic: after a crash either all of its mutations are
///   visible or none are
/// - A successful return from a write means the data is durable for
///   persistent implementations
/// - `scan` returns rows in ascending key order
///
/// # Implementors
///
/// - [`super::InMemoryStore`] - For testing
/// - [`super::FileStore`] - For persistent storage
pub trait KvStore: Send + Sync {
    /// Reads the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn get(&self, table: &str, key: &[u8]) -> StorageResult<Option<Vec<u8>>>;

    /// Returns every row of `table` whose key falls in `range`, in key order.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    fn scan(&self, table: &str, range: &KeyRange) -> StorageResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Atomically applies every mutation in `batch`.
    ///
    /// # Errors
    ///
    /// Returns an error if the batch could not be made durable. In that
    /// case none of its mutations are visible.
    fn write_batch(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Removes every table and row.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be truncated.
    fn clear(&self) -> StorageResult<()>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(table, key, value);
        self.write_batch(batch)
    }

    /// Removes `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the write cannot be made durable.
    fn delete(&self, table: &str, key: &[u8]) -> StorageResult<()> {
        let mut batch = WriteBatch::new();
        batch.delete(table, key);
        self.write_batch(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_range() {
        let range = KeyRange::Prefix(vec![1, 2]);
        assert!(range.contains(&[1, 2]));
        assert!(range.contains(&[1, 2, 9]));
        assert!(!range.contains(&[1, 3]));
        assert!(!range.contains(&[1]));
    }

    #[test]
    fn before_range_is_exclusive() {
        let range = KeyRange::Before(vec![5]);
        assert!(range.contains(&[4, 255]));
        assert!(!range.contains(&[5]));
        assert!(!range.contains(&[5, 0]));
    }

    #[test]
    fn at_least_range_is_inclusive() {
        let range = KeyRange::AtLeast(vec![3]);
        assert!(range.contains(&[3]));
        assert!(range.contains(&[9, 0]));
        assert!(!range.contains(&[2, 255]));
        assert_eq!(range.lower_bound(), Some(&[3u8][..]));
    }

    #[test]
    fn between_range_is_half_open() {
        let range = KeyRange::Between(vec![2], vec![4]);
        assert!(range.contains(&[2]));
        assert!(range.contains(&[3, 9]));
        assert!(!range.contains(&[4]));
        assert!(!range.contains(&[1, 9]));
        assert_eq!(range.lower_bound(), Some(&[2u8][..]));
    }
}
