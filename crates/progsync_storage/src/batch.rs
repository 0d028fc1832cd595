//! Atomic write batches.

use serde::{Deserialize, Serialize};

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Insert or replace a value.
    Put {
        /// Table name.
        table: String,
        /// Row key.
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
        /// Row value.
        #[serde(with = "serde_bytes")]
        value: Vec<u8>,
    },
    /// Remove a value.
    Delete {
        /// Table name.
        table: String,
        /// Row key.
        #[serde(with = "serde_bytes")]
        key: Vec<u8>,
    },
}

/// An ordered group of mutations committed atomically.
///
/// Mutations are applied in insertion order, so a put followed by a delete
/// of the same key leaves the key absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteBatch {
    mutations: Vec<Mutation>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a put.
    pub fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> &mut Self {
        self.mutations.push(Mutation::Put {
            table: table.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        self
    }

    /// Queues a delete.
    pub fn delete(&mut self, table: &str, key: &[u8]) -> &mut Self {
        self.mutations.push(Mutation::Delete {
            table: table.to_string(),
            key: key.to_vec(),
        });
        self
    }

    /// Returns the queued mutations.
    #[must_use]
    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Returns the number of queued mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}
