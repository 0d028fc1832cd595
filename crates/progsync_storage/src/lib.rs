//! # progsync Storage
//!
//! Key-value persistence capability and stores for progsync.
//!
//! This crate provides the lowest-level storage abstraction used by the
//! operation queue and the retry ledger. Stores are **ordered table maps**:
//! they know nothing about operations, retries, or the sync protocol.
//!
//! ## Design Principles
//!
//! - Keys and values are opaque bytes, grouped into named tables
//! - Keys within a table are kept in byte order, so secondary indexes are
//!   just tables with carefully constructed keys
//! - A [`WriteBatch`] commits atomically: either every mutation lands or none
//! - Stores must be `Send + Sync` and are shared behind `Arc`
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For testing and ephemeral queues
//! - [`FileStore`] - Append-only, checksummed log that survives restarts
//!
//! ## Example
//!
//! ```rust
//! use progsync_storage::{InMemoryStore, KeyRange, KvStore};
//!
//! let store = InMemoryStore::new();
//! store.put("notes", b"a", b"first").unwrap();
//! store.put("notes", b"b", b"second").unwrap();
//! let rows = store.scan("notes", &KeyRange::All).unwrap();
//! assert_eq!(rows.len(), 2);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod error;
mod file;
mod memory;
mod store;

pub use batch::{Mutation, WriteBatch};
pub use error::{StorageError, StorageResult};
pub use file::{FileStore, FileStoreConfig};
pub use memory::InMemoryStore;
pub use store::{KeyRange, KvStore};
