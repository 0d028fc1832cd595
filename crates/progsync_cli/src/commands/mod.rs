//! CLI command implementations.

pub mod compact;
pub mod list;
pub mod maintenance;
pub mod retries;
pub mod stats;

use progsync_engine::{OperationQueue, RetryLedger, SystemClock};
use progsync_storage::FileStore;
use std::path::Path;
use std::sync::Arc;

/// A queue file opened for maintenance.
pub struct QueueFile {
    /// The underlying store.
    pub store: Arc<FileStore>,
    /// The operation queue.
    pub queue: OperationQueue,
    /// The persisted retry ledger.
    pub ledger: RetryLedger,
}

/// Opens an existing queue file.
pub fn open(path: &Path) -> Result<QueueFile, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No queue found at {}", path.display()).into());
    }

    let store = Arc::new(FileStore::open(path)?);
    let queue = OperationQueue::open(store.clone(), Arc::new(SystemClock))?;
    let ledger = RetryLedger::new(store.clone());
    tracing::debug!(path = %path.display(), device_id = queue.device_id(), "opened queue");
    Ok(QueueFile {
        store,
        queue,
        ledger,
    })
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} bytes", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
