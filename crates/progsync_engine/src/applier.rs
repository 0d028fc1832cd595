//! Local application of resolved conflict data.

use crate::error::SyncResult;
use parking_lot::RwLock;
use progsync_protocol::{CustomProblemRecord, ProgressRecord, SettingsRecord};
use std::collections::HashMap;

/// Writes resolved data back into the application's local state.
///
/// The engine calls this after a conflict has been merged and the merged
/// version has been accepted by the remote, so both sides converge.
pub trait ConflictApplier: Send + Sync {
    /// Applies a merged progress record.
    fn apply_progress(&self, record: &ProgressRecord) -> SyncResult<()>;

    /// Applies the winning version of a custom problem.
    fn apply_custom_problem(&self, record: &CustomProblemRecord) -> SyncResult<()>;

    /// Applies the winning settings.
    fn apply_settings(&self, record: &SettingsRecord) -> SyncResult<()>;
}

/// An in-memory applier for testing.
#[derive(Debug, Default)]
pub struct MemoryApplier {
    progress: RwLock<HashMap<String, ProgressRecord>>,
    custom: RwLock<HashMap<String, CustomProblemRecord>>,
    settings: RwLock<Option<SettingsRecord>>,
}

impl MemoryApplier {
    /// Creates an empty applier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the applied progress for a problem.
    pub fn progress(&self, problem_id: &str) -> Option<ProgressRecord> {
        self.progress.read().get(problem_id).cloned()
    }

    /// Returns the applied custom problem.
    pub fn custom_problem(&self, id: &str) -> Option<CustomProblemRecord> {
        self.custom.read().get(id).cloned()
    }

    /// Returns the applied settings.
    pub fn settings(&self) -> Option<SettingsRecord> {
        self.settings.read().clone()
    }
}

impl ConflictApplier for MemoryApplier {
    fn apply_progress(&self, record: &ProgressRecord) -> SyncResult<()> {
        self.progress
            .write()
            .insert(record.problem_id.clone(), record.clone());
        Ok(())
    }

    fn apply_custom_problem(&self, record: &CustomProblemRecord) -> SyncResult<()> {
        self.custom.write().insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn apply_settings(&self, record: &SettingsRecord) -> SyncResult<()> {
        *self.settings.write() = Some(record.clone());
        Ok(())
    }
}
