//! Maintenance commands - requeue, cleanup, and clear.

use super::open;
use std::path::Path;

/// Returns every Failed operation to Pending.
pub fn requeue_failed(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let file = open(path)?;
    let revived = file.queue.requeue_failed()?;
    println!("Requeued {} failed operation(s)", revived);
    Ok(())
}

/// Deletes Completed and Failed operations older than `max_age_days`.
pub fn cleanup(path: &Path, max_age_days: u32) -> Result<(), Box<dyn std::error::Error>> {
    let file = open(path)?;
    let deleted = file.queue.cleanup(max_age_days)?;
    println!(
        "Deleted {} operation(s) older than {} day(s)",
        deleted, max_age_days
    );
    Ok(())
}

/// Deletes every queued operation and retry record.
pub fn clear(path: &Path, yes: bool) -> Result<(), Box<dyn std::error::Error>> {
    if !yes {
        return Err("Refusing to clear the queue without --yes".into());
    }

    let file = open(path)?;
    let total = file.queue.stats()?.total();
    file.queue.clear_all()?;
    file.ledger.clear()?;
    println!("Cleared {} operation(s)", total);
    Ok(())
}
