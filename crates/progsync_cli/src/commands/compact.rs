//! Compact command - rewrite the queue log.

use super::{format_size, open};
use std::path::Path;

/// Runs the compact command.
pub fn run(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let file = open(path)?;

    let before = file.store.log_size();
    file.store.compact()?;
    let after = file.store.log_size();

    println!("Compaction Complete");
    println!("===================");
    println!();
    println!("Before:  {}", format_size(before));
    println!("After:   {}", format_size(after));
    if before > after {
        println!("Saved:   {}", format_size(before - after));
    }

    Ok(())
}
