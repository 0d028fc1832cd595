//! Stats command - display record counts per status.

use super::{format_size, open};
use crate::Format;
use progsync_engine::QueueStats;
use serde::Serialize;
use std::path::Path;

/// Queue statistics.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResult {
    /// Path to the queue file.
    pub path: String,
    /// Device that owns the queue.
    pub device_id: String,
    /// Record counts per status.
    pub stats: QueueStats,
    /// Total records.
    pub total: usize,
    /// Retries waiting in the ledger.
    pub scheduled_retries: usize,
    /// Log size in bytes.
    pub log_size: u64,
}

/// Runs the stats command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let result = collect(path)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }

    Ok(())
}

fn collect(path: &Path) -> Result<StatsResult, Box<dyn std::error::Error>> {
    let file = open(path)?;
    let stats = file.queue.stats()?;
    Ok(StatsResult {
        path: path.display().to_string(),
        device_id: file.queue.device_id().to_string(),
        total: stats.total(),
        stats,
        scheduled_retries: file.ledger.all()?.len(),
        log_size: file.store.log_size(),
    })
}

fn print_text_output(result: &StatsResult) {
    println!("Queue Statistics");
    println!("================");
    println!();
    println!("Path:      {}", result.path);
    println!("Device:    {}", result.device_id);
    println!("Log size:  {}", format_size(result.log_size));
    println!();
    println!("Operations:");
    println!("  Pending:    {}", result.stats.pending);
    println!("  Completed:  {}", result.stats.completed);
    println!("  Failed:     {}", result.stats.failed);
    println!("  Manual:     {}", result.stats.manual);
    println!("  Total:      {}", result.total);
    println!();
    println!("Scheduled retries: {}", result.scheduled_retries);
}
