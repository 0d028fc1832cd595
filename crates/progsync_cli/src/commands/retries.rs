//! Retries command - show the persisted retry ledger.

use super::open;
use crate::Format;
use progsync_engine::PersistedRetry;
use serde::Serialize;
use std::path::Path;

/// The retry ledger contents.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetriesResult {
    /// Scheduled retries, soonest first.
    pub retries: Vec<PersistedRetry>,
}

/// Runs the retries command.
pub fn run(path: &Path, format: Format) -> Result<(), Box<dyn std::error::Error>> {
    let file = open(path)?;
    let mut retries = file.ledger.all()?;
    retries.sort_by_key(|retry| retry.scheduled_for);
    let result = RetriesResult { retries };

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        Format::Text => print_text_output(&result),
    }

    Ok(())
}

fn print_text_output(result: &RetriesResult) {
    println!("Scheduled Retries");
    println!("=================");
    println!();

    if result.retries.is_empty() {
        println!("(none)");
        return;
    }

    for retry in &result.retries {
        println!("{}", retry.operation_id);
        println!("  Due:        {}", retry.scheduled_for.format_short());
        println!("  Scheduled:  {}", retry.created_at.format_short());
    }
}
