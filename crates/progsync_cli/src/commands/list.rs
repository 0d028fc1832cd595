//! List command - show queued operations.

use super::open;
use crate::Format;
use progsync_engine::{OperationStatus, QueuedOperation};
use serde::Serialize;
use std::path::Path;

/// One listed operation.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListedOperation {
    /// Operation id.
    pub id: String,
    /// Operation kind.
    pub kind: String,
    /// Targeted entity.
    pub entity_id: String,
    /// Lifecycle status.
    pub status: String,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Logical write time.
    pub timestamp: String,
    /// Failure reason, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&QueuedOperation> for ListedOperation {
    fn from(record: &QueuedOperation) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind().to_string(),
            entity_id: record.entity_id().to_string(),
            status: record.status.as_str().to_string(),
            retry_count: record.retry_count,
            timestamp: record.timestamp.format_short(),
            error: record.error_message.clone(),
        }
    }
}

/// Runs the list command.
pub fn run(
    path: &Path,
    status: Option<OperationStatus>,
    format: Format,
) -> Result<(), Box<dyn std::error::Error>> {
    let listed = collect(path, status)?;

    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(&listed)?),
        Format::Text => print_text_output(&listed),
    }

    Ok(())
}

fn collect(
    path: &Path,
    status: Option<OperationStatus>,
) -> Result<Vec<ListedOperation>, Box<dyn std::error::Error>> {
    let file = open(path)?;
    let records = match status {
        Some(status) => file.queue.list_by_status(status)?,
        None => {
            let mut all = Vec::new();
            for status in OperationStatus::ALL {
                all.extend(file.queue.list_by_status(status)?);
            }
            all.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
            all
        }
    };
    Ok(records.iter().map(ListedOperation::from).collect())
}

fn print_text_output(listed: &[ListedOperation]) {
    println!("Queued Operations");
    println!("=================");
    println!();

    if listed.is_empty() {
        println!("(none)");
        return;
    }

    for op in listed {
        println!("{}  {}", op.id, op.timestamp);
        println!("  Kind:     {}", op.kind);
        println!("  Entity:   {}", op.entity_id);
        println!("  Status:   {}", op.status);
        println!("  Retries:  {}", op.retry_count);
        if let Some(error) = &op.error {
            println!("  Error:    {}", error);
        }
    }
    println!();
    println!("{} operation(s)", listed.len());
}
