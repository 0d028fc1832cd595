//! Wire messages for the remote REST contract.
//!
//! All bodies are JSON with camelCase field names.

use crate::error::ProtocolResult;
use crate::operation::Operation;
use crate::records::ProgressRecord;
use crate::time::Timestamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Client version reported to the remote authority.
pub const CLIENT_VERSION: &str = concat!("progsync/", env!("CARGO_PKG_VERSION"));

/// One progress operation inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    /// Problem the operation targets.
    pub entity_id: String,
    /// The operation itself.
    pub operation: Operation,
    /// Logical write time.
    pub timestamp: Timestamp,
    /// Originating device.
    pub device_id: String,
}

/// Body of a batch progress sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressBatchRequest {
    /// Operations, oldest first.
    pub operations: Vec<ProgressEntry>,
    /// Sending client version.
    pub client_version: String,
}

impl ProgressBatchRequest {
    /// Creates a batch tagged with this client's version.
    pub fn new(operations: Vec<ProgressEntry>) -> Self {
        Self {
            operations,
            client_version: CLIENT_VERSION.to_string(),
        }
    }
}

/// A per-entity conflict reported by a successful batch sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressConflict {
    /// Problem in conflict.
    pub entity_id: String,
    /// The client's version as the server understood it.
    pub client_data: ProgressRecord,
    /// The server's current version.
    pub server_data: ProgressRecord,
}

/// Response to a batch progress sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressBatchResponse {
    /// Conflicting entities; empty when everything was accepted.
    #[serde(default)]
    pub conflicts: Vec<ProgressConflict>,
}

/// Body of a single-entity write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityWrite<T> {
    /// The entity data.
    pub data: T,
    /// Originating device.
    pub device_id: String,
    /// Sending client version.
    pub client_version: String,
}

impl<T> EntityWrite<T> {
    /// Wraps entity data for transmission.
    pub fn new(data: T, device_id: impl Into<String>) -> Self {
        Self {
            data,
            device_id: device_id.into(),
            client_version: CLIENT_VERSION.to_string(),
        }
    }
}

/// Encodes a message as JSON bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json<T: Serialize>(value: &T) -> ProtocolResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// Decodes a message from JSON bytes.
///
/// An empty body decodes as `{}`, so types with defaults for every field
/// (such as [`ProgressBatchResponse`]) accept it.
///
/// # Errors
///
/// Returns an error if the bytes are not a valid encoding of `T`.
pub fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(serde_json::from_value(serde_json::Value::Object(
            serde_json::Map::new(),
        ))?);
    }
    Ok(serde_json::from_slice(bytes)?)
}
