//! Error types for protocol operations.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while validating or encoding protocol data.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A payload failed validation.
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload {
        /// Operation kind being validated.
        kind: &'static str,
        /// What was wrong.
        reason: String,
    },
}

impl ProtocolError {
    /// Creates an invalid payload error.
    pub fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_payload_display() {
        let err = ProtocolError::invalid("AddNote", "problem id is empty");
        assert_eq!(err.to_string(), "invalid AddNote payload: problem id is empty");
    }
}
