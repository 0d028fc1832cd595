//! Error types for the sync engine.

use progsync_protocol::ProtocolError;
use progsync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Coarse classification of a [`SyncError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Network unreachable, timeout, or a server-side failure.
    TransientNetwork,
    /// Credentials missing, expired, or rejected.
    AuthRequired,
    /// The remote holds a different version of the entity.
    Conflict,
    /// The local store failed.
    Persistence,
    /// The remote rejected the payload as invalid.
    Validation,
    /// A conflict that needs a human decision.
    ManualResolutionRequired,
    /// No such operation.
    NotFound,
    /// Status change not allowed from the current status.
    InvalidTransition,
    /// A record or message could not be encoded or decoded.
    Codec,
    /// A deadline elapsed.
    Timeout,
    /// The work was cancelled.
    Cancelled,
    /// The device is offline.
    Offline,
}

/// Errors that can occur during queueing and sync.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or server failure that may succeed later.
    #[error("network error: {0}")]
    TransientNetwork(String),

    /// Authentication is required before syncing can continue.
    #[error("authentication required (status {status})")]
    AuthRequired {
        /// HTTP status that triggered the failure.
        status: u16,
    },

    /// The remote answered with a conflict.
    #[error("conflict on {entity_id}")]
    Conflict {
        /// Entity in conflict.
        entity_id: String,
        /// Raw response body carrying the server's version.
        body: Vec<u8>,
    },

    /// The local store failed.
    #[error("persistence failure: {0}")]
    Persistence(#[from] StorageError),

    /// The payload was rejected as invalid.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The conflict cannot be merged automatically.
    #[error("manual resolution required: {0}")]
    ManualResolutionRequired(String),

    /// No operation with this id.
    #[error("operation not found: {0}")]
    NotFound(String),

    /// Status change not allowed.
    #[error("invalid transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        /// Operation id.
        id: String,
        /// Current status.
        from: &'static str,
        /// Requested status.
        to: &'static str,
    },

    /// Encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// A deadline elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The work was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The device is offline.
    #[error("device is offline")]
    Offline,
}

impl SyncError {
    /// Returns the error's classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::TransientNetwork(_) => ErrorKind::TransientNetwork,
            SyncError::AuthRequired { .. } => ErrorKind::AuthRequired,
            SyncError::Conflict { .. } => ErrorKind::Conflict,
            SyncError::Persistence(_) => ErrorKind::Persistence,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::ManualResolutionRequired(_) => ErrorKind::ManualResolutionRequired,
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            SyncError::Codec(_) => ErrorKind::Codec,
            SyncError::Timeout => ErrorKind::Timeout,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Offline => ErrorKind::Offline,
        }
    }

    /// Returns true if a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::TransientNetwork(_)
                | SyncError::AuthRequired { .. }
                | SyncError::Conflict { .. }
                | SyncError::Timeout
                | SyncError::Offline
        )
    }

    /// Returns true if a failed attempt with this error consumes one of the
    /// operation's retries.
    ///
    /// Auth failures wait for the user to sign in, and offline or cancelled
    /// attempts never reached the remote.
    pub fn counts_against_retry_budget(&self) -> bool {
        self.is_retryable()
            && !matches!(
                self,
                SyncError::AuthRequired { .. } | SyncError::Offline | SyncError::Cancelled
            )
    }

    pub(crate) fn codec(err: impl std::fmt::Display) -> Self {
        SyncError::Codec(err.to_string())
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidPayload { .. } => SyncError::Validation(err.to_string()),
            ProtocolError::Json(_) => SyncError::Codec(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::TransientNetwork("connection reset".into()).is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::AuthRequired { status: 401 }.is_retryable());
        assert!(!SyncError::Validation("bad".into()).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Persistence(StorageError::WriteRejected("full".into())).is_retryable());
    }

    #[test]
    fn auth_does_not_consume_retries() {
        assert!(!SyncError::AuthRequired { status: 403 }.counts_against_retry_budget());
        assert!(!SyncError::Offline.counts_against_retry_budget());
        assert!(SyncError::TransientNetwork("503".into()).counts_against_retry_budget());
        assert!(SyncError::Conflict {
            entity_id: "p1".into(),
            body: Vec::new()
        }
        .counts_against_retry_budget());
    }

    #[test]
    fn protocol_errors_map_to_kinds() {
        let err: SyncError = ProtocolError::invalid("AddNote", "entity id is empty").into();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let json = serde_json::from_str::<u32>("nope").unwrap_err();
        let err: SyncError = ProtocolError::from(json).into();
        assert_eq!(err.kind(), ErrorKind::Codec);
    }

    #[test]
    fn error_display() {
        let err = SyncError::InvalidTransition {
            id: "op-1".into(),
            from: "Completed",
            to: "Pending",
        };
        assert_eq!(
            err.to_string(),
            "invalid transition for operation op-1: Completed -> Pending"
        );
        assert_eq!(SyncError::Offline.to_string(), "device is offline");
    }
}
