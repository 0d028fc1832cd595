//! # progsync Protocol
//!
//! Operation types, wire messages, and conflict resolution for progsync.
//!
//! This crate provides:
//! - [`Operation`], the tagged union over every queued mutation kind
//! - Entity records ([`ProgressRecord`], [`CustomProblemRecord`],
//!   [`SettingsRecord`]) as exchanged with the remote authority
//! - Wire messages for the REST contract, encoded as JSON
//! - The field-level conflict resolver
//!
//! This is a pure crate with no I/O operations. Everything that needs the
//! current time takes it as an argument.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod messages;
mod operation;
mod records;
mod time;

pub use conflict::{
    describe_conflict, jaccard_similarity, next_review_at, requires_manual_resolution,
    resolve_custom_conflict, resolve_progress_conflict, resolve_settings_conflict,
    ConflictFields, FieldDiff, Resolution, ResolutionStatus, REVIEW_INTERVAL_DAYS,
};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    decode_json, encode_json, EntityWrite, ProgressBatchRequest, ProgressBatchResponse,
    ProgressConflict, ProgressEntry, CLIENT_VERSION,
};
pub use operation::{
    Channel, CustomProblem, DedupeKey, DifficultyUpdate, MarkSolved, NoteUpdate, Operation,
    OperationKind, ProblemDeletion, ReviewDateUpdate, SettingsUpdate,
};
pub use records::{CustomProblemRecord, ProgressRecord, SettingsRecord};
pub use time::Timestamp;
