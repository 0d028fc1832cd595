//! Queued operation kinds and payloads.

use crate::error::{ProtocolError, ProtocolResult};
use crate::records::{CustomProblemRecord, ProgressRecord};
use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Kind of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperationKind {
    /// A problem was solved (or solved again).
    MarkSolved,
    /// Review dates for a problem changed.
    UpdateReviewDate,
    /// The user's difficulty rating changed.
    UpdateDifficulty,
    /// Notes on a problem changed.
    AddNote,
    /// A user-defined problem was created or edited.
    AddCustomProblem,
    /// A user-defined problem was deleted.
    DeleteProblem,
    /// Application settings changed.
    UpdateSettings,
}

impl OperationKind {
    /// Every kind, in declaration order.
    pub const ALL: [OperationKind; 7] = [
        OperationKind::MarkSolved,
        OperationKind::UpdateReviewDate,
        OperationKind::UpdateDifficulty,
        OperationKind::AddNote,
        OperationKind::AddCustomProblem,
        OperationKind::DeleteProblem,
        OperationKind::UpdateSettings,
    ];

    /// Returns the kind's name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::MarkSolved => "MarkSolved",
            OperationKind::UpdateReviewDate => "UpdateReviewDate",
            OperationKind::UpdateDifficulty => "UpdateDifficulty",
            OperationKind::AddNote => "AddNote",
            OperationKind::AddCustomProblem => "AddCustomProblem",
            OperationKind::DeleteProblem => "DeleteProblem",
            OperationKind::UpdateSettings => "UpdateSettings",
        }
    }

    /// Parses a kind from its name.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Returns the sync channel this kind is transmitted on.
    pub fn channel(&self) -> Channel {
        match self {
            OperationKind::MarkSolved
            | OperationKind::UpdateReviewDate
            | OperationKind::UpdateDifficulty
            | OperationKind::AddNote => Channel::Progress,
            OperationKind::AddCustomProblem | OperationKind::DeleteProblem => Channel::Custom,
            OperationKind::UpdateSettings => Channel::Settings,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Independent transmission channel for a group of operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Channel {
    /// Per-problem progress (solved state, reviews, difficulty, notes).
    Progress,
    /// User-defined problems.
    Custom,
    /// Application settings.
    Settings,
}

impl Channel {
    /// Every channel.
    pub const ALL: [Channel; 3] = [Channel::Progress, Channel::Custom, Channel::Settings];

    /// Returns the channel's tag, used for circuit breakers and logging.
    pub fn tag(&self) -> &'static str {
        match self {
            Channel::Progress => "progress",
            Channel::Custom => "custom",
            Channel::Settings => "settings",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Payload for [`Operation::MarkSolved`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkSolved {
    /// Problem identifier.
    pub problem_id: String,
    /// Local solve count after this solve.
    pub solve_count: u32,
    /// When the problem was solved.
    pub solved_at: Timestamp,
    /// Next scheduled review, if the client computed one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_review_at: Option<Timestamp>,
}

/// Payload for [`Operation::UpdateReviewDate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewDateUpdate {
    /// Problem identifier.
    pub problem_id: String,
    /// When the problem was last reviewed.
    pub last_reviewed_at: Timestamp,
    /// Next scheduled review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_review_at: Option<Timestamp>,
}

/// Payload for [`Operation::UpdateDifficulty`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DifficultyUpdate {
    /// Problem identifier.
    pub problem_id: String,
    /// Difficulty rating in `1..=5`.
    pub difficulty: u8,
}

/// Payload for [`Operation::AddNote`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteUpdate {
    /// Problem identifier.
    pub problem_id: String,
    /// Full note text (replaces the previous note).
    pub notes: String,
}

/// Payload for [`Operation::AddCustomProblem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomProblem {
    /// Problem identifier (client generated).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Link to the problem statement.
    pub url: String,
    /// Topic category.
    pub category: String,
    /// Solution pattern.
    pub pattern: String,
    /// Difficulty rating in `1..=5`.
    pub difficulty: u8,
}

/// Payload for [`Operation::DeleteProblem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDeletion {
    /// Problem identifier.
    pub problem_id: String,
}

/// Payload for [`Operation::UpdateSettings`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsUpdate {
    /// Changed settings, keyed by name.
    pub values: BTreeMap<String, Value>,
}

/// A single durable intent to mutate one entity.
///
/// Each variant carries its own strongly typed payload. On the wire (and at
/// rest) an operation is encoded as `{"type": "<Kind>", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Operation {
    /// A problem was solved.
    MarkSolved(MarkSolved),
    /// Review dates changed.
    UpdateReviewDate(ReviewDateUpdate),
    /// Difficulty rating changed.
    UpdateDifficulty(DifficultyUpdate),
    /// Notes changed.
    AddNote(NoteUpdate),
    /// A custom problem was created or edited.
    AddCustomProblem(CustomProblem),
    /// A custom problem was deleted.
    DeleteProblem(ProblemDeletion),
    /// Settings changed.
    UpdateSettings(SettingsUpdate),
}

impl Operation {
    /// Returns the operation kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::MarkSolved(_) => OperationKind::MarkSolved,
            Operation::UpdateReviewDate(_) => OperationKind::UpdateReviewDate,
            Operation::UpdateDifficulty(_) => OperationKind::UpdateDifficulty,
            Operation::AddNote(_) => OperationKind::AddNote,
            Operation::AddCustomProblem(_) => OperationKind::AddCustomProblem,
            Operation::DeleteProblem(_) => OperationKind::DeleteProblem,
            Operation::UpdateSettings(_) => OperationKind::UpdateSettings,
        }
    }

    /// Returns the channel this operation is transmitted on.
    pub fn channel(&self) -> Channel {
        self.kind().channel()
    }

    /// Returns the identifier of the entity this operation targets.
    ///
    /// Settings are a single entity, identified as `"settings"`.
    pub fn entity_id(&self) -> &str {
        match self {
            Operation::MarkSolved(p) => &p.problem_id,
            Operation::UpdateReviewDate(p) => &p.problem_id,
            Operation::UpdateDifficulty(p) => &p.problem_id,
            Operation::AddNote(p) => &p.problem_id,
            Operation::AddCustomProblem(p) => &p.id,
            Operation::DeleteProblem(p) => &p.problem_id,
            Operation::UpdateSettings(_) => "settings",
        }
    }

    /// Validates the payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidPayload`] describing the first problem.
    pub fn validate(&self) -> ProtocolResult<()> {
        let kind = self.kind().as_str();
        if self.entity_id().trim().is_empty() {
            return Err(ProtocolError::invalid(kind, "entity id is empty"));
        }

        match self {
            Operation::UpdateDifficulty(p) => check_difficulty(kind, p.difficulty),
            Operation::AddCustomProblem(p) => {
                if p.name.trim().is_empty() {
                    return Err(ProtocolError::invalid(kind, "name is empty"));
                }
                check_difficulty(kind, p.difficulty)
            }
            Operation::UpdateSettings(p) if p.values.is_empty() => {
                Err(ProtocolError::invalid(kind, "no settings changed"))
            }
            _ => Ok(()),
        }
    }

    /// Builds the local view of the problem's progress implied by this
    /// operation, or `None` for non-progress operations.
    ///
    /// Fields the operation does not touch keep their neutral values, so the
    /// conflict resolver merges them from the remote side.
    pub fn progress_record(&self, timestamp: Timestamp) -> Option<ProgressRecord> {
        let mut record = ProgressRecord::new(self.entity_id(), timestamp);
        match self {
            Operation::MarkSolved(p) => {
                record.solved = true;
                record.solve_count = p.solve_count;
                record.last_reviewed_at = Some(p.solved_at);
                record.next_review_at = p.next_review_at;
            }
            Operation::UpdateReviewDate(p) => {
                record.last_reviewed_at = Some(p.last_reviewed_at);
                record.next_review_at = p.next_review_at;
            }
            Operation::UpdateDifficulty(p) => record.difficulty = Some(p.difficulty),
            Operation::AddNote(p) => record.notes = Some(p.notes.clone()),
            _ => return None,
        }
        Some(record)
    }

    /// Builds the custom problem record carried by an
    /// [`Operation::AddCustomProblem`].
    pub fn custom_problem_record(&self, timestamp: Timestamp) -> Option<CustomProblemRecord> {
        match self {
            Operation::AddCustomProblem(p) => Some(CustomProblemRecord {
                id: p.id.clone(),
                name: p.name.clone(),
                url: p.url.clone(),
                category: p.category.clone(),
                pattern: p.pattern.clone(),
                difficulty: p.difficulty,
                timestamp,
            }),
            _ => None,
        }
    }
}

fn check_difficulty(kind: &'static str, difficulty: u8) -> ProtocolResult<()> {
    if (1..=5).contains(&difficulty) {
        Ok(())
    } else {
        Err(ProtocolError::invalid(
            kind,
            format!("difficulty {difficulty} outside 1..=5"),
        ))
    }
}

/// A type + entity key used to collapse repeated edits into one queued
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupeKey {
    /// Operation kind the key applies to.
    pub kind: OperationKind,
    /// Entity key within that kind.
    pub key: String,
}

impl DedupeKey {
    /// Creates a dedupe key.
    pub fn new(kind: OperationKind, key: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
        }
    }

    /// Derives the natural dedupe key of an operation: its kind and entity.
    pub fn for_operation(operation: &Operation) -> Self {
        Self::new(operation.kind(), operation.entity_id())
    }

    /// Returns the key as stored in the dedupe index.
    pub fn storage_key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.key)
    }
}
