//! Entity records exchanged with the remote authority.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A user's progress on one problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    /// Problem identifier.
    pub problem_id: String,
    /// Whether the problem has been solved at least once.
    #[serde(default)]
    pub solved: bool,
    /// Number of times the problem was solved.
    #[serde(default)]
    pub solve_count: u32,
    /// Most recent review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed_at: Option<Timestamp>,
    /// Next scheduled review.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_review_at: Option<Timestamp>,
    /// Difficulty rating in `1..=5`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<u8>,
    /// Free-text notes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Logical write time of this version.
    pub timestamp: Timestamp,
}

impl ProgressRecord {
    /// Creates an empty record for a problem.
    pub fn new(problem_id: impl Into<String>, timestamp: Timestamp) -> Self {
        Self {
            problem_id: problem_id.into(),
            solved: false,
            solve_count: 0,
            last_reviewed_at: None,
            next_review_at: None,
            difficulty: None,
            notes: None,
            timestamp,
        }
    }
}

/// A user-defined problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomProblemRecord {
    /// Problem identifier.
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
    /// Logical write time of this version.
    pub timestamp: Timestamp,
}

/// The user's application settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsRecord {
    /// Settings keyed by name.
    pub values: BTreeMap<String, Value>,
    /// Logical write time of this version.
    pub timestamp: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_record_tolerates_missing_fields() {
        let json = r#"{"problemId":"p1","solveCount":2,"timestamp":10}"#;
        let record: ProgressRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.solve_count, 2);
        assert!(!record.solved);
        assert_eq!(record.notes, None);
    }

    #[test]
    fn progress_record_omits_empty_optionals() {
        let record = ProgressRecord::new("p1", Timestamp::from_millis(1));
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("notes").is_none());
        assert_eq!(json["problemId"], "p1");
    }
}
