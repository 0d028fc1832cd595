//! Conflict detection and resolution.
//!
//! Every entry point is a pure function of its inputs: nothing here reads
//! the clock or touches shared state. Callers pass `now` explicitly.

use crate::records::{CustomProblemRecord, ProgressRecord, SettingsRecord};
use crate::time::Timestamp;
use std::collections::HashSet;

/// Spaced-repetition intervals in days, indexed by `min(solve_count, 5)`.
pub const REVIEW_INTERVAL_DAYS: [i64; 6] = [1, 3, 7, 14, 30, 60];

/// Notes whose token similarity falls below this need a human.
const NOTES_SIMILARITY_THRESHOLD: f64 = 0.5;

/// Difficulty ratings further apart than this need a human.
const MAX_AUTO_MERGE_DIFFICULTY_GAP: u8 = 2;

/// Status of a [`Resolution`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStatus {
    /// Merged automatically.
    Resolved,
    /// Needs a human decision.
    Manual,
    /// The inputs could not be reconciled at all.
    Error,
}

/// Outcome of a conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    /// Resolved data to keep on both sides.
    Resolved(T),
    /// Escalate to manual resolution with an explanation.
    Manual(String),
    /// Resolution failed.
    Error(String),
}

impl<T> Resolution<T> {
    /// Returns the status tag.
    pub fn status(&self) -> ResolutionStatus {
        match self {
            Resolution::Resolved(_) => ResolutionStatus::Resolved,
            Resolution::Manual(_) => ResolutionStatus::Manual,
            Resolution::Error(_) => ResolutionStatus::Error,
        }
    }

    /// Returns the resolved data, if any.
    pub fn data(&self) -> Option<&T> {
        match self {
            Resolution::Resolved(data) => Some(data),
            _ => None,
        }
    }

    /// Returns the message of a manual or failed resolution.
    pub fn message(&self) -> Option<&str> {
        match self {
            Resolution::Manual(message) | Resolution::Error(message) => Some(message),
            Resolution::Resolved(_) => None,
        }
    }
}

/// Resolves a progress conflict.
///
/// Equal timestamps mean the two sides are the same write, so the remote
/// version is returned unchanged. Otherwise the fields are merged:
///
/// - `solved`: either side solved it
/// - `solve_count`: sum of both sides
/// - `last_reviewed_at`: the later review
/// - `next_review_at`: recomputed from the merged review and solve count
/// - `difficulty`: recency-weighted average, rounded and clamped to `1..=5`
/// - `notes`: both kept under dated headers when they differ
///
/// The merged record is stamped with `now`.
pub fn resolve_progress_conflict(
    local: &ProgressRecord,
    remote: &ProgressRecord,
    now: Timestamp,
) -> Resolution<ProgressRecord> {
    if local.problem_id != remote.problem_id {
        return Resolution::Error(format!(
            "cannot merge progress for different problems: {} vs {}",
            local.problem_id, remote.problem_id
        ));
    }

    if local.timestamp == remote.timestamp {
        return Resolution::Resolved(remote.clone());
    }

    let solve_count = local.solve_count.saturating_add(remote.solve_count);
    let last_reviewed_at = local.last_reviewed_at.max(remote.last_reviewed_at);

    Resolution::Resolved(ProgressRecord {
        problem_id: local.problem_id.clone(),
        solved: local.solved || remote.solved,
        solve_count,
        last_reviewed_at,
        next_review_at: last_reviewed_at.map(|reviewed| next_review_at(reviewed, solve_count)),
        difficulty: merge_difficulty(local, remote, now),
        notes: merge_notes(local, remote),
        timestamp: now,
    })
}

/// Computes the next review from a review time and solve count.
pub fn next_review_at(last_reviewed_at: Timestamp, solve_count: u32) -> Timestamp {
    let index = (solve_count as usize).min(REVIEW_INTERVAL_DAYS.len() - 1);
    last_reviewed_at.plus_days(REVIEW_INTERVAL_DAYS[index])
}

fn merge_difficulty(local: &ProgressRecord, remote: &ProgressRecord, now: Timestamp) -> Option<u8> {
    match (local.difficulty, remote.difficulty) {
        (Some(l), Some(r)) => {
            let local_age = now.as_millis().saturating_sub(local.timestamp.as_millis()).max(0) as f64;
            let remote_age = now.as_millis().saturating_sub(remote.timestamp.as_millis()).max(0) as f64;
            let total = local_age + remote_age;

            // Each side is weighted by the other side's age, so the fresher
            // edit dominates.
            let value = if total > 0.0 {
                f64::from(l) * (remote_age / total) + f64::from(r) * (local_age / total)
            } else {
                (f64::from(l) + f64::from(r)) / 2.0
            };
            Some(value.round().clamp(1.0, 5.0) as u8)
        }
        (Some(d), None) | (None, Some(d)) => Some(d.clamp(1, 5)),
        (None, None) => None,
    }
}

fn merge_notes(local: &ProgressRecord, remote: &ProgressRecord) -> Option<String> {
    let local_notes = non_blank(local.notes.as_deref());
    let remote_notes = non_blank(remote.notes.as_deref());

    match (local_notes, remote_notes) {
        (Some(l), Some(r)) if l.trim() == r.trim() => Some(l.to_string()),
        (Some(l), Some(r)) => Some(format!(
            "--- Local ({}) ---\n{}\n\n--- Remote ({}) ---\n{}",
            local.timestamp.format_short(),
            l,
            remote.timestamp.format_short(),
            r
        )),
        (Some(n), None) | (None, Some(n)) => Some(n.to_string()),
        (None, None) => None,
    }
}

fn non_blank(notes: Option<&str>) -> Option<&str> {
    notes.filter(|n| !n.trim().is_empty())
}

/// Resolves a custom problem conflict.
///
/// A rename combined with at least two other changed classification fields
/// (category, pattern, difficulty) is treated as a different problem and
/// escalated. Anything else is last-write-wins, ties going to the remote.
pub fn resolve_custom_conflict(
    local: &CustomProblemRecord,
    remote: &CustomProblemRecord,
) -> Resolution<CustomProblemRecord> {
    if local.id != remote.id {
        return Resolution::Error(format!(
            "cannot merge different custom problems: {} vs {}",
            local.id, remote.id
        ));
    }

    let name_differs = local.name != remote.name;
    let other_changes = [
        local.category != remote.category,
        local.pattern != remote.pattern,
        local.difficulty != remote.difficulty,
    ]
    .into_iter()
    .filter(|changed| *changed)
    .count();

    if name_differs && other_changes >= 2 {
        return Resolution::Manual(format!(
            "custom problem {} was edited on two devices: {}",
            local.id,
            describe_conflict(local, remote)
        ));
    }

    if local.timestamp > remote.timestamp {
        Resolution::Resolved(local.clone())
    } else {
        Resolution::Resolved(remote.clone())
    }
}

/// Resolves a settings conflict by last-write-wins, ties going to the
/// remote.
pub fn resolve_settings_conflict(
    local: &SettingsRecord,
    remote: &SettingsRecord,
) -> Resolution<SettingsRecord> {
    if local.timestamp > remote.timestamp {
        Resolution::Resolved(local.clone())
    } else {
        Resolution::Resolved(remote.clone())
    }
}

/// Returns true if two progress versions should not be auto-merged.
///
/// Averaging is meaningless when the notes say different things (token
/// Jaccard similarity below 0.5) or the difficulty ratings are more than
/// two points apart. Notes present on only one side are not a conflict: the
/// merge keeps them.
pub fn requires_manual_resolution(local: &ProgressRecord, remote: &ProgressRecord) -> bool {
    if let (Some(l), Some(r)) = (
        non_blank(local.notes.as_deref()),
        non_blank(remote.notes.as_deref()),
    ) {
        if jaccard_similarity(l, r) < NOTES_SIMILARITY_THRESHOLD {
            return true;
        }
    }

    if let (Some(l), Some(r)) = (local.difficulty, remote.difficulty) {
        if l.abs_diff(r) > MAX_AUTO_MERGE_DIFFICULTY_GAP {
            return true;
        }
    }

    false
}

/// Token-set Jaccard similarity of two texts, in `0.0..=1.0`.
///
/// Tokens are lowercase alphanumeric runs. Two texts without any tokens are
/// identical.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let a = tokens(a);
    let b = tokens(b);
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    intersection as f64 / union as f64
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// One differing field between two versions of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDiff {
    /// Field name as shown to users.
    pub field: &'static str,
    /// Local value, rendered.
    pub local: String,
    /// Remote value, rendered.
    pub remote: String,
}

/// Entities that can enumerate their differing fields.
pub trait ConflictFields {
    /// Returns every field that differs between `self` (local) and `other`
    /// (remote). Timestamps are bookkeeping and never listed.
    fn field_diffs(&self, other: &Self) -> Vec<FieldDiff>;
}

/// Describes every differing field, for manual-resolution surfaces.
///
/// Returns `"Unknown conflict"` when nothing differs.
pub fn describe_conflict<T: ConflictFields>(local: &T, remote: &T) -> String {
    let diffs = local.field_diffs(remote);
    if diffs.is_empty() {
        return "Unknown conflict".to_string();
    }
    diffs
        .iter()
        .map(|d| format!("{}: local={}, remote={}", d.field, d.local, d.remote))
        .collect::<Vec<_>>()
        .join("; ")
}

fn push_diff<V: PartialEq>(
    diffs: &mut Vec<FieldDiff>,
    field: &'static str,
    local: &V,
    remote: &V,
    render: impl Fn(&V) -> String,
) {
    if local != remote {
        diffs.push(FieldDiff {
            field,
            local: render(local),
            remote: render(remote),
        });
    }
}

fn render_opt_ts(value: &Option<Timestamp>) -> String {
    value.map_or_else(|| "none".to_string(), Timestamp::format_short)
}

fn render_opt<V: ToString>(value: &Option<V>) -> String {
    value.as_ref().map_or_else(|| "none".to_string(), |v| format!("{:?}", v.to_string()))
}

impl ConflictFields for ProgressRecord {
    fn field_diffs(&self, other: &Self) -> Vec<FieldDiff> {
        let mut diffs = Vec::new();
        push_diff(&mut diffs, "solved", &self.solved, &other.solved, bool::to_string);
        push_diff(&mut diffs, "solveCount", &self.solve_count, &other.solve_count, u32::to_string);
        push_diff(&mut diffs, "lastReviewedAt", &self.last_reviewed_at, &other.last_reviewed_at, render_opt_ts);
        push_diff(&mut diffs, "nextReviewAt", &self.next_review_at, &other.next_review_at, render_opt_ts);
        push_diff(&mut diffs, "difficulty", &self.difficulty, &other.difficulty, |d| {
            d.map_or_else(|| "none".to_string(), |d| d.to_string())
        });
        push_diff(&mut diffs, "notes", &self.notes, &other.notes, render_opt);
        diffs
    }
}

impl ConflictFields for CustomProblemRecord {
    fn field_diffs(&self, other: &Self) -> Vec<FieldDiff> {
        let quoted = |s: &String| format!("{s:?}");
        let mut diffs = Vec::new();
        push_diff(&mut diffs, "name", &self.name, &other.name, quoted);
        push_diff(&mut diffs, "url", &self.url, &other.url, quoted);
        push_diff(&mut diffs, "category", &self.category, &other.category, quoted);
        push_diff(&mut diffs, "pattern", &self.pattern, &other.pattern, quoted);
        push_diff(&mut diffs, "difficulty", &self.difficulty, &other.difficulty, u8::to_string);
        diffs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const DAY: i64 = 24 * 60 * 60 * 1000;

    fn progress(solve_count: u32, timestamp: i64) -> ProgressRecord {
        let mut record = ProgressRecord::new("p1", Timestamp::from_millis(timestamp));
        record.solve_count = solve_count;
        record
    }

    fn custom(name: &str, category: &str, pattern: &str, difficulty: u8, ts: i64) -> CustomProblemRecord {
        CustomProblemRecord {
            id: "c1".into(),
            name: name.into(),
            url: "https://example.com/c1".into(),
            category: category.into(),
            pattern: pattern.into(),
            difficulty,
            timestamp: Timestamp::from_millis(ts),
        }
    }

    #[test]
    fn equal_timestamps_keep_remote() {
        let local = progress(1, 100);
        let mut remote = progress(5, 100);
        remote.notes = Some("server".into());

        let resolution = resolve_progress_conflict(&local, &remote, Timestamp::from_millis(500));
        assert_eq!(resolution, Resolution::Resolved(remote));
    }

    #[test]
    fn merge_sums_counts_and_ors_solved() {
        let mut local = progress(1, 100);
        local.solved = true;
        let remote = progress(2, 200);

        let now = Timestamp::from_millis(1_000);
        let merged = resolve_progress_conflict(&local, &remote, now);
        let merged = merged.data().unwrap();
        assert!(merged.solved);
        assert_eq!(merged.solve_count, 3);
        assert_eq!(merged.timestamp, now);
    }

    #[test]
    fn next_review_uses_interval_table() {
        let mut local = progress(1, 100);
        local.last_reviewed_at = Some(Timestamp::from_millis(10 * DAY));
        let mut remote = progress(1, 200);
        remote.last_reviewed_at = Some(Timestamp::from_millis(12 * DAY));

        let merged = resolve_progress_conflict(&local, &remote, Timestamp::from_millis(300));
        let merged = merged.data().unwrap();
        assert_eq!(merged.last_reviewed_at, Some(Timestamp::from_millis(12 * DAY)));
        // solve count 2 -> 7 days
        assert_eq!(merged.next_review_at, Some(Timestamp::from_millis(19 * DAY)));
    }

    #[test]
    fn next_review_interval_saturates() {
        let base = Timestamp::from_millis(0);
        assert_eq!(next_review_at(base, 0), base.plus_days(1));
        assert_eq!(next_review_at(base, 5), base.plus_days(60));
        assert_eq!(next_review_at(base, 50), base.plus_days(60));
    }

    #[test]
    fn no_review_means_no_next_review() {
        let merged = resolve_progress_conflict(&progress(1, 1), &progress(1, 2), Timestamp::from_millis(3));
        assert_eq!(merged.data().unwrap().next_review_at, None);
    }

    #[test]
    fn difficulty_favors_fresher_edit() {
        let mut local = progress(0, 9_000);
        local.difficulty = Some(5);
        let mut remote = progress(0, 0);
        remote.difficulty = Some(1);

        // local age 1s, remote age 10s -> local weight 10/11
        let merged = resolve_progress_conflict(&local, &remote, Timestamp::from_millis(10_000));
        assert_eq!(merged.data().unwrap().difficulty, Some(5));
    }

    #[test]
    fn difficulty_from_one_side() {
        let mut local = progress(0, 1);
        local.difficulty = Some(3);
        let merged = resolve_progress_conflict(&local, &progress(0, 2), Timestamp::from_millis(3));
        assert_eq!(merged.data().unwrap().difficulty, Some(3));
    }

    #[test]
    fn differing_notes_are_both_kept() {
        let mut local = progress(0, 0);
        local.notes = Some("use two pointers".into());
        let mut remote = progress(0, DAY);
        remote.notes = Some("sliding window".into());

        let merged = resolve_progress_conflict(&local, &remote, Timestamp::from_millis(2 * DAY));
        let notes = merged.data().unwrap().notes.clone().unwrap();
        assert!(notes.contains("--- Local (1970-01-01 00:00 UTC) ---\nuse two pointers"));
        assert!(notes.contains("--- Remote (1970-01-02 00:00 UTC) ---\nsliding window"));
    }

    #[test]
    fn single_sided_notes_win() {
        let mut remote = progress(0, 2);
        remote.notes = Some("remote only".into());
        let merged = resolve_progress_conflict(&progress(0, 1), &remote, Timestamp::from_millis(3));
        assert_eq!(merged.data().unwrap().notes.as_deref(), Some("remote only"));
    }

    #[test]
    fn identical_notes_are_not_duplicated() {
        let mut local = progress(0, 1);
        local.notes = Some("same".into());
        let mut remote = progress(0, 2);
        remote.notes = Some("same".into());
        let merged = resolve_progress_conflict(&local, &remote, Timestamp::from_millis(3));
        assert_eq!(merged.data().unwrap().notes.as_deref(), Some("same"));
    }

    #[test]
    fn mismatched_problems_are_an_error() {
        let local = progress(0, 1);
        let mut remote = progress(0, 2);
        remote.problem_id = "other".into();
        let resolution = resolve_progress_conflict(&local, &remote, Timestamp::from_millis(3));
        assert_eq!(resolution.status(), ResolutionStatus::Error);
        assert!(resolution.data().is_none());
    }

    #[test]
    fn custom_rename_with_reclassification_is_manual() {
        let local = custom("Two Sum", "arrays", "hashing", 2, 1);
        let remote = custom("Pair Sum", "graphs", "bfs", 2, 2);

        let resolution = resolve_custom_conflict(&local, &remote);
        assert_eq!(resolution.status(), ResolutionStatus::Manual);
        let message = resolution.message().unwrap();
        assert!(message.contains("name"));
        assert!(message.contains("category"));
        assert!(message.contains("pattern"));
    }

    #[test]
    fn custom_rename_alone_is_last_write_wins() {
        let local = custom("Two Sum", "arrays", "hashing", 2, 5);
        let remote = custom("Pair Sum", "arrays", "bfs", 2, 2);

        let resolution = resolve_custom_conflict(&local, &remote);
        assert_eq!(resolution, Resolution::Resolved(local));
    }

    #[test]
    fn custom_tie_goes_to_remote() {
        let local = custom("A", "x", "y", 1, 5);
        let remote = custom("A", "x", "z", 1, 5);
        assert_eq!(resolve_custom_conflict(&local, &remote), Resolution::Resolved(remote));
    }

    #[test]
    fn settings_last_write_wins() {
        let local = SettingsRecord {
            values: [("theme".to_string(), serde_json::json!("dark"))].into(),
            timestamp: Timestamp::from_millis(10),
        };
        let remote = SettingsRecord {
            values: [("theme".to_string(), serde_json::json!("light"))].into(),
            timestamp: Timestamp::from_millis(5),
        };
        assert_eq!(resolve_settings_conflict(&local, &remote), Resolution::Resolved(local));
    }

    #[test]
    fn manual_check_on_divergent_notes() {
        let mut local = progress(0, 1);
        local.notes = Some("binary search on answer".into());
        let mut remote = progress(0, 2);
        remote.notes = Some("dynamic programming table".into());
        assert!(requires_manual_resolution(&local, &remote));

        remote.notes = Some("binary search on the answer".into());
        assert!(!requires_manual_resolution(&local, &remote));
    }

    #[test]
    fn manual_check_on_difficulty_gap() {
        let mut local = progress(0, 1);
        local.difficulty = Some(1);
        let mut remote = progress(0, 2);
        remote.difficulty = Some(4);
        assert!(requires_manual_resolution(&local, &remote));

        remote.difficulty = Some(3);
        assert!(!requires_manual_resolution(&local, &remote));
    }

    #[test]
    fn manual_check_ignores_one_sided_notes() {
        let mut local = progress(0, 1);
        local.notes = Some("only here".into());
        assert!(!requires_manual_resolution(&local, &progress(0, 2)));
    }

    #[test]
    fn jaccard() {
        assert_eq!(jaccard_similarity("", ""), 1.0);
        assert_eq!(jaccard_similarity("a b", "A, B!"), 1.0);
        assert_eq!(jaccard_similarity("a b", "c d"), 0.0);
        assert!((jaccard_similarity("a b c", "a b d") - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn describe_lists_every_difference() {
        let mut local = progress(1, 1);
        local.notes = Some("x".into());
        let remote = progress(2, 2);

        let description = describe_conflict(&local, &remote);
        assert!(description.contains("solveCount: local=1, remote=2"));
        assert!(description.contains("notes: local=\"x\", remote=none"));
        assert!(!description.contains("timestamp"));
    }

    #[test]
    fn describe_without_differences() {
        assert_eq!(describe_conflict(&progress(1, 1), &progress(1, 9)), "Unknown conflict");
    }

    fn arb_progress() -> impl Strategy<Value = ProgressRecord> {
        (
            any::<bool>(),
            0u32..1_000,
            proptest::option::of(0i64..1_000_000_000),
            proptest::option::of(1u8..=5),
            0i64..1_000_000_000,
        )
            .prop_map(|(solved, solve_count, reviewed, difficulty, ts)| ProgressRecord {
                problem_id: "p1".into(),
                solved,
                solve_count,
                last_reviewed_at: reviewed.map(Timestamp::from_millis),
                next_review_at: None,
                difficulty,
                notes: None,
                timestamp: Timestamp::from_millis(ts),
            })
    }

    proptest! {
        #[test]
        fn merge_is_commutative_on_or_sum_max_fields(a in arb_progress(), b in arb_progress()) {
            prop_assume!(a.timestamp != b.timestamp);
            let now = Timestamp::from_millis(2_000_000_000);

            let ab = resolve_progress_conflict(&a, &b, now);
            let ba = resolve_progress_conflict(&b, &a, now);
            let (ab, ba) = (ab.data().unwrap(), ba.data().unwrap());

            prop_assert_eq!(ab.solved, ba.solved);
            prop_assert_eq!(ab.solve_count, ba.solve_count);
            prop_assert_eq!(ab.last_reviewed_at, ba.last_reviewed_at);
        }

        #[test]
        fn merged_difficulty_stays_in_range(
            l in 1u8..=5,
            r in 1u8..=5,
            lt in any::<i64>(),
            rt in any::<i64>(),
            now in any::<i64>(),
        ) {
            prop_assume!(lt != rt);
            let mut local = ProgressRecord::new("p1", Timestamp::from_millis(lt));
            local.difficulty = Some(l);
            let mut remote = ProgressRecord::new("p1", Timestamp::from_millis(rt));
            remote.difficulty = Some(r);

            let merged = resolve_progress_conflict(&local, &remote, Timestamp::from_millis(now));
            let difficulty = merged.data().unwrap().difficulty.unwrap();
            prop_assert!((1..=5).contains(&difficulty));
        }
    }
}
