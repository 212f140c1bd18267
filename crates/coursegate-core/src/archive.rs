//! The append-only archive ledger and the result pointer.
//!
//! One `ArchiveRow` is written per finished attempt and is the permanent
//! record of it. Rows are built only inside this crate; the sole sanctioned
//! mutation is a manual percentage override, which rebands the grade and
//! leaves mark, out_of and answers untouched.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{PrincipalId, ResultId, ResultVisibility, TestId};
use crate::scoring::{Grade, QuestionOutcome, ScoreCard};

/// Immutable record of one finished attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRow {
    principal: PrincipalId,
    test: TestId,
    resit_number: u32,
    recorded_at: DateTime<Utc>,
    duration_secs: i64,
    mark: u32,
    out_of: u32,
    percentage: u32,
    grade: String,
    passed: bool,
    answers: Vec<QuestionOutcome>,
    #[serde(default)]
    overridden: bool,
}

impl ArchiveRow {
    pub(crate) fn from_score(
        principal: PrincipalId,
        test: TestId,
        resit_number: u32,
        recorded_at: DateTime<Utc>,
        duration_secs: i64,
        card: &ScoreCard,
    ) -> Self {
        Self {
            principal,
            test,
            resit_number,
            recorded_at,
            duration_secs,
            mark: card.mark,
            out_of: card.out_of,
            percentage: card.percentage,
            grade: card.grade.label.clone(),
            passed: card.grade.passed,
            answers: card.outcomes.clone(),
            overridden: false,
        }
    }

    /// Copy of this row with an operator-set percentage and its grade.
    pub(crate) fn with_override(&self, percentage: u32, grade: Grade) -> Self {
        Self {
            percentage,
            grade: grade.label,
            passed: grade.passed,
            overridden: true,
            ..self.clone()
        }
    }

    /// `true` when `other` describes the same attempt with the same recorded
    /// answers and marks; only the override fields may differ.
    pub fn same_record(&self, other: &ArchiveRow) -> bool {
        self.principal == other.principal
            && self.test == other.test
            && self.resit_number == other.resit_number
            && self.recorded_at == other.recorded_at
            && self.duration_secs == other.duration_secs
            && self.mark == other.mark
            && self.out_of == other.out_of
            && self.answers == other.answers
    }

    pub fn principal(&self) -> &PrincipalId {
        &self.principal
    }

    pub fn test(&self) -> &TestId {
        &self.test
    }

    pub fn resit_number(&self) -> u32 {
        self.resit_number
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    pub fn duration_secs(&self) -> i64 {
        self.duration_secs
    }

    pub fn mark(&self) -> u32 {
        self.mark
    }

    pub fn out_of(&self) -> u32 {
        self.out_of
    }

    pub fn percentage(&self) -> u32 {
        self.percentage
    }

    pub fn grade(&self) -> &str {
        &self.grade
    }

    pub fn passed(&self) -> bool {
        self.passed
    }

    pub fn answers(&self) -> &[QuestionOutcome] {
        &self.answers
    }

    pub fn is_overridden(&self) -> bool {
        self.overridden
    }
}

/// Addressable handle on a principal's latest archive row for a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPointer {
    pub id: ResultId,
    pub principal: PrincipalId,
    pub test: TestId,
    /// Resit number of the row this pointer dereferences to.
    pub resit_number: u32,
    /// Whether the trainee may see it.
    pub released: bool,
    pub created_at: DateTime<Utc>,
}

impl ResultPointer {
    pub fn new(row: &ArchiveRow, visibility: ResultVisibility, now: DateTime<Utc>) -> Self {
        Self {
            id: ResultId::new(Uuid::new_v4().to_string()),
            principal: row.principal.clone(),
            test: row.test.clone(),
            resit_number: row.resit_number,
            released: visibility == ResultVisibility::Immediate,
            created_at: now,
        }
    }
}

/// Resit number the next row for this history must carry.
pub fn next_resit_number(history: &[ArchiveRow]) -> u32 {
    history
        .iter()
        .map(|row| row.resit_number + 1)
        .max()
        .unwrap_or(0)
}

/// Highest-resit row of a history.
pub fn latest(history: &[ArchiveRow]) -> Option<&ArchiveRow> {
    history.iter().max_by_key(|row| row.resit_number)
}

/// `true` when a history's resit numbers are exactly `0..len`.
pub fn is_gapless(history: &[ArchiveRow]) -> bool {
    let mut numbers: Vec<u32> = history.iter().map(|row| row.resit_number).collect();
    numbers.sort_unstable();
    numbers.iter().enumerate().all(|(i, n)| *n as usize == i)
}

/// Latest row per (principal, test) pair.
pub fn latest_per_attempt(rows: &[ArchiveRow]) -> Vec<ArchiveRow> {
    let mut latest: BTreeMap<(&PrincipalId, &TestId), &ArchiveRow> = BTreeMap::new();
    for row in rows {
        latest
            .entry((&row.principal, &row.test))
            .and_modify(|current| {
                if row.resit_number > current.resit_number {
                    *current = row;
                }
            })
            .or_insert(row);
    }
    latest.into_values().cloned().collect()
}


#[cfg(test)]
mod tests {
    use super::fixtures::row;
    use super::*;
    use crate::scoring::GradeTable;

    #[test]
    fn next_resit_number_starts_at_zero() {
        assert_eq!(next_resit_number(&[]), 0);
        let history = vec![row("u1", "t1", 0, 40), row("u1", "t1", 1, 60)];
        assert_eq!(next_resit_number(&history), 2);
        assert_eq!(latest(&history).unwrap().percentage(), 60);
    }

    #[test]
    fn gapless_detection() {
        assert!(is_gapless(&[]));
        assert!(is_gapless(&[row("u", "t", 1, 0), row("u", "t", 0, 0)]));
        assert!(!is_gapless(&[row("u", "t", 0, 0), row("u", "t", 2, 0)]));
        assert!(!is_gapless(&[row("u", "t", 0, 0), row("u", "t", 0, 0)]));
    }

    #[test]
    fn override_keeps_record_fields() {
        let original = row("u1", "t1", 0, 40);
        let table = GradeTable::default();
        let overridden = original.with_override(80, table.grade(80));
        assert!(original.same_record(&overridden));
        assert_eq!(overridden.percentage(), 80);
        assert_eq!(overridden.mark(), 40);
        assert!(overridden.passed());
        assert!(overridden.is_overridden());
    }

    #[test]
    fn same_record_rejects_changed_marks() {
        let a = row("u1", "t1", 0, 40);
        let b = row("u1", "t1", 0, 41);
        assert!(!a.same_record(&b));
    }

    #[test]
    fn latest_per_attempt_keeps_highest_resit() {
        let rows = vec![
            row("u1", "t1", 0, 30),
            row("u1", "t1", 1, 70),
            row("u2", "t1", 0, 55),
            row("u1", "t2", 0, 90),
        ];
        let latest = latest_per_attempt(&rows);
        assert_eq!(latest.len(), 3);
        let u1_t1 = latest
            .iter()
            .find(|r| r.principal().as_str() == "u1" && r.test().as_str() == "t1")
            .unwrap();
        assert_eq!(u1_t1.percentage(), 70);
    }

    #[test]
    fn pointer_release_follows_visibility() {
        let r = row("u1", "t1", 0, 70);
        let now = r.recorded_at();
        assert!(ResultPointer::new(&r, ResultVisibility::Immediate, now).released);
        assert!(!ResultPointer::new(&r, ResultVisibility::Manual, now).released);
    }
}
