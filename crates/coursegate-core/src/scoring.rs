//! Answer checking, marks and grade banding.
//!
//! `Scorer` runs a type-specific comparator for each question, counts the
//! correct ones and bands the rounded percentage through a `GradeTable`.
//! Types without a built-in comparator are delegated to registered
//! `AnswerValidator`s and score as incorrect when none is registered.

use std::collections::HashMap;
use std::sync::Arc;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Answer, Comparison, Question, QuestionId, QuestionKind};
use crate::traits::AnswerValidator;

// ---------------------------------------------------------------------------
// Grade tables
// ---------------------------------------------------------------------------

/// One row of a grade table. The first row's threshold is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GradeEntry {
    #[serde(default)]
    pub threshold: Option<u32>,
    pub label: String,
}

/// Errors from building a grade table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GradeTableError {
    #[error("grade table has no entries")]
    Empty,

    #[error("grade '{label}' has no threshold")]
    MissingThreshold { label: String },

    #[error("grade '{label}' threshold {threshold} exceeds 100")]
    OutOfRange { label: String, threshold: u32 },

    #[error("grade '{label}' threshold {threshold} is not above the previous threshold {previous}")]
    NotAscending {
        label: String,
        threshold: u32,
        previous: u32,
    },
}

/// Ascending list of grades; entry 0 is the implicit fail grade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<GradeEntry>", into = "Vec<GradeEntry>")]
pub struct GradeTable {
    entries: Vec<GradeEntry>,
}

/// The grade a percentage falls into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grade {
    pub label: String,
    /// Position in the table; 0 is the fail grade.
    pub rank: usize,
    pub passed: bool,
}

impl GradeTable {
    /// Build a table from a fail label and `(threshold, label)` bands.
    pub fn new(
        fail_label: impl Into<String>,
        bands: impl IntoIterator<Item = (u32, String)>,
    ) -> Result<Self, GradeTableError> {
        let mut entries = vec![GradeEntry {
            threshold: None,
            label: fail_label.into(),
        }];
        entries.extend(bands.into_iter().map(|(threshold, label)| GradeEntry {
            threshold: Some(threshold),
            label,
        }));
        Self::try_from(entries)
    }

    /// Build from `(threshold, label)` pairs where the first pair is the fail
    /// grade and its threshold is ignored.
    pub fn from_pairs(pairs: &[(u32, &str)]) -> Result<Self, GradeTableError> {
        let (first, rest) = pairs.split_first().ok_or(GradeTableError::Empty)?;
        Self::new(
            first.1,
            rest.iter().map(|(threshold, label)| (*threshold, label.to_string())),
        )
    }

    pub fn entries(&self) -> &[GradeEntry] {
        &self.entries
    }

    pub fn fail_label(&self) -> &str {
        &self.entries[0].label
    }

    /// Band `percentage`: the highest threshold not above it wins and passes;
    /// below every threshold is the fail grade.
    pub fn grade(&self, percentage: u32) -> Grade {
        for (rank, entry) in self.entries.iter().enumerate().skip(1).rev() {
            if entry.threshold.is_some_and(|t| t <= percentage) {
                return Grade {
                    label: entry.label.clone(),
                    rank,
                    passed: true,
                };
            }
        }
        Grade {
            label: self.fail_label().to_string(),
            rank: 0,
            passed: false,
        }
    }
}

impl Default for GradeTable {
    fn default() -> Self {
        Self {
            entries: vec![
                GradeEntry {
                    threshold: None,
                    label: "Fail".into(),
                },
                GradeEntry {
                    threshold: Some(50),
                    label: "Pass".into(),
                },
            ],
        }
    }
}

impl TryFrom<Vec<GradeEntry>> for GradeTable {
    type Error = GradeTableError;

    fn try_from(mut entries: Vec<GradeEntry>) -> Result<Self, Self::Error> {
        let first = entries.first_mut().ok_or(GradeTableError::Empty)?;
        first.threshold = None;

        let mut previous: Option<u32> = None;
        for entry in entries.iter().skip(1) {
            let threshold = entry
                .threshold
                .ok_or_else(|| GradeTableError::MissingThreshold {
                    label: entry.label.clone(),
                })?;
            if threshold > 100 {
                return Err(GradeTableError::OutOfRange {
                    label: entry.label.clone(),
                    threshold,
                });
            }
            if let Some(previous) = previous {
                if threshold <= previous {
                    return Err(GradeTableError::NotAscending {
                        label: entry.label.clone(),
                        threshold,
                        previous,
                    });
                }
            }
            previous = Some(threshold);
        }

        Ok(Self { entries })
    }
}

impl From<GradeTable> for Vec<GradeEntry> {
    fn from(table: GradeTable) -> Self {
        table.entries
    }
}

/// `round(mark / out_of * 100)`, or 0 for an empty test.
pub fn percentage(mark: u32, out_of: u32) -> u32 {
    if out_of == 0 {
        return 0;
    }
    // Half away from zero, in integers so exact halves aren't lost.
    let (mark, out_of) = (u64::from(mark), u64::from(out_of));
    let rounded = (200 * mark + out_of) / (2 * out_of);
    u32::try_from(rounded).unwrap_or(u32::MAX)
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Per-question result of a scoring run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOutcome {
    pub question: QuestionId,
    pub answer: Option<Answer>,
    pub correct: bool,
}

/// Outcome of scoring one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreCard {
    pub mark: u32,
    pub out_of: u32,
    pub percentage: u32,
    pub grade: Grade,
    pub outcomes: Vec<QuestionOutcome>,
    /// Questions whose type had no comparator and were marked incorrect.
    pub unscored: Vec<QuestionId>,
}

impl ScoreCard {
    pub fn passed(&self) -> bool {
        self.grade.passed
    }
}

/// Checks answers and grades attempts.
#[derive(Clone)]
pub struct Scorer {
    validators: HashMap<String, Arc<dyn AnswerValidator>>,
    trim_answers: bool,
}

impl std::fmt::Debug for Scorer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scorer")
            .field("validators", &self.validators.keys().collect::<Vec<_>>())
            .field("trim_answers", &self.trim_answers)
            .finish()
    }
}

impl Scorer {
    pub fn new(trim_answers: bool) -> Self {
        Self {
            validators: HashMap::new(),
            trim_answers,
        }
    }

    /// Register an external validator for a question type name
    /// (`"upload"` or a custom type).
    pub fn register(&mut self, type_name: impl Into<String>, validator: Arc<dyn AnswerValidator>) {
        self.validators.insert(type_name.into(), validator);
    }

    pub fn has_validator(&self, type_name: &str) -> bool {
        self.validators.contains_key(type_name)
    }

    /// Score every question in `questions`; a missing answer is incorrect.
    pub fn score(
        &self,
        questions: &[Question],
        answers: &HashMap<QuestionId, Answer>,
        table: &GradeTable,
    ) -> ScoreCard {
        let mut outcomes = Vec::with_capacity(questions.len());
        let mut unscored = Vec::new();
        let mut mark = 0u32;

        for question in questions {
            let answer = answers.get(&question.id);
            let correct = match self.check(question, answer) {
                Some(correct) => correct,
                None => {
                    tracing::warn!(
                        question = %question.id,
                        question_type = question.kind.type_name(),
                        "no comparator registered for question type, scoring as incorrect"
                    );
                    unscored.push(question.id.clone());
                    false
                }
            };
            if correct {
                mark += 1;
            }
            outcomes.push(QuestionOutcome {
                question: question.id.clone(),
                answer: answer.cloned(),
                correct,
            });
        }

        let out_of = questions.len() as u32;
        let percentage = percentage(mark, out_of);
        ScoreCard {
            mark,
            out_of,
            percentage,
            grade: table.grade(percentage),
            outcomes,
            unscored,
        }
    }

    /// `Some(correct)` when the question type can be checked, `None` when no
    /// comparator exists for it.
    pub fn check(&self, question: &Question, answer: Option<&Answer>) -> Option<bool> {
        match &question.kind {
            QuestionKind::MultipleChoice { correct, .. } => Some(
                answer
                    .and_then(Answer::as_scalar)
                    .and_then(|s| s.trim().parse::<usize>().ok())
                    .is_some_and(|chosen| chosen == *correct),
            ),
            QuestionKind::SingleAnswer {
                expected,
                comparison,
                upper,
                pattern_flags,
            } => {
                let Some(given) = answer.and_then(Answer::as_scalar) else {
                    return Some(false);
                };
                let trim = question.trim_answer.unwrap_or(self.trim_answers);
                let given = if trim { given.trim() } else { given };
                Some(compare_single(
                    given,
                    *comparison,
                    expected,
                    upper.as_deref(),
                    pattern_flags,
                ))
            }
            QuestionKind::Upload | QuestionKind::Custom { .. } => {
                let validator = self.validators.get(question.kind.type_name())?;
                Some(answer.is_some_and(|a| validator.validate(question, a)))
            }
        }
    }
}

/// Apply a single-answer comparison. Numeric operators need both sides to
/// parse as numbers.
pub fn compare_single(
    given: &str,
    comparison: Comparison,
    expected: &str,
    upper: Option<&str>,
    pattern_flags: &str,
) -> bool {
    let numbers = || Some((given.parse::<f64>().ok()?, expected.trim().parse::<f64>().ok()?));

    match comparison {
        Comparison::EqualTo => match numbers() {
            Some((g, e)) => g == e,
            None => given == expected,
        },
        Comparison::GreaterThan => numbers().is_some_and(|(g, e)| g > e),
        Comparison::GreaterThanOrEqual => numbers().is_some_and(|(g, e)| g >= e),
        Comparison::LessThan => numbers().is_some_and(|(g, e)| g < e),
        Comparison::LessThanOrEqual => numbers().is_some_and(|(g, e)| g <= e),
        Comparison::Contains => given.to_lowercase().contains(&expected.to_lowercase()),
        Comparison::Between => {
            let Some(hi) = upper.and_then(|u| u.trim().parse::<f64>().ok()) else {
                return false;
            };
            numbers().is_some_and(|(g, lo)| lo <= g && g <= hi)
        }
        Comparison::Matches => matches_pattern(expected, pattern_flags, given),
    }
}

/// Regex match with modifier letters `i m s x U`. An invalid pattern never
/// matches.
pub fn matches_pattern(pattern: &str, flags: &str, given: &str) -> bool {
    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => builder.case_insensitive(true),
            'm' => builder.multi_line(true),
            's' => builder.dot_matches_new_line(true),
            'x' => builder.ignore_whitespace(true),
            'U' => builder.swap_greed(true),
            other => {
                tracing::warn!(flag = %other, "ignoring unsupported pattern modifier");
                &mut builder
            }
        };
    }
    match builder.build() {
        Ok(re) => re.is_match(given),
        Err(e) => {
            tracing::warn!(pattern, "invalid answer pattern: {e}");
            false
        }
    }
}
