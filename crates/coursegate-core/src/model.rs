//! Core content and identity types for coursegate.
//!
//! Principals, groups, levels, resources, tests and questions, plus the typed
//! `Answer` a principal gives to a question. Runtime records (archive rows,
//! result pointers, attempt markers) live in their own modules.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::scoring::GradeTable;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Identifies a principal (user or guest).
    PrincipalId
);
string_id!(
    /// Identifies a group.
    GroupId
);
string_id!(
    /// Identifies a level in the content tree.
    LevelId
);
string_id!(
    /// Identifies a resource attached to a level.
    ResourceId
);
string_id!(
    /// Identifies a test.
    TestId
);
string_id!(
    /// Identifies a question within a test.
    QuestionId
);
string_id!(
    /// Identifies a result pointer.
    ResultId
);

// ---------------------------------------------------------------------------
// Principals and groups
// ---------------------------------------------------------------------------

/// An actor evaluated by the access-control engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: PrincipalId,
    #[serde(default)]
    pub name: String,
    pub role: Role,
}

/// The single primary role a principal holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Role {
    Administrator,
    GroupManager {
        #[serde(default)]
        managed_groups: BTreeSet<GroupId>,
    },
    Trainee {
        #[serde(default)]
        groups: BTreeSet<GroupId>,
    },
    Guest,
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Administrator => "administrator",
            Role::GroupManager { .. } => "group_manager",
            Role::Trainee { .. } => "trainee",
            Role::Guest => "guest",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Principal {
    pub fn new(id: impl Into<PrincipalId>, name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        matches!(self.role, Role::Administrator)
    }

    /// Groups used for gating decisions: managed groups for a group manager,
    /// membership groups for a trainee, none for guests and administrators.
    pub fn access_groups(&self) -> Option<&BTreeSet<GroupId>> {
        match &self.role {
            Role::GroupManager { managed_groups } => Some(managed_groups),
            Role::Trainee { groups } => Some(groups),
            Role::Administrator | Role::Guest => None,
        }
    }
}

/// A flat collection of principals. Groups never nest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    /// Trainees and group managers, for display. Derived from principals'
    /// roles on read; gating only ever looks at the role's groups.
    #[serde(default)]
    pub members: Vec<PrincipalId>,
    #[serde(default)]
    pub colour: Option<String>,
}

// ---------------------------------------------------------------------------
// Content tree
// ---------------------------------------------------------------------------

/// A node of the content tree and the unit of group gating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub id: LevelId,
    pub name: String,
    #[serde(default)]
    pub parent: Option<LevelId>,
    #[serde(default)]
    pub children: Vec<LevelId>,
    #[serde(default)]
    pub test: Option<TestId>,
    #[serde(default)]
    pub resources: Vec<ResourceId>,
    /// Empty means derestricted: visible to everyone.
    #[serde(default)]
    pub gating_groups: BTreeSet<GroupId>,
    #[serde(default)]
    pub eligibility: Option<EligibilityConfig>,
}

impl Level {
    pub fn new(id: impl Into<LevelId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            parent: None,
            children: Vec::new(),
            test: None,
            resources: Vec::new(),
            gating_groups: BTreeSet::new(),
            eligibility: None,
        }
    }

    pub fn is_derestricted(&self) -> bool {
        self.gating_groups.is_empty()
    }

    /// Prerequisite tests in configured order (empty when unconfigured).
    pub fn prerequisites(&self) -> &[TestId] {
        self.eligibility
            .as_ref()
            .map(|e| e.prerequisites.as_slice())
            .unwrap_or(&[])
    }
}

/// Tests that must be passed before a level opens.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibilityConfig {
    #[serde(default)]
    pub prerequisites: Vec<TestId>,
}

/// Supporting material attached to a level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub level: LevelId,
    pub name: String,
    /// Hide while the principal is sitting the level's test.
    #[serde(default)]
    pub lock_during_test: bool,
    #[serde(default)]
    pub schedule: Option<ScheduleWindow>,
}

/// Inclusive availability window; an open end is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleWindow {
    #[serde(default)]
    pub opens_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closes_at: Option<DateTime<Utc>>,
}

impl ScheduleWindow {
    pub fn covers(&self, now: DateTime<Utc>) -> bool {
        self.opens_at.map_or(true, |open| now >= open)
            && self.closes_at.map_or(true, |close| now <= close)
    }
}

// ---------------------------------------------------------------------------
// Tests and questions
// ---------------------------------------------------------------------------

/// An assessment owned by exactly one level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Test {
    pub id: TestId,
    pub level: LevelId,
    pub name: String,
    #[serde(default)]
    pub questions: Vec<QuestionId>,
    #[serde(default)]
    pub resit_attempts: ResitPolicy,
    #[serde(default)]
    pub time_limit_secs: Option<u64>,
    /// Falls back to the engine's default table when absent.
    #[serde(default)]
    pub grade_table: Option<GradeTable>,
    #[serde(default)]
    pub result_visibility: ResultVisibility,
}

impl Test {
    pub fn new(id: impl Into<TestId>, level: impl Into<LevelId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            level: level.into(),
            name: name.into(),
            questions: Vec::new(),
            resit_attempts: ResitPolicy::default(),
            time_limit_secs: None,
            grade_table: None,
            result_visibility: ResultVisibility::default(),
        }
    }

    pub fn time_limit(&self) -> Option<chrono::Duration> {
        self.time_limit_secs
            .map(|secs| chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)))
    }
}

/// How many times a finished test may be resat.
///
/// Serialised as an integer: `-1` unlimited, `0` none, `N` finite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum ResitPolicy {
    Unlimited,
    Limited(u32),
}

impl Default for ResitPolicy {
    fn default() -> Self {
        ResitPolicy::Limited(0)
    }
}

impl ResitPolicy {
    /// Attempts left after `times_resat` resits; `None` means unlimited.
    pub fn remaining(&self, times_resat: u32) -> Option<u32> {
        match self {
            ResitPolicy::Unlimited => None,
            ResitPolicy::Limited(n) => Some(n.saturating_sub(times_resat)),
        }
    }

    pub fn permits_resit(&self, times_resat: u32) -> bool {
        self.remaining(times_resat).map_or(true, |left| left > 0)
    }
}

impl TryFrom<i64> for ResitPolicy {
    type Error = String;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(ResitPolicy::Unlimited),
            n if n >= 0 => u32::try_from(n)
                .map(ResitPolicy::Limited)
                .map_err(|_| format!("resit_attempts out of range: {n}")),
            n => Err(format!("resit_attempts must be -1, 0 or positive, got {n}")),
        }
    }
}

impl From<ResitPolicy> for i64 {
    fn from(policy: ResitPolicy) -> Self {
        match policy {
            ResitPolicy::Unlimited => -1,
            ResitPolicy::Limited(n) => i64::from(n),
        }
    }
}

/// When a trainee may see their own result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultVisibility {
    #[default]
    Immediate,
    Manual,
}

impl FromStr for ResultVisibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "immediate" | "auto" => Ok(ResultVisibility::Immediate),
            "manual" => Ok(ResultVisibility::Manual),
            other => Err(format!("unknown result visibility: {other}")),
        }
    }
}

/// A single item of a test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub id: QuestionId,
    pub test: TestId,
    pub position: u32,
    #[serde(default)]
    pub prompt: String,
    pub kind: QuestionKind,
    /// Overrides the engine-wide trimming setting when present.
    #[serde(default)]
    pub trim_answer: Option<bool>,
}

/// Question type together with its correctness data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionKind {
    MultipleChoice {
        options: Vec<String>,
        /// Index into `options`.
        correct: usize,
    },
    SingleAnswer {
        expected: String,
        #[serde(default)]
        comparison: Comparison,
        /// Upper bound for `Between`.
        #[serde(default)]
        upper: Option<String>,
        /// Regex modifier letters for `Matches`.
        #[serde(default)]
        pattern_flags: String,
    },
    Upload,
    Custom {
        type_name: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl QuestionKind {
    /// Name used to look up an external answer validator.
    pub fn type_name(&self) -> &str {
        match self {
            QuestionKind::MultipleChoice { .. } => "multiple",
            QuestionKind::SingleAnswer { .. } => "single",
            QuestionKind::Upload => "upload",
            QuestionKind::Custom { type_name, .. } => type_name,
        }
    }
}

/// Comparison operator for single-answer questions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    #[default]
    EqualTo,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    Between,
    Matches,
}

impl FromStr for Comparison {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "equal_to" | "equals" | "eq" => Ok(Comparison::EqualTo),
            "greater_than" | "gt" => Ok(Comparison::GreaterThan),
            "greater_than_or_equal" | "gte" => Ok(Comparison::GreaterThanOrEqual),
            "less_than" | "lt" => Ok(Comparison::LessThan),
            "less_than_or_equal" | "lte" => Ok(Comparison::LessThanOrEqual),
            "contains" => Ok(Comparison::Contains),
            "between" => Ok(Comparison::Between),
            "matches" | "regex" => Ok(Comparison::Matches),
            other => Err(format!("unknown comparison: {other}")),
        }
    }
}

/// A principal's answer to a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Answer {
    Scalar(String),
    List(Vec<String>),
    File(FileRef),
}

impl Answer {
    pub fn scalar(value: impl Into<String>) -> Self {
        Answer::Scalar(value.into())
    }

    pub fn as_scalar(&self) -> Option<&str> {
        match self {
            Answer::Scalar(s) => Some(s),
            _ => None,
        }
    }
}

/// Reference to an uploaded file held by an external attachment store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub size_bytes: u64,
}
