//! TOML course parser.
//!
//! Loads course definitions (groups, principals, the level tree, resources,
//! tests and questions) from TOML files and directories, and validates them.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eligibility::prerequisite_cycle;
use crate::model::{
    Comparison, EligibilityConfig, Group, GroupId, Level, LevelId, Principal, Question,
    QuestionKind, Resource, ResitPolicy, ResultVisibility, Role, ScheduleWindow, Test, TestId,
};
use crate::scoring::{GradeEntry, GradeTable};

/// A fully parsed course with derived relations filled in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub groups: Vec<Group>,
    pub principals: Vec<Principal>,
    pub levels: Vec<Level>,
    pub resources: Vec<Resource>,
    pub tests: Vec<Test>,
    pub questions: Vec<Question>,
}

impl Course {
    pub fn level(&self, id: &LevelId) -> Option<&Level> {
        self.levels.iter().find(|l| &l.id == id)
    }

    pub fn test(&self, id: &TestId) -> Option<&Test> {
        self.tests.iter().find(|t| &t.id == id)
    }
}

/// Intermediate TOML structure for parsing course files.
#[derive(Debug, Deserialize)]
struct TomlCourseFile {
    course: TomlCourseHeader,
    #[serde(default)]
    groups: Vec<TomlGroup>,
    #[serde(default)]
    principals: Vec<TomlPrincipal>,
    #[serde(default)]
    levels: Vec<TomlLevel>,
    #[serde(default)]
    resources: Vec<TomlResource>,
    #[serde(default)]
    tests: Vec<TomlTest>,
    #[serde(default)]
    questions: Vec<TomlQuestion>,
}

#[derive(Debug, Deserialize)]
struct TomlCourseHeader {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct TomlGroup {
    id: String,
    name: String,
    #[serde(default)]
    colour: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlPrincipal {
    id: String,
    #[serde(default)]
    name: String,
    role: String,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    managed_groups: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TomlLevel {
    id: String,
    name: String,
    #[serde(default)]
    parent: Option<String>,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    prerequisites: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TomlResource {
    id: String,
    level: String,
    name: String,
    #[serde(default)]
    lock_during_test: bool,
    #[serde(default)]
    opens_at: Option<DateTime<Utc>>,
    #[serde(default)]
    closes_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct TomlTest {
    id: String,
    level: String,
    name: String,
    #[serde(default)]
    resit_attempts: i64,
    #[serde(default)]
    time_limit: Option<String>,
    #[serde(default)]
    result_visibility: Option<String>,
    #[serde(default)]
    grades: Option<Vec<GradeEntry>>,
}

#[derive(Debug, Deserialize)]
struct TomlQuestion {
    id: String,
    test: String,
    #[serde(default)]
    position: Option<u32>,
    #[serde(default)]
    prompt: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    options: Vec<String>,
    #[serde(default)]
    correct: Option<usize>,
    #[serde(default)]
    expected: Option<String>,
    #[serde(default)]
    comparison: Option<String>,
    #[serde(default)]
    upper: Option<String>,
    #[serde(default)]
    flags: String,
    #[serde(default)]
    trim: Option<bool>,
    #[serde(default)]
    data: Option<toml::Value>,
}

/// Parse a single TOML file into a `Course`.
pub fn parse_course(path: &Path) -> Result<Course> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read course file: {}", path.display()))?;

    parse_course_str(&content, path)
}

/// Parse a TOML string into a `Course` (useful for testing).
pub fn parse_course_str(content: &str, source_path: &Path) -> Result<Course> {
    let parsed: TomlCourseFile = toml::from_str(content)
        .with_context(|| format!("failed to parse TOML: {}", source_path.display()))?;

    let groups: Vec<Group> = parsed
        .groups
        .into_iter()
        .map(|g| Group {
            id: g.id.into(),
            name: g.name,
            members: Vec::new(),
            colour: g.colour,
        })
        .collect();

    let principals = parsed
        .principals
        .into_iter()
        .map(build_principal)
        .collect::<Result<Vec<_>>>()?;

    let mut levels: Vec<Level> = parsed
        .levels
        .into_iter()
        .map(|l| {
            let mut level = Level::new(l.id, l.name);
            level.parent = l.parent.map(LevelId::from);
            level.gating_groups = l.groups.into_iter().map(GroupId::from).collect();
            if !l.prerequisites.is_empty() {
                level.eligibility = Some(EligibilityConfig {
                    prerequisites: l.prerequisites.into_iter().map(TestId::from).collect(),
                });
            }
            level
        })
        .collect();

    let resources: Vec<Resource> = parsed
        .resources
        .into_iter()
        .map(|r| Resource {
            id: r.id.into(),
            level: r.level.into(),
            name: r.name,
            lock_during_test: r.lock_during_test,
            schedule: (r.opens_at.is_some() || r.closes_at.is_some()).then_some(ScheduleWindow {
                opens_at: r.opens_at,
                closes_at: r.closes_at,
            }),
        })
        .collect();

    let mut tests = parsed
        .tests
        .into_iter()
        .map(build_test)
        .collect::<Result<Vec<_>>>()?;

    let questions = parsed
        .questions
        .into_iter()
        .enumerate()
        .map(|(index, q)| build_question(index, q))
        .collect::<Result<Vec<_>>>()?;

    link_levels(&mut levels, &resources, &tests)?;
    for test in &mut tests {
        let mut owned: Vec<&Question> = questions.iter().filter(|q| q.test == test.id).collect();
        owned.sort_by_key(|q| q.position);
        test.questions = owned.into_iter().map(|q| q.id.clone()).collect();
    }
    let groups = groups
        .into_iter()
        .map(|mut group| {
            group.members = principals
                .iter()
                .filter(|p| {
                    p.access_groups()
                        .is_some_and(|groups| groups.contains(&group.id))
                })
                .map(|p| p.id.clone())
                .collect();
            group
        })
        .collect();

    Ok(Course {
        name: parsed.course.name,
        description: parsed.course.description,
        groups,
        principals,
        levels,
        resources,
        tests,
        questions,
    })
}

fn build_principal(p: TomlPrincipal) -> Result<Principal> {
    let to_set =
        |ids: Vec<String>| -> BTreeSet<GroupId> { ids.into_iter().map(GroupId::from).collect() };
    let role = match p.role.to_lowercase().as_str() {
        "administrator" | "admin" => Role::Administrator,
        "group_manager" | "manager" => Role::GroupManager {
            managed_groups: to_set(p.managed_groups),
        },
        "trainee" => Role::Trainee {
            groups: to_set(p.groups),
        },
        "guest" => Role::Guest,
        other => anyhow::bail!("principal {}: unknown role '{other}'", p.id),
    };
    Ok(Principal::new(p.id, p.name, role))
}

fn build_test(t: TomlTest) -> Result<Test> {
    let mut test = Test::new(t.id, t.level, t.name);
    test.resit_attempts = ResitPolicy::try_from(t.resit_attempts)
        .map_err(|e| anyhow::anyhow!("test {}: {e}", test.id))?;
    test.time_limit_secs = t
        .time_limit
        .as_deref()
        .map(parse_time_limit)
        .transpose()
        .with_context(|| format!("test {}: invalid time_limit", test.id))?
        .filter(|secs| *secs > 0);
    if let Some(visibility) = t.result_visibility {
        test.result_visibility = visibility
            .parse::<ResultVisibility>()
            .map_err(|e| anyhow::anyhow!("test {}: {e}", test.id))?;
    }
    if let Some(grades) = t.grades {
        test.grade_table = Some(
            GradeTable::try_from(grades)
                .with_context(|| format!("test {}: invalid grade table", test.id))?,
        );
    }
    Ok(test)
}

fn build_question(index: usize, q: TomlQuestion) -> Result<Question> {
    let kind = match q.kind.to_lowercase().as_str() {
        "multiple" | "multiple_choice" => QuestionKind::MultipleChoice {
            options: q.options,
            correct: q
                .correct
                .with_context(|| format!("question {}: multiple choice needs 'correct'", q.id))?,
        },
        "single" | "single_answer" => QuestionKind::SingleAnswer {
            expected: q
                .expected
                .with_context(|| format!("question {}: single answer needs 'expected'", q.id))?,
            comparison: q
                .comparison
                .as_deref()
                .map(str::parse::<Comparison>)
                .transpose()
                .map_err(|e| anyhow::anyhow!("question {}: {e}", q.id))?
                .unwrap_or_default(),
            upper: q.upper,
            pattern_flags: q.flags,
        },
        "upload" => QuestionKind::Upload,
        "" => anyhow::bail!("question {}: missing type", q.id),
        other => QuestionKind::Custom {
            type_name: other.to_string(),
            data: match q.data {
                Some(value) => serde_json::to_value(value)
                    .with_context(|| format!("question {}: invalid data", q.id))?,
                None => serde_json::Value::Null,
            },
        },
    };
    let position = match q.position {
        Some(position) => position,
        None => u32::try_from(index).context("too many questions")?,
    };
    Ok(Question {
        id: q.id.into(),
        test: q.test.into(),
        position,
        prompt: q.prompt,
        kind,
        trim_answer: q.trim,
    })
}

/// Fill in each level's children, test and resources.
fn link_levels(levels: &mut [Level], resources: &[Resource], tests: &[Test]) -> Result<()> {
    let parents: Vec<(LevelId, LevelId)> = levels
        .iter()
        .filter_map(|l| l.parent.clone().map(|parent| (parent, l.id.clone())))
        .collect();

    for level in levels.iter_mut() {
        level.children = parents
            .iter()
            .filter(|(parent, _)| parent == &level.id)
            .map(|(_, child)| child.clone())
            .collect();
        level.resources = resources
            .iter()
            .filter(|r| r.level == level.id)
            .map(|r| r.id.clone())
            .collect();

        let mut owned = tests.iter().filter(|t| t.level == level.id);
        level.test = owned.next().map(|t| t.id.clone());
        if let Some(second) = owned.next() {
            anyhow::bail!(
                "level {} has more than one test ({} and {})",
                level.id,
                level.test.as_ref().map(TestId::as_str).unwrap_or_default(),
                second.id
            );
        }
    }
    Ok(())
}

/// Parse an `HH:MM:SS` duration into seconds.
pub fn parse_time_limit(value: &str) -> Result<u64> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    let [hours, minutes, seconds] = parts.as_slice() else {
        anyhow::bail!("expected HH:MM:SS, got '{value}'");
    };
    let field = |s: &str, name: &str| -> Result<u64> {
        s.parse::<u64>()
            .with_context(|| format!("invalid {name} in '{value}'"))
    };
    let (h, m, s) = (
        field(hours, "hours")?,
        field(minutes, "minutes")?,
        field(seconds, "seconds")?,
    );
    if m >= 60 || s >= 60 {
        anyhow::bail!("minutes and seconds must be below 60 in '{value}'");
    }
    Ok(h * 3600 + m * 60 + s)
}

/// Load all `.toml` course files from a directory, recursively.
pub fn load_course_directory(dir: &Path) -> Result<Vec<Course>> {
    let mut courses = Vec::new();

    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("failed to read directory: {}", dir.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_dir() {
            courses.extend(load_course_directory(&path)?);
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            match parse_course(&path) {
                Ok(course) => courses.push(course),
                Err(e) => {
                    tracing::warn!("skipping {}: {:#}", path.display(), e);
                }
            }
        }
    }

    Ok(courses)
}

/// A warning from course validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    /// The entity the warning is about, if any.
    pub entity: Option<String>,
    pub message: String,
}

impl ValidationWarning {
    fn about(entity: impl ToString, message: impl Into<String>) -> Self {
        Self {
            entity: Some(entity.to_string()),
            message: message.into(),
        }
    }
}

/// Validate a course for common issues.
pub fn validate_course(course: &Course) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    duplicates(course.groups.iter().map(|g| g.id.as_str()), "group", &mut warnings);
    duplicates(course.principals.iter().map(|p| p.id.as_str()), "principal", &mut warnings);
    duplicates(course.levels.iter().map(|l| l.id.as_str()), "level", &mut warnings);
    duplicates(course.resources.iter().map(|r| r.id.as_str()), "resource", &mut warnings);
    duplicates(course.tests.iter().map(|t| t.id.as_str()), "test", &mut warnings);
    duplicates(course.questions.iter().map(|q| q.id.as_str()), "question", &mut warnings);

    let groups: HashSet<&GroupId> = course.groups.iter().map(|g| &g.id).collect();
    let levels: HashSet<&LevelId> = course.levels.iter().map(|l| &l.id).collect();
    let tests: HashSet<&TestId> = course.tests.iter().map(|t| &t.id).collect();

    for principal in &course.principals {
        for group in principal.access_groups().into_iter().flatten() {
            if !groups.contains(group) {
                warnings.push(ValidationWarning::about(
                    &principal.id,
                    format!("unknown group: {group}"),
                ));
            }
        }
    }

    for level in &course.levels {
        if let Some(parent) = &level.parent {
            if !levels.contains(parent) {
                warnings.push(ValidationWarning::about(
                    &level.id,
                    format!("unknown parent level: {parent}"),
                ));
            }
        }
        for group in &level.gating_groups {
            if !groups.contains(group) {
                warnings.push(ValidationWarning::about(
                    &level.id,
                    format!("unknown gating group: {group}"),
                ));
            }
        }
        for test in level.prerequisites() {
            if !tests.contains(test) {
                warnings.push(ValidationWarning::about(
                    &level.id,
                    format!("unknown prerequisite test: {test}"),
                ));
            }
        }
    }

    for resource in &course.resources {
        if !levels.contains(&resource.level) {
            warnings.push(ValidationWarning::about(
                &resource.id,
                format!("unknown level: {}", resource.level),
            ));
        }
    }

    for test in &course.tests {
        if !levels.contains(&test.level) {
            warnings.push(ValidationWarning::about(
                &test.id,
                format!("unknown level: {}", test.level),
            ));
        }
        if test.questions.is_empty() {
            warnings.push(ValidationWarning::about(
                &test.id,
                "test has no questions and cannot be started",
            ));
        }
    }

    let counts: HashMap<&TestId, usize> =
        course.questions.iter().fold(HashMap::new(), |mut acc, q| {
            *acc.entry(&q.test).or_default() += 1;
            acc
        });
    for question in &course.questions {
        if !tests.contains(&question.test) {
            warnings.push(ValidationWarning::about(
                &question.id,
                format!("unknown test: {}", question.test),
            ));
        }
        match &question.kind {
            QuestionKind::MultipleChoice { options, correct } if *correct >= options.len() => {
                warnings.push(ValidationWarning::about(
                    &question.id,
                    format!(
                        "correct option {correct} is out of range for {} options",
                        options.len()
                    ),
                ));
            }
            QuestionKind::SingleAnswer {
                expected,
                comparison: Comparison::Matches,
                pattern_flags,
                ..
            } => {
                if let Err(e) = regex::RegexBuilder::new(expected)
                    .case_insensitive(pattern_flags.contains('i'))
                    .build()
                {
                    warnings.push(ValidationWarning::about(
                        &question.id,
                        format!("invalid pattern: {e}"),
                    ));
                }
            }
            QuestionKind::SingleAnswer {
                comparison: Comparison::Between,
                upper: None,
                ..
            } => {
                warnings.push(ValidationWarning::about(
                    &question.id,
                    "between comparison has no upper bound",
                ));
            }
            _ => {}
        }
    }
    for (test, count) in counts {
        let positions: HashSet<u32> = course
            .questions
            .iter()
            .filter(|q| &q.test == test)
            .map(|q| q.position)
            .collect();
        if positions.len() != count {
            warnings.push(ValidationWarning::about(
                test,
                "questions share a position; their order is undefined",
            ));
        }
    }

    if let Some(cycle) = prerequisite_cycle(&course.levels, &course.tests) {
        let path: Vec<&str> = cycle.iter().map(LevelId::as_str).collect();
        warnings.push(ValidationWarning {
            entity: None,
            message: format!("eligibility cycle: {}", path.join(" -> ")),
        });
    }

    warnings
}

fn duplicates<'a>(
    ids: impl Iterator<Item = &'a str>,
    kind: &str,
    warnings: &mut Vec<ValidationWarning>,
) {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            warnings.push(ValidationWarning::about(id, format!("duplicate {kind} ID: {id}")));
        }
    }
}
