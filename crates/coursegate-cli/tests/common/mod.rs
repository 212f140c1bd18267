//! Shared fixture for the engine integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use coursegate_core::config::EngineConfig;
use coursegate_core::memory::MemoryStore;
use coursegate_core::model::{Answer, Principal};
use coursegate_core::parser::parse_course_str;
use coursegate_core::traits::{EntityStore, ManualClock};
use coursegate_core::AssessmentEngine;

pub const COURSE: &str = r#"
[course]
name = "Warehouse induction"

[[groups]]
id = "warehouse"
name = "Warehouse"

[[groups]]
id = "office"
name = "Office"

[[principals]]
id = "admin"
name = "Ada Admin"
role = "administrator"

[[principals]]
id = "mgr"
name = "Morgan Manager"
role = "group_manager"
managed_groups = ["warehouse"]

[[principals]]
id = "alice"
role = "trainee"
groups = ["warehouse"]

[[principals]]
id = "bob"
role = "trainee"
groups = ["office"]

[[principals]]
id = "carol"
role = "trainee"
groups = ["warehouse"]

[[principals]]
id = "guest"
role = "guest"

[[levels]]
id = "intro"
name = "Introduction"

[[levels]]
id = "forklift"
name = "Forklift"
parent = "intro"
groups = ["warehouse"]
prerequisites = ["t-intro"]

[[levels]]
id = "practice"
name = "Practice"
parent = "intro"

[[levels]]
id = "drafts"
name = "Drafts"

[[resources]]
id = "notes"
level = "intro"
name = "Intro notes"
lock_during_test = true

[[resources]]
id = "induction-day"
level = "intro"
name = "Induction day slides"
opens_at = "2026-03-02T08:00:00Z"
closes_at = "2026-03-02T18:00:00Z"

[[tests]]
id = "t-intro"
level = "intro"
name = "Introduction test"
resit_attempts = 1
time_limit = "00:30:00"
grades = [
    { label = "Fail" },
    { threshold = 50, label = "Pass" },
    { threshold = 70, label = "Merit" },
    { threshold = 90, label = "Distinction" },
]

[[tests]]
id = "t-forklift"
level = "forklift"
name = "Forklift test"
resit_attempts = -1
result_visibility = "manual"

[[tests]]
id = "t-practice"
level = "practice"
name = "Practice quiz"
resit_attempts = -1

[[tests]]
id = "t-drafts"
level = "drafts"
name = "Draft test"

[[questions]]
id = "q1"
test = "t-intro"
type = "multiple"
prompt = "Which colour marks a pedestrian walkway?"
options = ["red", "green", "blue"]
correct = 1

[[questions]]
id = "q2"
test = "t-intro"
type = "single"
prompt = "Maximum forklift speed indoors (km/h)?"
expected = "8"
comparison = "less_than_or_equal"

[[questions]]
id = "q3"
test = "t-intro"
type = "single"
prompt = "What must be worn on the loading dock?"
expected = "hard hat"
comparison = "contains"

[[questions]]
id = "q4"
test = "t-intro"
type = "single"
prompt = "Abbreviation for protective equipment?"
expected = "^ppe$"
comparison = "matches"
flags = "i"

[[questions]]
id = "f1"
test = "t-forklift"
type = "multiple"
options = ["lower the forks", "raise the forks"]
correct = 0

[[questions]]
id = "f2"
test = "t-forklift"
type = "upload"
prompt = "Upload your eyesight certificate"

[[questions]]
id = "p1"
test = "t-practice"
type = "single"
expected = "yes"
"#;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub engine: AssessmentEngine,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let course = parse_course_str(COURSE, Path::new("fixture.toml")).unwrap();
        let store = Arc::new(MemoryStore::from_course(course));
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = AssessmentEngine::new(store.clone(), config).with_clock(clock.clone());
        Self {
            store,
            clock,
            engine,
        }
    }

    pub async fn principal(&self, id: &str) -> Principal {
        self.store.principal(&id.into()).await.unwrap().unwrap()
    }

    /// Answer `t-intro` with `correct` of its four questions right.
    pub async fn answer_intro(&self, who: &Principal, correct: usize) {
        let right = [("q1", "1"), ("q2", "7.5"), ("q3", " Always wear a Hard Hat "), ("q4", "PPE")];
        let wrong = [("q1", "0"), ("q2", "15"), ("q3", "gloves"), ("q4", "PPE kit")];
        for (i, (right, wrong)) in right.iter().zip(wrong.iter()).enumerate() {
            let (question, value) = if i < correct { right } else { wrong };
            self.engine
                .answer(who, &(*question).into(), Answer::scalar(*value))
                .await
                .unwrap();
        }
    }

    /// Start, answer and finish `t-intro`.
    pub async fn sit_intro(&self, who: &Principal, correct: usize) {
        self.engine.start(who, &"t-intro".into()).await.unwrap();
        self.answer_intro(who, correct).await;
        self.engine.finish(who, &"t-intro".into()).await.unwrap();
    }
}
