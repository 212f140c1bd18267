//! Collaborator traits: the entity store, external answer validators and the
//! clock.
//!
//! `EntityStore` is implemented by `memory::MemoryStore`; hosts with their
//! own persistence implement it against their database.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::archive::{ArchiveRow, ResultPointer};
use crate::error::StoreError;
use crate::lifecycle::AttemptMarker;
use crate::model::{
    Answer, Group, GroupId, Level, LevelId, Principal, PrincipalId, Question, QuestionId,
    Resource, ResourceId, ResultId, Test, TestId,
};

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Entity store
// ---------------------------------------------------------------------------

/// Persistence for content, archive ledger and per-attempt scratch state.
///
/// Writes to principals, groups and levels must bump `access_generation` so
/// cached access decisions are recomputed.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Monotonic counter of membership and gating changes.
    fn access_generation(&self) -> u64;

    // -- identities -------------------------------------------------------

    async fn principal(&self, id: &PrincipalId) -> StoreResult<Option<Principal>>;
    async fn put_principal(&self, principal: Principal) -> StoreResult<()>;
    async fn group(&self, id: &GroupId) -> StoreResult<Option<Group>>;
    async fn put_group(&self, group: Group) -> StoreResult<()>;

    // -- content ----------------------------------------------------------

    async fn level(&self, id: &LevelId) -> StoreResult<Option<Level>>;
    async fn levels(&self) -> StoreResult<Vec<Level>>;
    /// Children of `id` in their configured order.
    async fn children_of(&self, id: &LevelId) -> StoreResult<Vec<Level>>;
    async fn put_level(&self, level: Level) -> StoreResult<()>;
    async fn resource(&self, id: &ResourceId) -> StoreResult<Option<Resource>>;
    async fn put_resource(&self, resource: Resource) -> StoreResult<()>;
    async fn test(&self, id: &TestId) -> StoreResult<Option<Test>>;
    async fn tests(&self) -> StoreResult<Vec<Test>>;
    async fn put_test(&self, test: Test) -> StoreResult<()>;
    async fn question(&self, id: &QuestionId) -> StoreResult<Option<Question>>;
    /// Questions of `test` ordered by position.
    async fn questions_of(&self, test: &TestId) -> StoreResult<Vec<Question>>;
    /// Insert or replace a question and keep the owning test's list in sync.
    async fn put_question(&self, question: Question) -> StoreResult<()>;
    async fn remove_question(&self, id: &QuestionId) -> StoreResult<()>;

    // -- archive ledger ---------------------------------------------------

    /// Append a row. Fails with `Conflict` if its key already exists.
    async fn append_archive(&self, row: ArchiveRow) -> StoreResult<()>;
    /// Rows for one (principal, test) ordered by resit number.
    async fn archive_rows(&self, principal: &PrincipalId, test: &TestId)
        -> StoreResult<Vec<ArchiveRow>>;
    async fn archive_for_test(&self, test: &TestId) -> StoreResult<Vec<ArchiveRow>>;
    async fn all_archive_rows(&self) -> StoreResult<Vec<ArchiveRow>>;
    /// Replace an existing row. Only the override fields may differ.
    async fn replace_archive_row(&self, row: ArchiveRow) -> StoreResult<()>;
    async fn delete_archive_for_test(&self, test: &TestId) -> StoreResult<()>;

    // -- in-progress answers ----------------------------------------------

    async fn answer(&self, principal: &PrincipalId, question: &QuestionId)
        -> StoreResult<Option<Answer>>;
    async fn put_answer(
        &self,
        principal: &PrincipalId,
        question: &QuestionId,
        answer: Answer,
    ) -> StoreResult<()>;
    async fn delete_answers(&self, principal: &PrincipalId, test: &TestId) -> StoreResult<()>;
    async fn delete_answers_for_test(&self, test: &TestId) -> StoreResult<()>;

    // -- result pointers --------------------------------------------------

    async fn result(&self, principal: &PrincipalId, test: &TestId)
        -> StoreResult<Option<ResultPointer>>;
    async fn result_by_id(&self, id: &ResultId) -> StoreResult<Option<ResultPointer>>;
    async fn put_result(&self, pointer: ResultPointer) -> StoreResult<()>;
    async fn delete_result(&self, principal: &PrincipalId, test: &TestId) -> StoreResult<()>;
    async fn delete_results_for_test(&self, test: &TestId) -> StoreResult<()>;

    // -- attempt markers --------------------------------------------------

    async fn attempt(&self, principal: &PrincipalId, test: &TestId)
        -> StoreResult<Option<AttemptMarker>>;
    async fn attempts_for_test(&self, test: &TestId) -> StoreResult<Vec<AttemptMarker>>;
    async fn put_attempt(&self, marker: AttemptMarker) -> StoreResult<()>;
    async fn delete_attempts_for_test(&self, test: &TestId) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Answer validators
// ---------------------------------------------------------------------------

/// External correctness check for question types the scorer cannot judge
/// itself, such as file uploads.
pub trait AnswerValidator: Send + Sync {
    fn validate(&self, question: &Question, answer: &Answer) -> bool;
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of "now" for expiry and schedule checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}
