//! In-memory `EntityStore` with JSON snapshot persistence.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveRow, ResultPointer};
use crate::error::StoreError;
use crate::lifecycle::AttemptMarker;
use crate::model::{
    Answer, Group, GroupId, Level, LevelId, Principal, PrincipalId, Question, QuestionId,
    Resource, ResourceId, ResultId, Test, TestId,
};
use crate::parser::Course;
use crate::traits::{EntityStore, StoreResult};

/// Everything the store holds, in serialisable form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub principals: BTreeMap<PrincipalId, Principal>,
    #[serde(default)]
    pub groups: BTreeMap<GroupId, Group>,
    /// Levels in insertion order, which is also sibling order.
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default)]
    pub resources: BTreeMap<ResourceId, Resource>,
    #[serde(default)]
    pub tests: BTreeMap<TestId, Test>,
    #[serde(default)]
    pub questions: BTreeMap<QuestionId, Question>,
    #[serde(default)]
    pub archive: Vec<ArchiveRow>,
    #[serde(default)]
    pub answers: BTreeMap<PrincipalId, BTreeMap<QuestionId, Answer>>,
    #[serde(default)]
    pub results: BTreeMap<PrincipalId, BTreeMap<TestId, ResultPointer>>,
    #[serde(default)]
    pub attempts: BTreeMap<PrincipalId, BTreeMap<TestId, AttemptMarker>>,
}

/// `EntityStore` backed by process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<Snapshot>,
    generation: AtomicU64,
    fail_appends: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            ..Self::default()
        }
    }

    /// Seed a store with a parsed course's content and identities.
    pub fn from_course(course: Course) -> Self {
        Self::from_snapshot(Snapshot {
            principals: course
                .principals
                .into_iter()
                .map(|p| (p.id.clone(), p))
                .collect(),
            groups: course.groups.into_iter().map(|g| (g.id.clone(), g)).collect(),
            levels: course.levels,
            resources: course
                .resources
                .into_iter()
                .map(|r| (r.id.clone(), r))
                .collect(),
            tests: course.tests.into_iter().map(|t| (t.id.clone(), t)).collect(),
            questions: course
                .questions
                .into_iter()
                .map(|q| (q.id.clone(), q))
                .collect(),
            ..Snapshot::default()
        })
    }

    /// A copy of the current contents.
    pub fn snapshot(&self) -> Snapshot {
        self.read().clone()
    }

    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.read())?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write state: {}", path.display()))
    }

    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read state: {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse state: {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Make every subsequent `append_archive` fail with a backend error.
    pub fn fail_archive_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> RwLockReadGuard<'_, Snapshot> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Snapshot> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

fn sort_rows(rows: &mut [ArchiveRow]) {
    rows.sort_by(|a, b| {
        (a.principal(), a.test(), a.resit_number()).cmp(&(b.principal(), b.test(), b.resit_number()))
    });
}

#[async_trait]
impl EntityStore for MemoryStore {
    fn access_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    async fn principal(&self, id: &PrincipalId) -> StoreResult<Option<Principal>> {
        Ok(self.read().principals.get(id).cloned())
    }

    async fn put_principal(&self, principal: Principal) -> StoreResult<()> {
        self.write()
            .principals
            .insert(principal.id.clone(), principal);
        self.bump_generation();
        Ok(())
    }

    async fn group(&self, id: &GroupId) -> StoreResult<Option<Group>> {
        let state = self.read();
        Ok(state.groups.get(id).map(|group| Group {
            members: state
                .principals
                .values()
                .filter(|p| p.access_groups().is_some_and(|groups| groups.contains(id)))
                .map(|p| p.id.clone())
                .collect(),
            ..group.clone()
        }))
    }

    /// Membership lives on principals, so this never changes gating.
    async fn put_group(&self, group: Group) -> StoreResult<()> {
        self.write().groups.insert(group.id.clone(), group);
        Ok(())
    }

    async fn level(&self, id: &LevelId) -> StoreResult<Option<Level>> {
        Ok(self.read().levels.iter().find(|l| &l.id == id).cloned())
    }

    async fn levels(&self) -> StoreResult<Vec<Level>> {
        Ok(self.read().levels.clone())
    }

    async fn children_of(&self, id: &LevelId) -> StoreResult<Vec<Level>> {
        let state = self.read();
        let parent = state
            .levels
            .iter()
            .find(|l| &l.id == id)
            .ok_or_else(|| StoreError::not_found("level", id))?;
        Ok(parent
            .children
            .iter()
            .filter_map(|child| state.levels.iter().find(|l| &l.id == child).cloned())
            .collect())
    }

    async fn put_level(&self, level: Level) -> StoreResult<()> {
        {
            let mut state = self.write();
            match state.levels.iter_mut().find(|l| l.id == level.id) {
                Some(existing) => *existing = level,
                None => state.levels.push(level),
            }
        }
        self.bump_generation();
        Ok(())
    }

    async fn resource(&self, id: &ResourceId) -> StoreResult<Option<Resource>> {
        Ok(self.read().resources.get(id).cloned())
    }

    async fn put_resource(&self, resource: Resource) -> StoreResult<()> {
        self.write().resources.insert(resource.id.clone(), resource);
        Ok(())
    }

    async fn test(&self, id: &TestId) -> StoreResult<Option<Test>> {
        Ok(self.read().tests.get(id).cloned())
    }

    async fn tests(&self) -> StoreResult<Vec<Test>> {
        Ok(self.read().tests.values().cloned().collect())
    }

    async fn put_test(&self, test: Test) -> StoreResult<()> {
        self.write().tests.insert(test.id.clone(), test);
        Ok(())
    }

    async fn question(&self, id: &QuestionId) -> StoreResult<Option<Question>> {
        Ok(self.read().questions.get(id).cloned())
    }

    async fn questions_of(&self, test: &TestId) -> StoreResult<Vec<Question>> {
        let mut questions: Vec<Question> = self
            .read()
            .questions
            .values()
            .filter(|q| &q.test == test)
            .cloned()
            .collect();
        questions.sort_by_key(|q| q.position);
        Ok(questions)
    }

    async fn put_question(&self, question: Question) -> StoreResult<()> {
        let mut state = self.write();
        let Snapshot {
            tests, questions, ..
        } = &mut *state;
        let test = tests
            .get_mut(&question.test)
            .ok_or_else(|| StoreError::not_found("test", &question.test))?;
        questions.insert(question.id.clone(), question);

        let mut owned: Vec<&Question> = questions.values().filter(|q| q.test == test.id).collect();
        owned.sort_by_key(|q| q.position);
        test.questions = owned.into_iter().map(|q| q.id.clone()).collect();
        Ok(())
    }

    async fn remove_question(&self, id: &QuestionId) -> StoreResult<()> {
        let mut state = self.write();
        let question = state
            .questions
            .remove(id)
            .ok_or_else(|| StoreError::not_found("question", id))?;
        if let Some(test) = state.tests.get_mut(&question.test) {
            test.questions.retain(|q| q != id);
        }
        Ok(())
    }

    async fn append_archive(&self, row: ArchiveRow) -> StoreResult<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("archive append rejected".into()));
        }
        let mut state = self.write();
        let duplicate = state.archive.iter().any(|r| {
            r.principal() == row.principal()
                && r.test() == row.test()
                && r.resit_number() == row.resit_number()
        });
        if duplicate {
            return Err(StoreError::Conflict(format!(
                "archive row ({}, {}, {}) already exists",
                row.principal(),
                row.test(),
                row.resit_number()
            )));
        }
        state.archive.push(row);
        Ok(())
    }

    async fn archive_rows(
        &self,
        principal: &PrincipalId,
        test: &TestId,
    ) -> StoreResult<Vec<ArchiveRow>> {
        let mut rows: Vec<ArchiveRow> = self
            .read()
            .archive
            .iter()
            .filter(|r| r.principal() == principal && r.test() == test)
            .cloned()
            .collect();
        sort_rows(&mut rows);
        Ok(rows)
    }

    async fn archive_for_test(&self, test: &TestId) -> StoreResult<Vec<ArchiveRow>> {
        let mut rows: Vec<ArchiveRow> = self
            .read()
            .archive
            .iter()
            .filter(|r| r.test() == test)
            .cloned()
            .collect();
        sort_rows(&mut rows);
        Ok(rows)
    }

    async fn all_archive_rows(&self) -> StoreResult<Vec<ArchiveRow>> {
        let mut rows = self.read().archive.clone();
        sort_rows(&mut rows);
        Ok(rows)
    }

    async fn replace_archive_row(&self, row: ArchiveRow) -> StoreResult<()> {
        let mut state = self.write();
        let existing = state
            .archive
            .iter_mut()
            .find(|r| {
                r.principal() == row.principal()
                    && r.test() == row.test()
                    && r.resit_number() == row.resit_number()
            })
            .ok_or_else(|| {
                StoreError::not_found(
                    "archive row",
                    format!("{}/{}/{}", row.principal(), row.test(), row.resit_number()),
                )
            })?;
        if !existing.same_record(&row) {
            return Err(StoreError::Immutable(format!(
                "only the percentage, grade and passed flag of ({}, {}, {}) may change",
                row.principal(),
                row.test(),
                row.resit_number()
            )));
        }
        *existing = row;
        Ok(())
    }

    async fn delete_archive_for_test(&self, test: &TestId) -> StoreResult<()> {
        self.write().archive.retain(|r| r.test() != test);
        Ok(())
    }

    async fn answer(
        &self,
        principal: &PrincipalId,
        question: &QuestionId,
    ) -> StoreResult<Option<Answer>> {
        Ok(self
            .read()
            .answers
            .get(principal)
            .and_then(|answers| answers.get(question))
            .cloned())
    }

    async fn put_answer(
        &self,
        principal: &PrincipalId,
        question: &QuestionId,
        answer: Answer,
    ) -> StoreResult<()> {
        self.write()
            .answers
            .entry(principal.clone())
            .or_default()
            .insert(question.clone(), answer);
        Ok(())
    }

    async fn delete_answers(&self, principal: &PrincipalId, test: &TestId) -> StoreResult<()> {
        let mut state = self.write();
        let Snapshot {
            questions, answers, ..
        } = &mut *state;
        if let Some(given) = answers.get_mut(principal) {
            given.retain(|q, _| questions.get(q).is_some_and(|q| &q.test != test));
        }
        Ok(())
    }

    async fn delete_answers_for_test(&self, test: &TestId) -> StoreResult<()> {
        let mut state = self.write();
        let Snapshot {
            questions, answers, ..
        } = &mut *state;
        for given in answers.values_mut() {
            given.retain(|q, _| questions.get(q).is_some_and(|q| &q.test != test));
        }
        Ok(())
    }

    async fn result(
        &self,
        principal: &PrincipalId,
        test: &TestId,
    ) -> StoreResult<Option<ResultPointer>> {
        Ok(self
            .read()
            .results
            .get(principal)
            .and_then(|results| results.get(test))
            .cloned())
    }

    async fn result_by_id(&self, id: &ResultId) -> StoreResult<Option<ResultPointer>> {
        Ok(self
            .read()
            .results
            .values()
            .flat_map(BTreeMap::values)
            .find(|p| &p.id == id)
            .cloned())
    }

    async fn put_result(&self, pointer: ResultPointer) -> StoreResult<()> {
        self.write()
            .results
            .entry(pointer.principal.clone())
            .or_default()
            .insert(pointer.test.clone(), pointer);
        Ok(())
    }

    async fn delete_result(&self, principal: &PrincipalId, test: &TestId) -> StoreResult<()> {
        if let Some(results) = self.write().results.get_mut(principal) {
            results.remove(test);
        }
        Ok(())
    }

    async fn delete_results_for_test(&self, test: &TestId) -> StoreResult<()> {
        for results in self.write().results.values_mut() {
            results.remove(test);
        }
        Ok(())
    }

    async fn attempt(
        &self,
        principal: &PrincipalId,
        test: &TestId,
    ) -> StoreResult<Option<AttemptMarker>> {
        Ok(self
            .read()
            .attempts
            .get(principal)
            .and_then(|attempts| attempts.get(test))
            .cloned())
    }

    async fn attempts_for_test(&self, test: &TestId) -> StoreResult<Vec<AttemptMarker>> {
        Ok(self
            .read()
            .attempts
            .values()
            .filter_map(|attempts| attempts.get(test).cloned())
            .collect())
    }

    async fn put_attempt(&self, marker: AttemptMarker) -> StoreResult<()> {
        self.write()
            .attempts
            .entry(marker.principal.clone())
            .or_default()
            .insert(marker.test.clone(), marker);
        Ok(())
    }

    async fn delete_attempts_for_test(&self, test: &TestId) -> StoreResult<()> {
        for attempts in self.write().attempts.values_mut() {
            attempts.remove(test);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::fixtures::row;
    use crate::model::{QuestionKind, Role};

    fn question(id: &str, test: &str, position: u32) -> Question {
        Question {
            id: id.into(),
            test: test.into(),
            position,
            prompt: String::new(),
            kind: QuestionKind::Upload,
            trim_answer: None,
        }
    }

    #[tokio::test]
    async fn membership_writes_bump_generation() {
        let store = MemoryStore::new();
        let before = store.access_generation();
        store
            .put_principal(Principal::new("u1", "U1", Role::Guest))
            .await
            .unwrap();
        assert!(store.access_generation() > before);

        let after_principal = store.access_generation();
        store.put_test(Test::new("t1", "l1", "T1")).await.unwrap();
        assert_eq!(store.access_generation(), after_principal);
    }

    #[tokio::test]
    async fn group_members_follow_principal_roles() {
        let store = MemoryStore::new();
        store
            .put_principal(Principal::new(
                "u1",
                "U1",
                Role::Trainee {
                    groups: [GroupId::from("g1")].into(),
                },
            ))
            .await
            .unwrap();
        store
            .put_principal(Principal::new(
                "m1",
                "M1",
                Role::GroupManager {
                    managed_groups: [GroupId::from("g1")].into(),
                },
            ))
            .await
            .unwrap();

        let before = store.access_generation();
        store
            .put_group(Group {
                id: "g1".into(),
                name: "G1".into(),
                members: vec!["stale".into()],
                colour: None,
            })
            .await
            .unwrap();
        assert_eq!(store.access_generation(), before);

        let group = store.group(&"g1".into()).await.unwrap().unwrap();
        assert_eq!(group.members, vec![PrincipalId::from("m1"), PrincipalId::from("u1")]);
    }

    #[tokio::test]
    async fn removed_questions_leave_no_answers_behind() {
        let store = MemoryStore::new();
        store.put_test(Test::new("t1", "l1", "T1")).await.unwrap();
        store.put_question(question("q1", "t1", 1)).await.unwrap();
        store.put_question(question("q2", "t1", 2)).await.unwrap();

        let u1 = PrincipalId::from("u1");
        for q in ["q1", "q2"] {
            store
                .put_answer(&u1, &q.into(), Answer::scalar("x"))
                .await
                .unwrap();
        }
        store.remove_question(&"q2".into()).await.unwrap();
        store.delete_answers(&u1, &"t1".into()).await.unwrap();

        assert!(store.answer(&u1, &"q1".into()).await.unwrap().is_none());
        assert!(store.answer(&u1, &"q2".into()).await.unwrap().is_none());

        store
            .put_answer(&u1, &"q9".into(), Answer::scalar("orphan"))
            .await
            .unwrap();
        store.delete_answers_for_test(&"t1".into()).await.unwrap();
        assert!(store.answer(&u1, &"q9".into()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_archive_keys_conflict() {
        let store = MemoryStore::new();
        store.append_archive(row("u1", "t1", 0, 50)).await.unwrap();
        let err = store
            .append_archive(row("u1", "t1", 0, 70))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn replacement_may_only_touch_override_fields() {
        let store = MemoryStore::new();
        let original = row("u1", "t1", 0, 40);
        store.append_archive(original.clone()).await.unwrap();

        let changed_marks = row("u1", "t1", 0, 90);
        let err = store.replace_archive_row(changed_marks).await.unwrap_err();
        assert!(matches!(err, StoreError::Immutable(_)));

        let table = crate::scoring::GradeTable::default();
        store
            .replace_archive_row(original.with_override(75, table.grade(75)))
            .await
            .unwrap();
        let rows = store.archive_rows(&"u1".into(), &"t1".into()).await.unwrap();
        assert_eq!(rows[0].percentage(), 75);
        assert_eq!(rows[0].mark(), 40);
    }

    #[tokio::test]
    async fn questions_stay_ordered_on_the_test() {
        let store = MemoryStore::new();
        store.put_test(Test::new("t1", "l1", "T1")).await.unwrap();
        store.put_question(question("b", "t1", 2)).await.unwrap();
        store.put_question(question("a", "t1", 1)).await.unwrap();

        let test = store.test(&"t1".into()).await.unwrap().unwrap();
        assert_eq!(test.questions, vec![QuestionId::from("a"), QuestionId::from("b")]);

        store.remove_question(&"a".into()).await.unwrap();
        let test = store.test(&"t1".into()).await.unwrap().unwrap();
        assert_eq!(test.questions, vec![QuestionId::from("b")]);

        let err = store.put_question(question("c", "ghost", 1)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn delete_answers_is_scoped_to_the_test() {
        let store = MemoryStore::new();
        store.put_test(Test::new("t1", "l1", "T1")).await.unwrap();
        store.put_test(Test::new("t2", "l2", "T2")).await.unwrap();
        store.put_question(question("q1", "t1", 1)).await.unwrap();
        store.put_question(question("q2", "t2", 1)).await.unwrap();

        let u1 = PrincipalId::from("u1");
        store
            .put_answer(&u1, &"q1".into(), Answer::scalar("x"))
            .await
            .unwrap();
        store
            .put_answer(&u1, &"q2".into(), Answer::scalar("y"))
            .await
            .unwrap();
        store.delete_answers(&u1, &"t1".into()).await.unwrap();

        assert!(store.answer(&u1, &"q1".into()).await.unwrap().is_none());
        assert!(store.answer(&u1, &"q2".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn json_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = MemoryStore::new();
        store.put_level(Level::new("l1", "Level 1")).await.unwrap();
        store.append_archive(row("u1", "t1", 0, 64)).await.unwrap();
        store.save_json(&path).unwrap();

        let loaded = MemoryStore::load_json(&path).unwrap();
        assert!(loaded.level(&"l1".into()).await.unwrap().is_some());
        assert_eq!(loaded.all_archive_rows().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn injected_append_failures() {
        let store = MemoryStore::new();
        store.fail_archive_appends(true);
        let err = store.append_archive(row("u1", "t1", 0, 1)).await.unwrap_err();
        assert!(err.is_retryable());
        store.fail_archive_appends(false);
        store.append_archive(row("u1", "t1", 0, 1)).await.unwrap();
    }
}
