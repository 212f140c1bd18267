//! Central assessment engine.
//!
//! Applies the attempt state machine against the entity store: access checks,
//! start/answer/finish/resit/reset, scoring into the archive, result
//! pointers, overrides and leaderboards. Every operation takes the acting
//! principal explicitly.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use tokio::sync::{broadcast, RwLock};

use crate::access::{AccessCache, AccessEvaluator, Decision, Denial, DenialCode, Entity};
use crate::archive::{self, ArchiveRow, ResultPointer};
use crate::config::EngineConfig;
use crate::eligibility::{self, Eligibility};
use crate::error::EngineError;
use crate::events::{EventBus, LifecycleEvent};
use crate::lifecycle::{AttemptMarker, Transition};
use crate::model::{
    Answer, EligibilityConfig, Level, LevelId, Principal, PrincipalId, Question, QuestionId,
    QuestionKind, ResultId, Role, Test, TestId,
};
use crate::rank::{self, Ranked, TotalScore};
use crate::scoring::{GradeTable, Scorer};
use crate::traits::{AnswerValidator, Clock, EntityStore, SystemClock};

type EngineResult<T> = Result<T, EngineError>;

/// Per-test and per-attempt async locks.
///
/// Start/Answer/Finish/Resit hold the test lock shared and Reset holds it
/// exclusive. Answers share the attempt lock; every other transition takes
/// it exclusive. Locks are always taken test first.
#[derive(Debug, Default)]
struct KeyedLocks {
    tests: Mutex<HashMap<TestId, Arc<RwLock<()>>>>,
    attempts: Mutex<HashMap<(PrincipalId, TestId), Arc<RwLock<()>>>>,
}

impl KeyedLocks {
    fn test(&self, test: &TestId) -> Arc<RwLock<()>> {
        let mut tests = self.tests.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(tests.entry(test.clone()).or_default())
    }

    fn attempt(&self, principal: &PrincipalId, test: &TestId) -> Arc<RwLock<()>> {
        let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            attempts
                .entry((principal.clone(), test.clone()))
                .or_default(),
        )
    }
}

/// The assessment engine.
pub struct AssessmentEngine {
    store: Arc<dyn EntityStore>,
    clock: Arc<dyn Clock>,
    scorer: Scorer,
    config: EngineConfig,
    cache: AccessCache,
    locks: KeyedLocks,
    events: EventBus,
}

impl AssessmentEngine {
    pub fn new(store: Arc<dyn EntityStore>, config: EngineConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            scorer: Scorer::new(config.trim_answers),
            events: EventBus::new(config.event_capacity),
            cache: AccessCache::new(),
            locks: KeyedLocks::default(),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register an external validator for an upload or custom question type.
    pub fn with_validator(
        mut self,
        type_name: impl Into<String>,
        validator: Arc<dyn AnswerValidator>,
    ) -> Self {
        self.scorer.register(type_name, validator);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // -- access -----------------------------------------------------------

    fn evaluator(&self) -> AccessEvaluator<'_> {
        let evaluator = AccessEvaluator::new(self.store.as_ref(), &self.config, self.now());
        if self.config.cache_access {
            evaluator.with_cache(&self.cache)
        } else {
            evaluator
        }
    }

    /// Evaluate access without side effects.
    pub async fn can_access(&self, principal: &Principal, entity: &Entity) -> Decision {
        self.evaluator().can_access(principal, entity).await
    }

    /// Evaluate access; when the check finds a lapsed attempt, finish it
    /// before returning `TimeExpired`.
    pub async fn access(&self, principal: &Principal, entity: &Entity) -> Decision {
        let decision = self.can_access(principal, entity).await;
        if let Decision::TimeExpired { test } = &decision {
            self.force_finish(principal, test).await;
        }
        decision
    }

    /// Test ids whose level gate `principal` passes.
    pub async fn reachable_tests(&self, principal: &Principal) -> EngineResult<BTreeSet<TestId>> {
        Ok(self
            .cache
            .reachable_tests(self.store.as_ref(), principal)
            .await?)
    }

    /// Children of `level` that `principal` may open, in configured order.
    pub async fn visible_children(
        &self,
        principal: &Principal,
        level: &LevelId,
    ) -> EngineResult<Vec<Level>> {
        let mut visible = Vec::new();
        for child in self.store.children_of(level).await? {
            let entity = Entity::Level(child.id.clone());
            if self.can_access(principal, &entity).await.is_allowed() {
                visible.push(child);
            }
        }
        Ok(visible)
    }

    pub async fn is_eligible(
        &self,
        principal: &Principal,
        level: &LevelId,
    ) -> EngineResult<Eligibility> {
        let level = self.load_level(level).await?;
        Ok(eligibility::is_eligible(self.store.as_ref(), principal, &level).await?)
    }

    // -- lifecycle --------------------------------------------------------

    /// Current marker for `principal` on `test`.
    pub async fn attempt_state(
        &self,
        principal: &PrincipalId,
        test: &TestId,
    ) -> EngineResult<AttemptMarker> {
        self.marker(principal, test).await
    }

    /// NotStarted -> InProgress.
    pub async fn start(&self, principal: &Principal, test: &TestId) -> EngineResult<AttemptMarker> {
        let _test_guard = self.locks.test(test).read_owned().await;
        let _attempt_guard = self.locks.attempt(&principal.id, test).write_owned().await;

        self.load_test(test).await?;
        if let Decision::Deny(denial) = self.can_access(principal, &Entity::Test(test.clone())).await
        {
            return Err(EngineError::Denied(denial));
        }
        let mut marker = self.marker(&principal.id, test).await?;
        marker.guard(Transition::Start)?;
        if self.store.questions_of(test).await?.is_empty() {
            return Err(EngineError::EmptyTest(test.clone()));
        }

        marker.begin(self.now());
        self.store.put_attempt(marker.clone()).await?;

        tracing::info!(principal = %principal.id, %test, "attempt started");
        self.events.emit(LifecycleEvent::AttemptStarted {
            principal: principal.id.clone(),
            test: test.clone(),
        });
        Ok(marker)
    }

    /// Save or replace the answer to one question of a running attempt.
    ///
    /// If the attempt has run out of time it is finished with the answers
    /// saved so far and `TimeExpired` is returned.
    pub async fn answer(
        &self,
        principal: &Principal,
        question: &QuestionId,
        answer: Answer,
    ) -> EngineResult<()> {
        let question = self
            .store
            .question(question)
            .await?
            .ok_or_else(|| EngineError::not_found("question", question))?;
        check_answer_shape(&question, &answer)?;
        let test = question.test.clone();

        {
            let _test_guard = self.locks.test(&test).read_owned().await;
            let _attempt_guard = self.locks.attempt(&principal.id, &test).read_owned().await;

            let expired = match self.can_access(principal, &Entity::Test(test.clone())).await {
                Decision::Allow => self.has_expired(principal, &test).await?,
                Decision::Deny(denial) => return Err(EngineError::Denied(denial)),
                Decision::TimeExpired { .. } => true,
            };
            if !expired {
                self.marker(&principal.id, &test)
                    .await?
                    .guard(Transition::Answer)?;
                self.store
                    .put_answer(&principal.id, &question.id, answer)
                    .await?;
                tracing::debug!(principal = %principal.id, question = %question.id, "answer saved");
                return Ok(());
            }
        }

        self.force_finish(principal, &test).await;
        Err(EngineError::TimeExpired { test })
    }

    /// InProgress -> Finished: score, append to the archive, point the
    /// result at the new row and clear the saved answers.
    pub async fn finish(&self, principal: &Principal, test: &TestId) -> EngineResult<ArchiveRow> {
        let _test_guard = self.locks.test(test).read_owned().await;
        self.finish_locked(principal, test, false).await
    }

    async fn force_finish(&self, principal: &Principal, test: &TestId) -> Option<ArchiveRow> {
        let _test_guard = self.locks.test(test).read_owned().await;
        match self.finish_locked(principal, test, true).await {
            Ok(row) => Some(row),
            Err(EngineError::InvalidTransition { state, .. }) => {
                tracing::debug!(principal = %principal.id, %test, %state, "expired attempt already closed");
                None
            }
            Err(e) => {
                tracing::error!(principal = %principal.id, %test, "forced finish failed: {e}");
                None
            }
        }
    }

    async fn finish_locked(
        &self,
        principal: &Principal,
        test_id: &TestId,
        forced: bool,
    ) -> EngineResult<ArchiveRow> {
        let _attempt_guard = self
            .locks
            .attempt(&principal.id, test_id)
            .write_owned()
            .await;

        let test = self.load_test(test_id).await?;
        let mut marker = self.marker(&principal.id, test_id).await?;
        marker.guard(Transition::Finish)?;
        let now = self.now();
        if forced && !marker.is_expired(test.time_limit(), now) {
            // Finished and restarted by another session since the expiry was seen.
            return Err((Transition::Finish, marker.state).into());
        }

        let questions = self.store.questions_of(test_id).await?;
        let answers = self.saved_answers(&principal.id, &questions).await?;
        let card = self.scorer.score(&questions, &answers, self.grade_table(&test));

        let history = self.store.archive_rows(&principal.id, test_id).await?;
        let duration = marker
            .started_at
            .map(|started| (now - started).num_seconds())
            .unwrap_or_default();
        let row = ArchiveRow::from_score(
            principal.id.clone(),
            test_id.clone(),
            archive::next_resit_number(&history),
            now,
            duration,
            &card,
        );
        self.store
            .append_archive(row.clone())
            .await
            .map_err(EngineError::Persistence)?;

        marker.complete(now);
        self.store.put_attempt(marker).await?;
        self.store
            .put_result(ResultPointer::new(&row, test.result_visibility, now))
            .await?;
        self.store.delete_answers(&principal.id, test_id).await?;

        tracing::info!(
            principal = %principal.id,
            test = %test_id,
            resit_number = row.resit_number(),
            mark = row.mark(),
            out_of = row.out_of(),
            percentage = row.percentage(),
            grade = row.grade(),
            forced,
            "attempt finished"
        );
        self.events.emit(LifecycleEvent::AttemptFinished {
            principal: principal.id.clone(),
            test: test_id.clone(),
            resit_number: row.resit_number(),
            percentage: row.percentage(),
            passed: row.passed(),
            forced,
        });
        Ok(row)
    }

    /// Finished -> NotStarted, consuming one resit. Archive history is kept.
    pub async fn resit(&self, principal: &Principal, test_id: &TestId) -> EngineResult<AttemptMarker> {
        let _test_guard = self.locks.test(test_id).read_owned().await;
        let _attempt_guard = self
            .locks
            .attempt(&principal.id, test_id)
            .write_owned()
            .await;

        let test = self.load_test(test_id).await?;
        let mut marker = self.marker(&principal.id, test_id).await?;
        marker.guard(Transition::Resit)?;
        if !test.resit_attempts.permits_resit(marker.times_resat) {
            return Err(EngineError::AttemptsExhausted {
                test: test_id.clone(),
            });
        }

        self.store.delete_result(&principal.id, test_id).await?;
        marker.rearm();
        self.store.put_attempt(marker.clone()).await?;

        let remaining = marker.remaining_attempts(test.resit_attempts);
        tracing::info!(
            principal = %principal.id,
            test = %test_id,
            times_resat = marker.times_resat,
            ?remaining,
            "attempt resat"
        );
        self.events.emit(LifecycleEvent::AttemptResat {
            principal: principal.id.clone(),
            test: test_id.clone(),
            times_resat: marker.times_resat,
            remaining,
        });
        Ok(marker)
    }

    /// Delete every attempt, answer, result and archive row for `test`.
    pub async fn reset(&self, operator: &Principal, test: &TestId) -> EngineResult<()> {
        if !operator.is_admin() {
            return Err(EngineError::Denied(Denial::administrator_only()));
        }
        let _test_guard = self.locks.test(test).write_owned().await;
        self.load_test(test).await?;

        self.store.delete_answers_for_test(test).await?;
        self.store.delete_results_for_test(test).await?;
        self.store.delete_archive_for_test(test).await?;
        self.store.delete_attempts_for_test(test).await?;

        tracing::info!(operator = %operator.id, %test, "test reset");
        self.events.emit(LifecycleEvent::TestReset { test: test.clone() });
        Ok(())
    }

    // -- results ----------------------------------------------------------

    /// Set the percentage of the trainee's latest archive row and reband it.
    pub async fn override_percentage(
        &self,
        operator: &Principal,
        trainee: &PrincipalId,
        test_id: &TestId,
        percentage: u32,
    ) -> EngineResult<ArchiveRow> {
        if percentage > 100 {
            return Err(EngineError::InvalidOverride(format!(
                "percentage {percentage} exceeds 100"
            )));
        }
        self.authorise_operator(operator, trainee).await?;

        let _test_guard = self.locks.test(test_id).read_owned().await;
        let _attempt_guard = self.locks.attempt(trainee, test_id).write_owned().await;

        let test = self.load_test(test_id).await?;
        let history = self.store.archive_rows(trainee, test_id).await?;
        let latest = archive::latest(&history).ok_or_else(|| {
            EngineError::not_found("archive row", format!("{trainee}/{test_id}"))
        })?;
        let updated = latest.with_override(percentage, self.grade_table(&test).grade(percentage));
        self.store.replace_archive_row(updated.clone()).await?;

        tracing::info!(
            operator = %operator.id,
            %trainee,
            test = %test_id,
            resit_number = updated.resit_number(),
            from = latest.percentage(),
            to = percentage,
            "percentage overridden"
        );
        Ok(updated)
    }

    /// Make a manually released result visible to its trainee.
    pub async fn release_result(
        &self,
        operator: &Principal,
        trainee: &PrincipalId,
        test: &TestId,
    ) -> EngineResult<ResultPointer> {
        self.authorise_operator(operator, trainee).await?;
        let mut pointer = self
            .store
            .result(trainee, test)
            .await?
            .ok_or_else(|| EngineError::not_found("result", format!("{trainee}/{test}")))?;
        if !pointer.released {
            pointer.released = true;
            self.store.put_result(pointer.clone()).await?;
            tracing::info!(operator = %operator.id, %trainee, %test, "result released");
        }
        Ok(pointer)
    }

    /// The archive row a result pointer refers to, if `viewer` may see it.
    pub async fn result_row(&self, viewer: &Principal, id: &ResultId) -> EngineResult<ArchiveRow> {
        if let Decision::Deny(denial) = self.can_access(viewer, &Entity::Result(id.clone())).await {
            return Err(EngineError::Denied(denial));
        }
        let pointer = self
            .store
            .result_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("result", id))?;
        self.store
            .archive_rows(&pointer.principal, &pointer.test)
            .await?
            .into_iter()
            .find(|row| row.resit_number() == pointer.resit_number)
            .ok_or_else(|| {
                EngineError::not_found(
                    "archive row",
                    format!("{}/{}/{}", pointer.principal, pointer.test, pointer.resit_number),
                )
            })
    }

    /// A trainee's archive history for one test, oldest first.
    ///
    /// A trainee viewing their own history does not see the row behind an
    /// unreleased result.
    pub async fn history(
        &self,
        viewer: &Principal,
        trainee: &PrincipalId,
        test: &TestId,
    ) -> EngineResult<Vec<ArchiveRow>> {
        if let Decision::Deny(denial) =
            self.can_access(viewer, &Entity::Trainee(trainee.clone())).await
        {
            return Err(EngineError::Denied(denial));
        }
        let mut rows = self.store.archive_rows(trainee, test).await?;
        if &viewer.id == trainee && matches!(viewer.role, Role::Trainee { .. }) {
            if let Some(pointer) = self.store.result(trainee, test).await? {
                if !pointer.released {
                    rows.retain(|row| row.resit_number() != pointer.resit_number);
                }
            }
        }
        Ok(rows)
    }

    pub async fn test_leaderboard(&self, test: &TestId) -> EngineResult<Vec<Ranked<ArchiveRow>>> {
        self.load_test(test).await?;
        let rows = self.store.archive_for_test(test).await?;
        Ok(rank::test_leaderboard(&rows))
    }

    pub async fn overall_leaderboard(&self) -> EngineResult<Vec<Ranked<TotalScore>>> {
        let rows = self.store.all_archive_rows().await?;
        Ok(rank::overall_leaderboard(&rows))
    }

    // -- structure --------------------------------------------------------

    /// Fails with `TestLocked` once anyone has started `test`.
    pub async fn ensure_structurally_mutable(&self, test: &TestId) -> EngineResult<()> {
        let engaged = self
            .store
            .attempts_for_test(test)
            .await?
            .iter()
            .any(AttemptMarker::has_engaged);
        if engaged || !self.store.archive_for_test(test).await?.is_empty() {
            return Err(EngineError::TestLocked(test.clone()));
        }
        Ok(())
    }

    /// Add or replace a question of a test nobody has started.
    pub async fn save_question(&self, operator: &Principal, question: Question) -> EngineResult<()> {
        if !operator.is_admin() {
            return Err(EngineError::Denied(Denial::administrator_only()));
        }
        let _test_guard = self.locks.test(&question.test).write_owned().await;
        self.load_test(&question.test).await?;
        self.ensure_structurally_mutable(&question.test).await?;
        tracing::info!(operator = %operator.id, question = %question.id, test = %question.test, "question saved");
        self.store.put_question(question).await?;
        Ok(())
    }

    /// Remove a question from a test nobody has started.
    pub async fn remove_question(&self, operator: &Principal, id: &QuestionId) -> EngineResult<()> {
        if !operator.is_admin() {
            return Err(EngineError::Denied(Denial::administrator_only()));
        }
        let question = self
            .store
            .question(id)
            .await?
            .ok_or_else(|| EngineError::not_found("question", id))?;
        let _test_guard = self.locks.test(&question.test).write_owned().await;
        self.ensure_structurally_mutable(&question.test).await?;
        self.store.remove_question(id).await?;
        tracing::info!(operator = %operator.id, question = %id, test = %question.test, "question removed");
        Ok(())
    }

    /// Replace a level's prerequisites, rejecting configurations in which
    /// levels would require each other.
    pub async fn set_eligibility(
        &self,
        operator: &Principal,
        level: &LevelId,
        eligibility: Option<EligibilityConfig>,
    ) -> EngineResult<()> {
        if !operator.is_admin() {
            return Err(EngineError::Denied(Denial::administrator_only()));
        }
        let mut levels = self.store.levels().await?;
        let target = levels
            .iter_mut()
            .find(|l| &l.id == level)
            .ok_or_else(|| EngineError::not_found("level", level))?;
        target.eligibility = eligibility;
        let updated = target.clone();

        let tests = self.store.tests().await?;
        if let Some(path) = eligibility::prerequisite_cycle(&levels, &tests) {
            return Err(EngineError::EligibilityCycle { path });
        }
        self.store.put_level(updated).await?;
        tracing::info!(operator = %operator.id, %level, "eligibility updated");
        Ok(())
    }

    // -- helpers ----------------------------------------------------------

    async fn authorise_operator(&self, operator: &Principal, trainee: &PrincipalId) -> EngineResult<()> {
        match operator.role {
            Role::Administrator => Ok(()),
            Role::GroupManager { .. } => {
                match self.can_access(operator, &Entity::Trainee(trainee.clone())).await {
                    Decision::Deny(denial) => Err(EngineError::Denied(denial)),
                    _ => Ok(()),
                }
            }
            Role::Trainee { .. } | Role::Guest => Err(EngineError::Denied(Denial::new(
                DenialCode::AdministratorOnly,
                "only an administrator or the trainee's group manager may do this",
            ))),
        }
    }

    async fn has_expired(&self, principal: &Principal, test: &TestId) -> EngineResult<bool> {
        let test = self.load_test(test).await?;
        let marker = self.marker(&principal.id, &test.id).await?;
        Ok(marker.is_expired(test.time_limit(), self.now()))
    }

    async fn saved_answers(
        &self,
        principal: &PrincipalId,
        questions: &[Question],
    ) -> EngineResult<HashMap<QuestionId, Answer>> {
        let lookups = questions.iter().map(|q| async move {
            let answer = self.store.answer(principal, &q.id).await?;
            Ok::<_, EngineError>(answer.map(|a| (q.id.clone(), a)))
        });
        Ok(try_join_all(lookups).await?.into_iter().flatten().collect())
    }

    fn grade_table<'a>(&'a self, test: &'a Test) -> &'a GradeTable {
        test.grade_table
            .as_ref()
            .unwrap_or(&self.config.default_grade_table)
    }

    async fn marker(&self, principal: &PrincipalId, test: &TestId) -> EngineResult<AttemptMarker> {
        Ok(self
            .store
            .attempt(principal, test)
            .await?
            .unwrap_or_else(|| AttemptMarker::fresh(principal.clone(), test.clone())))
    }

    async fn load_test(&self, id: &TestId) -> EngineResult<Test> {
        self.store
            .test(id)
            .await?
            .ok_or_else(|| EngineError::not_found("test", id))
    }

    async fn load_level(&self, id: &LevelId) -> EngineResult<Level> {
        self.store
            .level(id)
            .await?
            .ok_or_else(|| EngineError::not_found("level", id))
    }
}

/// Reject answers whose shape cannot fit the question type.
fn check_answer_shape(question: &Question, answer: &Answer) -> EngineResult<()> {
    let reason = match (&question.kind, answer) {
        (QuestionKind::MultipleChoice { options, .. }, Answer::Scalar(choice)) => {
            match choice.trim().parse::<usize>() {
                Ok(index) if index < options.len() => return Ok(()),
                _ => format!("expected an option index below {}", options.len()),
            }
        }
        (QuestionKind::MultipleChoice { .. }, _) => "expected an option index".to_string(),
        (QuestionKind::SingleAnswer { .. }, Answer::Scalar(_)) => return Ok(()),
        (QuestionKind::SingleAnswer { .. }, _) => "expected a single value".to_string(),
        (QuestionKind::Upload, Answer::File(_)) => return Ok(()),
        (QuestionKind::Upload, _) => "expected a file".to_string(),
        (QuestionKind::Custom { .. }, _) => return Ok(()),
    };
    Err(EngineError::InvalidAnswer {
        question: question.id.clone(),
        reason,
    })
}
