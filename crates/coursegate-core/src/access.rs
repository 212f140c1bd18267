//! Access control evaluation.
//!
//! `AccessEvaluator::can_access` decides whether a principal may reach a
//! level, resource, test, question, result or trainee record. It has no side
//! effects and never fails: lookup errors become denials. A lapsed time limit
//! is reported as `Decision::TimeExpired` so the caller can finish the
//! attempt.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::eligibility::{self, Eligibility};
use crate::error::StoreError;
use crate::lifecycle::{AttemptMarker, AttemptState};
use crate::model::{
    GroupId, Level, LevelId, Principal, PrincipalId, QuestionId, ResourceId, ResultId, Role, Test,
    TestId,
};
use crate::traits::EntityStore;

/// Anything access can be asked about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Entity {
    Level(LevelId),
    Resource(ResourceId),
    Test(TestId),
    Question(QuestionId),
    Result(ResultId),
    Trainee(PrincipalId),
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Level(id) => write!(f, "level {id}"),
            Entity::Resource(id) => write!(f, "resource {id}"),
            Entity::Test(id) => write!(f, "test {id}"),
            Entity::Question(id) => write!(f, "question {id}"),
            Entity::Result(id) => write!(f, "result {id}"),
            Entity::Trainee(id) => write!(f, "trainee {id}"),
        }
    }
}

/// Machine-readable category of a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialCode {
    NotInGroup,
    NotEligible,
    ResourceLocked,
    OutsideSchedule,
    NotStarted,
    AlreadyFinished,
    NotYourRecord,
    NotManaged,
    ResultNotReleased,
    AdministratorOnly,
    Missing,
    LookupFailed,
}

/// Why access was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Denial {
    pub code: DenialCode,
    pub reason: String,
    /// First unmet prerequisite, for `NotEligible`.
    #[serde(default)]
    pub failing_test: Option<TestId>,
}

impl Denial {
    pub fn new(code: DenialCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            failing_test: None,
        }
    }

    fn missing(kind: &str, id: impl fmt::Display) -> Self {
        Self::new(DenialCode::Missing, format!("{kind} {id} does not exist"))
    }

    pub(crate) fn administrator_only() -> Self {
        Self::new(
            DenialCode::AdministratorOnly,
            "only an administrator may do this",
        )
    }
}

impl fmt::Display for Denial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

/// Result of an access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(Denial),
    /// The principal's running attempt at `test` is out of time.
    TimeExpired { test: TestId },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn reason(&self) -> &str {
        match self {
            Decision::Allow => "",
            Decision::Deny(denial) => &denial.reason,
            Decision::TimeExpired { .. } => "time_expired",
        }
    }

    /// `(allowed, reason)` pair for surfacing to a UI.
    pub fn verdict(&self) -> (bool, &str) {
        (self.is_allowed(), self.reason())
    }

    fn deny(code: DenialCode, reason: impl Into<String>) -> Self {
        Decision::Deny(Denial::new(code, reason))
    }
}

/// `true` when `principal`'s gating groups open `level`.
pub fn passes_group_gate(principal: &Principal, level: &Level) -> bool {
    if principal.is_admin() || level.is_derestricted() {
        return true;
    }
    principal
        .access_groups()
        .is_some_and(|groups| !groups.is_disjoint(&level.gating_groups))
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// The parts of a principal the group gate reads.
#[derive(Debug, Clone, PartialEq, Eq)]
struct GateKey {
    admin: bool,
    groups: Option<BTreeSet<GroupId>>,
}

impl GateKey {
    fn of(principal: &Principal) -> Self {
        Self {
            admin: principal.is_admin(),
            groups: principal.access_groups().cloned(),
        }
    }
}

#[derive(Debug)]
struct CachedLevels {
    generation: u64,
    key: GateKey,
    levels: Arc<BTreeSet<LevelId>>,
}

/// Per-principal cache of the levels whose group gate the principal passes.
///
/// Entries are stamped with the store's access generation and the role and
/// groups they were computed from. A change to either is a miss.
#[derive(Debug, Default)]
pub struct AccessCache {
    entries: Mutex<HashMap<PrincipalId, CachedLevels>>,
}

impl AccessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Level ids whose group gate `principal` passes.
    pub async fn reachable_levels(
        &self,
        store: &dyn EntityStore,
        principal: &Principal,
    ) -> Result<Arc<BTreeSet<LevelId>>, StoreError> {
        let generation = store.access_generation();
        let key = GateKey::of(principal);
        if let Some(levels) = self.lookup(&principal.id, generation, &key) {
            return Ok(levels);
        }

        let levels: Arc<BTreeSet<LevelId>> = Arc::new(
            store
                .levels()
                .await?
                .into_iter()
                .filter(|level| passes_group_gate(principal, level))
                .map(|level| level.id)
                .collect(),
        );
        tracing::debug!(
            principal = %principal.id,
            generation,
            levels = levels.len(),
            "refreshed reachable levels"
        );

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            principal.id.clone(),
            CachedLevels {
                generation,
                key,
                levels: Arc::clone(&levels),
            },
        );
        Ok(levels)
    }

    /// Test ids owned by the levels whose group gate `principal` passes.
    pub async fn reachable_tests(
        &self,
        store: &dyn EntityStore,
        principal: &Principal,
    ) -> Result<BTreeSet<TestId>, StoreError> {
        let levels = self.reachable_levels(store, principal).await?;
        Ok(store
            .tests()
            .await?
            .into_iter()
            .filter(|test| levels.contains(&test.level))
            .map(|test| test.id)
            .collect())
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn lookup(
        &self,
        principal: &PrincipalId,
        generation: u64,
        key: &GateKey,
    ) -> Option<Arc<BTreeSet<LevelId>>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(principal)
            .filter(|cached| cached.generation == generation && &cached.key == key)
            .map(|cached| Arc::clone(&cached.levels))
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluates access for one point in time.
pub struct AccessEvaluator<'a> {
    store: &'a dyn EntityStore,
    config: &'a EngineConfig,
    cache: Option<&'a AccessCache>,
    now: DateTime<Utc>,
}

impl<'a> AccessEvaluator<'a> {
    pub fn new(store: &'a dyn EntityStore, config: &'a EngineConfig, now: DateTime<Utc>) -> Self {
        Self {
            store,
            config,
            cache: None,
            now,
        }
    }

    pub fn with_cache(mut self, cache: &'a AccessCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Decide whether `principal` may reach `entity`.
    pub async fn can_access(&self, principal: &Principal, entity: &Entity) -> Decision {
        if principal.is_admin() {
            return Decision::Allow;
        }
        let outcome = match entity {
            Entity::Level(id) => self.level_by_id(principal, id).await,
            Entity::Resource(id) => self.resource(principal, id).await,
            Entity::Test(id) => self.test_by_id(principal, id).await,
            Entity::Question(id) => self.question(principal, id).await,
            Entity::Result(id) => self.result(principal, id).await,
            Entity::Trainee(id) => self.trainee_record(principal, id).await,
        };
        outcome.unwrap_or_else(|e| {
            tracing::warn!(principal = %principal.id, %entity, "access lookup failed: {e}");
            Decision::deny(DenialCode::LookupFailed, format!("could not check access: {e}"))
        })
    }

    async fn level_by_id(&self, principal: &Principal, id: &LevelId) -> Result<Decision, StoreError> {
        match self.store.level(id).await? {
            Some(level) => self.level(principal, &level).await,
            None => Ok(Decision::Deny(Denial::missing("level", id))),
        }
    }

    async fn level(&self, principal: &Principal, level: &Level) -> Result<Decision, StoreError> {
        let gated_in = match self.cache {
            Some(cache) => cache
                .reachable_levels(self.store, principal)
                .await?
                .contains(&level.id),
            None => passes_group_gate(principal, level),
        };
        if !gated_in {
            return Ok(Decision::deny(DenialCode::NotInGroup, "not in correct group"));
        }

        match eligibility::is_eligible(self.store, principal, level).await? {
            Eligibility::Eligible => Ok(Decision::Allow),
            Eligibility::Ineligible { failing_test } => {
                let name = self
                    .store
                    .test(&failing_test)
                    .await?
                    .map(|t| t.name)
                    .unwrap_or_else(|| failing_test.to_string());
                Ok(Decision::Deny(Denial {
                    code: DenialCode::NotEligible,
                    reason: format!("you must pass {name} first"),
                    failing_test: Some(failing_test),
                }))
            }
        }
    }

    async fn resource(&self, principal: &Principal, id: &ResourceId) -> Result<Decision, StoreError> {
        let Some(resource) = self.store.resource(id).await? else {
            return Ok(Decision::Deny(Denial::missing("resource", id)));
        };
        let Some(level) = self.store.level(&resource.level).await? else {
            return Ok(Decision::Deny(Denial::missing("level", &resource.level)));
        };
        let decision = self.level(principal, &level).await?;
        if !decision.is_allowed() {
            return Ok(decision);
        }

        if resource.lock_during_test || self.config.lock_resources_during_test {
            if let Some(test) = &level.test {
                let marker = self.marker(principal, test).await?;
                if marker.state == AttemptState::InProgress {
                    return Ok(Decision::deny(
                        DenialCode::ResourceLocked,
                        "this resource is locked while the test is in progress",
                    ));
                }
            }
        }

        if let Some(window) = &resource.schedule {
            if !window.covers(self.now) {
                return Ok(Decision::deny(
                    DenialCode::OutsideSchedule,
                    "this resource is not available at this time",
                ));
            }
        }
        Ok(Decision::Allow)
    }

    async fn test_by_id(&self, principal: &Principal, id: &TestId) -> Result<Decision, StoreError> {
        match self.store.test(id).await? {
            Some(test) => self.test(principal, &test).await,
            None => Ok(Decision::Deny(Denial::missing("test", id))),
        }
    }

    async fn test(&self, principal: &Principal, test: &Test) -> Result<Decision, StoreError> {
        let decision = self.level_by_id(principal, &test.level).await?;
        if !decision.is_allowed() {
            return Ok(decision);
        }
        let marker = self.marker(principal, &test.id).await?;
        if marker.is_expired(test.time_limit(), self.now) {
            return Ok(Decision::TimeExpired {
                test: test.id.clone(),
            });
        }
        Ok(Decision::Allow)
    }

    async fn question(&self, principal: &Principal, id: &QuestionId) -> Result<Decision, StoreError> {
        let Some(question) = self.store.question(id).await? else {
            return Ok(Decision::Deny(Denial::missing("question", id)));
        };
        let Some(test) = self.store.test(&question.test).await? else {
            return Ok(Decision::Deny(Denial::missing("test", &question.test)));
        };
        let decision = self.test(principal, &test).await?;
        if !decision.is_allowed() {
            return Ok(decision);
        }
        Ok(match self.marker(principal, &test.id).await?.state {
            AttemptState::InProgress => Decision::Allow,
            AttemptState::NotStarted => {
                Decision::deny(DenialCode::NotStarted, "you have not started this test")
            }
            AttemptState::Finished => {
                Decision::deny(DenialCode::AlreadyFinished, "you have already finished this test")
            }
        })
    }

    async fn result(&self, principal: &Principal, id: &ResultId) -> Result<Decision, StoreError> {
        let Some(pointer) = self.store.result_by_id(id).await? else {
            return Ok(Decision::Deny(Denial::missing("result", id)));
        };
        let decision = self.trainee_record(principal, &pointer.principal).await?;
        if decision.is_allowed()
            && principal.id == pointer.principal
            && matches!(principal.role, Role::Trainee { .. })
            && !pointer.released
        {
            return Ok(Decision::deny(
                DenialCode::ResultNotReleased,
                "this result has not been released yet",
            ));
        }
        Ok(decision)
    }

    async fn trainee_record(
        &self,
        principal: &Principal,
        trainee: &PrincipalId,
    ) -> Result<Decision, StoreError> {
        match &principal.role {
            Role::Administrator => Ok(Decision::Allow),
            Role::GroupManager { managed_groups } => {
                let Some(record) = self.store.principal(trainee).await? else {
                    return Ok(Decision::Deny(Denial::missing("trainee", trainee)));
                };
                let managed = match &record.role {
                    Role::Trainee { groups } => !groups.is_disjoint(managed_groups),
                    _ => false,
                };
                if managed {
                    Ok(Decision::Allow)
                } else {
                    Ok(Decision::deny(
                        DenialCode::NotManaged,
                        "this trainee is not in a group you manage",
                    ))
                }
            }
            Role::Trainee { .. } if &principal.id == trainee => Ok(Decision::Allow),
            Role::Trainee { .. } | Role::Guest => Ok(Decision::deny(
                DenialCode::NotYourRecord,
                "you may only view your own results",
            )),
        }
    }

    async fn marker(&self, principal: &Principal, test: &TestId) -> Result<AttemptMarker, StoreError> {
        Ok(self
            .store
            .attempt(&principal.id, test)
            .await?
            .unwrap_or_else(|| AttemptMarker::fresh(principal.id.clone(), test.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trainee(groups: &[&str]) -> Principal {
        Principal::new(
            "t",
            "Trainee",
            Role::Trainee {
                groups: groups.iter().map(|g| GroupId::from(*g)).collect(),
            },
        )
    }

    fn gated(groups: &[&str]) -> Level {
        let mut level = Level::new("l1", "Level 1");
        level.gating_groups = groups.iter().map(|g| GroupId::from(*g)).collect();
        level
    }

    #[test]
    fn derestricted_levels_open_to_everyone() {
        let guest = Principal::new("g", "Guest", Role::Guest);
        assert!(passes_group_gate(&guest, &gated(&[])));
        assert!(passes_group_gate(&trainee(&[]), &gated(&[])));
    }

    #[test]
    fn gated_levels_need_a_shared_group() {
        assert!(passes_group_gate(&trainee(&["g1", "g2"]), &gated(&["g2"])));
        assert!(!passes_group_gate(&trainee(&["g1"]), &gated(&["g2"])));
        assert!(!passes_group_gate(
            &Principal::new("g", "Guest", Role::Guest),
            &gated(&["g2"])
        ));
    }

    #[test]
    fn managers_gate_on_managed_groups() {
        let manager = Principal::new(
            "m",
            "Manager",
            Role::GroupManager {
                managed_groups: [GroupId::from("g2")].into(),
            },
        );
        assert!(passes_group_gate(&manager, &gated(&["g2"])));
        assert!(!passes_group_gate(&manager, &gated(&["g1"])));
    }

    #[test]
    fn verdict_pairs() {
        assert_eq!(Decision::Allow.verdict(), (true, ""));
        let denied = Decision::deny(DenialCode::NotInGroup, "not in correct group");
        assert_eq!(denied.verdict(), (false, "not in correct group"));
        let expired = Decision::TimeExpired { test: "t1".into() };
        assert_eq!(expired.verdict(), (false, "time_expired"));
    }
}
