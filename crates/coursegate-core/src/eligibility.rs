//! Prerequisite gating on levels.
//!
//! A level may list tests that must have been passed (on the most recent
//! attempt) before it opens. Configurations where levels end up requiring
//! each other are detected by `prerequisite_cycle`.

use std::collections::{HashMap, HashSet};

use crate::archive;
use crate::error::StoreError;
use crate::model::{Level, LevelId, Principal, Test, TestId};
use crate::traits::EntityStore;

/// Outcome of an eligibility check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eligibility {
    Eligible,
    /// `failing_test` is the first prerequisite not yet passed.
    Ineligible { failing_test: TestId },
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, Eligibility::Eligible)
    }
}

/// Check `principal` against `level`'s prerequisite tests, in order.
pub async fn is_eligible(
    store: &dyn EntityStore,
    principal: &Principal,
    level: &Level,
) -> Result<Eligibility, StoreError> {
    if principal.is_admin() {
        return Ok(Eligibility::Eligible);
    }
    for test in level.prerequisites() {
        let history = store.archive_rows(&principal.id, test).await?;
        let passed = archive::latest(&history).is_some_and(|row| row.passed());
        if !passed {
            return Ok(Eligibility::Ineligible {
                failing_test: test.clone(),
            });
        }
    }
    Ok(Eligibility::Eligible)
}

/// Find a cycle in the level -> prerequisite test -> owning level graph.
///
/// Returns the levels along the cycle with the starting level repeated at the
/// end, e.g. `[a, b, a]`. Prerequisites naming unknown tests are ignored.
pub fn prerequisite_cycle(levels: &[Level], tests: &[Test]) -> Option<Vec<LevelId>> {
    let owner: HashMap<&TestId, &LevelId> = tests.iter().map(|t| (&t.id, &t.level)).collect();
    let edges: HashMap<&LevelId, Vec<&LevelId>> = levels
        .iter()
        .map(|level| {
            let targets = level
                .prerequisites()
                .iter()
                .filter_map(|test| owner.get(test).copied())
                .collect();
            (&level.id, targets)
        })
        .collect();

    let mut done: HashSet<&LevelId> = HashSet::new();
    for level in levels {
        let mut path = Vec::new();
        if let Some(cycle) = visit(&level.id, &edges, &mut path, &mut done) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    node: &'a LevelId,
    edges: &HashMap<&'a LevelId, Vec<&'a LevelId>>,
    path: &mut Vec<&'a LevelId>,
    done: &mut HashSet<&'a LevelId>,
) -> Option<Vec<LevelId>> {
    if let Some(start) = path.iter().position(|n| *n == node) {
        let mut cycle: Vec<LevelId> = path[start..].iter().map(|n| (*n).clone()).collect();
        cycle.push(node.clone());
        return Some(cycle);
    }
    if done.contains(node) {
        return None;
    }

    path.push(node);
    for next in edges.get(node).into_iter().flatten() {
        if let Some(cycle) = visit(*next, edges, path, done) {
            return Some(cycle);
        }
    }
    path.pop();
    done.insert(node);
    None
}
