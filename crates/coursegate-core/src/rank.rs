//! Competition ranking and leaderboards over the archive ledger.
//!
//! Standard competition ranking ("1224"): equal scores share a rank and the
//! next distinct score takes its 1-based position.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::archive::{latest_per_attempt, ArchiveRow};
use crate::model::PrincipalId;

/// An entry annotated with its rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranked<T> {
    pub rank: usize,
    pub entry: T,
}

/// Ranks for scores already sorted descending.
pub fn competition_ranks(scores: &[u32]) -> Vec<usize> {
    let mut ranks = Vec::with_capacity(scores.len());
    for (i, score) in scores.iter().enumerate() {
        let rank = if i > 0 && scores[i - 1] == *score {
            ranks[i - 1]
        } else {
            i + 1
        };
        ranks.push(rank);
    }
    ranks
}

/// Sort `items` by `score` descending (stable) and rank them.
pub fn rank_by<T, F>(mut items: Vec<T>, score: F) -> Vec<Ranked<T>>
where
    F: Fn(&T) -> u32,
{
    items.sort_by_key(|item| std::cmp::Reverse(score(item)));
    let scores: Vec<u32> = items.iter().map(&score).collect();
    competition_ranks(&scores)
        .into_iter()
        .zip(items)
        .map(|(rank, entry)| Ranked { rank, entry })
        .collect()
}

/// Leaderboard for one test: each principal's most recent attempt.
///
/// `rows` should all belong to the same test; ties are ordered by principal.
pub fn test_leaderboard(rows: &[ArchiveRow]) -> Vec<Ranked<ArchiveRow>> {
    let mut latest = latest_per_attempt(rows);
    latest.sort_by(|a, b| a.principal().cmp(b.principal()));
    rank_by(latest, ArchiveRow::percentage)
}

/// A principal's combined score across tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalScore {
    pub principal: PrincipalId,
    /// Sum of the latest percentage on every test taken.
    pub total_percentage: u32,
    pub tests_taken: usize,
}

/// Cross-test leaderboard: sum of each principal's latest percentage per test.
pub fn overall_leaderboard(rows: &[ArchiveRow]) -> Vec<Ranked<TotalScore>> {
    let mut totals: BTreeMap<PrincipalId, TotalScore> = BTreeMap::new();
    for row in latest_per_attempt(rows) {
        let total = totals
            .entry(row.principal().clone())
            .or_insert_with(|| TotalScore {
                principal: row.principal().clone(),
                total_percentage: 0,
                tests_taken: 0,
            });
        total.total_percentage += row.percentage();
        total.tests_taken += 1;
    }
    rank_by(totals.into_values().collect(), |t| t.total_percentage)
}
