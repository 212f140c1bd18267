//! Attempt state machine.
//!
//! ```text
//! NotStarted --start--> InProgress --finish--> Finished
//!      ^                   |  ^                   |
//!      |                   answer                 |
//!      +--------------------resit-----------------+
//! ```
//!
//! `AttemptMarker` is the persisted per-(principal, test) record of where an
//! attempt stands. The functions here are pure; the engine applies them
//! under the appropriate locks and persists the result.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{PrincipalId, ResitPolicy, TestId};

/// Where a principal's attempt at a test stands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    #[default]
    NotStarted,
    InProgress,
    Finished,
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptState::NotStarted => write!(f, "not started"),
            AttemptState::InProgress => write!(f, "in progress"),
            AttemptState::Finished => write!(f, "finished"),
        }
    }
}

/// A principal-initiated lifecycle action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    Start,
    Answer,
    Finish,
    Resit,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::Start => write!(f, "start"),
            Transition::Answer => write!(f, "answer"),
            Transition::Finish => write!(f, "finish"),
            Transition::Resit => write!(f, "resit"),
        }
    }
}

impl Transition {
    /// The state this transition must be taken from.
    pub fn required_state(&self) -> AttemptState {
        match self {
            Transition::Start => AttemptState::NotStarted,
            Transition::Answer | Transition::Finish => AttemptState::InProgress,
            Transition::Resit => AttemptState::Finished,
        }
    }
}

/// Persisted started/finished markers plus the resit counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptMarker {
    pub principal: PrincipalId,
    pub test: TestId,
    pub state: AttemptState,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub times_resat: u32,
}

impl AttemptMarker {
    /// Marker for a principal who has never touched the test.
    pub fn fresh(principal: PrincipalId, test: TestId) -> Self {
        Self {
            principal,
            test,
            state: AttemptState::NotStarted,
            started_at: None,
            finished_at: None,
            times_resat: 0,
        }
    }

    /// Check that `transition` is allowed from the current state.
    pub fn guard(&self, transition: Transition) -> Result<(), (Transition, AttemptState)> {
        if self.state == transition.required_state() {
            Ok(())
        } else {
            Err((transition, self.state))
        }
    }

    /// NotStarted -> InProgress.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.state = AttemptState::InProgress;
        self.started_at = Some(now);
        self.finished_at = None;
    }

    /// InProgress -> Finished. Clears the started marker.
    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.state = AttemptState::Finished;
        self.started_at = None;
        self.finished_at = Some(now);
    }

    /// Finished -> NotStarted, consuming one resit.
    pub fn rearm(&mut self) {
        self.state = AttemptState::NotStarted;
        self.finished_at = None;
        self.times_resat += 1;
    }

    /// Deadline of the running attempt, if it has a time limit.
    pub fn deadline(&self, limit: Option<Duration>) -> Option<DateTime<Utc>> {
        match (self.state, self.started_at, limit) {
            (AttemptState::InProgress, Some(started), Some(limit)) => Some(started + limit),
            _ => None,
        }
    }

    /// `true` once an in-progress attempt has run past its limit.
    pub fn is_expired(&self, limit: Option<Duration>, now: DateTime<Utc>) -> bool {
        self.deadline(limit).is_some_and(|deadline| now > deadline)
    }

    /// Resits still available under `policy`; `None` means unlimited.
    pub fn remaining_attempts(&self, policy: ResitPolicy) -> Option<u32> {
        policy.remaining(self.times_resat)
    }

    /// `true` once the test has ever been started by this principal.
    pub fn has_engaged(&self) -> bool {
        self.state != AttemptState::NotStarted || self.times_resat > 0
    }
}
