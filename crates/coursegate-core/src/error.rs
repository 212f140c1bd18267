//! Engine and store error types.
//!
//! Denials and invalid transitions are expected outcomes the caller branches
//! on; store failures are data problems. Helpers on `EngineError` classify
//! errors without string matching.

use thiserror::Error;

use crate::access::Denial;
use crate::lifecycle::{AttemptState, Transition};
use crate::model::{LevelId, QuestionId, TestId};

/// Errors raised by an `EntityStore` implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// A write collided with an existing record (e.g. a duplicate archive key).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A write tried to alter an immutable archive field.
    #[error("archive rows are immutable: {0}")]
    Immutable(String),

    /// The backing storage failed.
    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns `true` if repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::Conflict(_))
    }
}

/// Errors returned by `AssessmentEngine` operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The principal may not reach the target.
    #[error("access denied: {0}")]
    Denied(Denial),

    /// The attempt ran out of time and was finished automatically.
    #[error("time limit expired for test {test}; the attempt was finished automatically")]
    TimeExpired { test: TestId },

    /// The attempt is not in a state that allows this action.
    #[error("cannot {action} while the attempt is {state}")]
    InvalidTransition {
        action: Transition,
        state: AttemptState,
    },

    /// Resit requested with no attempts remaining.
    #[error("no resit attempts remain for test {test}")]
    AttemptsExhausted { test: TestId },

    /// Start requested for a test without questions.
    #[error("test {0} has no questions")]
    EmptyTest(TestId),

    /// Structural edit requested after the test was first started.
    #[error("test {0} has been started and can no longer be structurally edited")]
    TestLocked(TestId),

    /// The answer's shape does not fit the question type.
    #[error("answer does not fit question {question}: {reason}")]
    InvalidAnswer { question: QuestionId, reason: String },

    /// Manual override rejected.
    #[error("invalid override: {0}")]
    InvalidOverride(String),

    /// The eligibility configuration would make levels require each other.
    #[error("eligibility cycle through levels: {}", format_path(.path))]
    EligibilityCycle { path: Vec<LevelId> },

    /// The referenced entity does not exist.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The archive row could not be written; the attempt is still in progress.
    #[error("failed to persist attempt record, nothing was cleared: {0}")]
    Persistence(#[source] StoreError),

    /// Any other store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

fn format_path(path: &[LevelId]) -> String {
    path.iter()
        .map(LevelId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl From<(Transition, AttemptState)> for EngineError {
    fn from((action, state): (Transition, AttemptState)) -> Self {
        EngineError::InvalidTransition { action, state }
    }
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Returns `true` for permission outcomes (denial or expiry).
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            EngineError::Denied(_) | EngineError::TimeExpired { .. }
        )
    }

    /// Returns `true` for precondition failures that indicate a caller bug.
    pub fn is_invalid_transition(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidTransition { .. }
                | EngineError::AttemptsExhausted { .. }
                | EngineError::EmptyTest(_)
                | EngineError::TestLocked(_)
                | EngineError::InvalidAnswer { .. }
                | EngineError::InvalidOverride(_)
                | EngineError::EligibilityCycle { .. }
        )
    }

    /// Returns `true` if the caller may retry the same operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Persistence(_) => true,
            EngineError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_failures_are_retryable() {
        let err = EngineError::Persistence(StoreError::Backend("disk full".into()));
        assert!(err.is_retryable());
        assert!(!err.is_denial());
        assert!(!err.is_invalid_transition());
    }

    #[test]
    fn transition_errors_classify() {
        let err = EngineError::InvalidTransition {
            action: Transition::Finish,
            state: AttemptState::NotStarted,
        };
        assert!(err.is_invalid_transition());
        assert_eq!(err.to_string(), "cannot finish while the attempt is not started");

        let exhausted = EngineError::AttemptsExhausted {
            test: TestId::from("t1"),
        };
        assert!(exhausted.is_invalid_transition());
        assert!(!exhausted.is_retryable());
    }

    #[test]
    fn not_found_store_errors_are_permanent() {
        let err: EngineError = StoreError::not_found("level", "l9").into();
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "level not found: l9");
    }

    #[test]
    fn cycle_message_lists_path() {
        let err = EngineError::EligibilityCycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "eligibility cycle through levels: a -> b -> a");
    }
}
