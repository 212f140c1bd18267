//! Lifecycle notifications.
//!
//! The engine publishes one event per successful transition. Hosts subscribe
//! to send emails or refresh dashboards; a slow subscriber lags rather than
//! blocking the engine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::model::{PrincipalId, TestId};

/// Something that happened to an attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    AttemptStarted {
        principal: PrincipalId,
        test: TestId,
    },
    AttemptFinished {
        principal: PrincipalId,
        test: TestId,
        resit_number: u32,
        percentage: u32,
        passed: bool,
        /// Finished by the time limit rather than the principal.
        forced: bool,
    },
    AttemptResat {
        principal: PrincipalId,
        test: TestId,
        times_resat: u32,
        /// `None` when resits are unlimited.
        remaining: Option<u32>,
    },
    TestReset {
        test: TestId,
    },
}

impl LifecycleEvent {
    pub fn test(&self) -> &TestId {
        match self {
            LifecycleEvent::AttemptStarted { test, .. }
            | LifecycleEvent::AttemptFinished { test, .. }
            | LifecycleEvent::AttemptResat { test, .. }
            | LifecycleEvent::TestReset { test } => test,
        }
    }
}

/// Fan-out of lifecycle events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn emit(&self, event: LifecycleEvent) {
        let _ = self.tx.send(event);
    }
}
