//! Engine integration tests: access control, eligibility and the attempt
//! lifecycle against the in-memory store.

mod common;

use chrono::Duration;
use coursegate_core::access::{Decision, DenialCode, Entity};
use coursegate_core::eligibility::Eligibility;
use coursegate_core::events::LifecycleEvent;
use coursegate_core::lifecycle::{AttemptState, Transition};
use coursegate_core::model::{Answer, GroupId, Principal, Role};
use coursegate_core::traits::EntityStore;
use coursegate_core::EngineError;

use common::{t0, Fixture};

fn denial_code(decision: &Decision) -> Option<DenialCode> {
    match decision {
        Decision::Deny(denial) => Some(denial.code),
        _ => None,
    }
}

// --- Scenarios ---

#[tokio::test]
async fn three_of_four_correct_is_a_merit() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;

    fx.engine.start(&alice, &"t-intro".into()).await.unwrap();
    fx.answer_intro(&alice, 3).await;
    let row = fx.engine.finish(&alice, &"t-intro".into()).await.unwrap();

    assert_eq!(row.mark(), 3);
    assert_eq!(row.out_of(), 4);
    assert_eq!(row.percentage(), 75);
    assert_eq!(row.grade(), "Merit");
    assert!(row.passed());
    assert_eq!(row.resit_number(), 0);
    assert_eq!(row.answers().iter().filter(|a| a.correct).count(), 3);

    let marker = fx.engine.attempt_state(&alice.id, &"t-intro".into()).await.unwrap();
    assert_eq!(marker.state, AttemptState::Finished);
    assert!(marker.started_at.is_none());
    assert!(fx.store.answer(&alice.id, &"q1".into()).await.unwrap().is_none());

    let pointer = fx.store.result(&alice.id, &"t-intro".into()).await.unwrap().unwrap();
    assert!(pointer.released);
    assert_eq!(pointer.resit_number, 0);
}

#[tokio::test]
async fn level_outside_the_trainees_groups_is_denied() {
    let fx = Fixture::new();
    let bob = fx.principal("bob").await;

    let decision = fx.engine.can_access(&bob, &Entity::Level("forklift".into())).await;
    assert_eq!(decision.verdict(), (false, "not in correct group"));
    assert_eq!(denial_code(&decision), Some(DenialCode::NotInGroup));
}

#[tokio::test]
async fn unmet_prerequisite_names_the_failing_test() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;

    let eligibility = fx.engine.is_eligible(&alice, &"forklift".into()).await.unwrap();
    assert_eq!(
        eligibility,
        Eligibility::Ineligible {
            failing_test: "t-intro".into()
        }
    );
    match fx.engine.can_access(&alice, &Entity::Level("forklift".into())).await {
        Decision::Deny(denial) => {
            assert_eq!(denial.code, DenialCode::NotEligible);
            assert_eq!(denial.failing_test, Some("t-intro".into()));
            assert!(denial.reason.contains("Introduction test"));
        }
        other => panic!("expected denial, got {other:?}"),
    }

    fx.sit_intro(&alice, 2).await;
    assert!(fx
        .engine
        .is_eligible(&alice, &"forklift".into())
        .await
        .unwrap()
        .is_eligible());
    assert!(fx
        .engine
        .can_access(&alice, &Entity::Level("forklift".into()))
        .await
        .is_allowed());
}

#[tokio::test]
async fn eligibility_follows_the_latest_attempt() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;

    fx.sit_intro(&alice, 4).await;
    fx.engine.resit(&alice, &"t-intro".into()).await.unwrap();
    fx.sit_intro(&alice, 1).await;

    assert!(!fx
        .engine
        .is_eligible(&alice, &"forklift".into())
        .await
        .unwrap()
        .is_eligible());
}

#[tokio::test]
async fn expired_attempt_is_finished_on_access() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    let mut events = fx.engine.subscribe();

    fx.engine.start(&alice, &"t-intro".into()).await.unwrap();
    fx.engine
        .answer(&alice, &"q1".into(), Answer::scalar("1"))
        .await
        .unwrap();

    fx.clock.advance(Duration::minutes(30));
    assert!(fx
        .engine
        .access(&alice, &Entity::Test("t-intro".into()))
        .await
        .is_allowed());

    fx.clock.advance(Duration::minutes(1));
    let decision = fx.engine.access(&alice, &Entity::Test("t-intro".into())).await;
    assert_eq!(
        decision,
        Decision::TimeExpired {
            test: "t-intro".into()
        }
    );
    assert_eq!(decision.verdict(), (false, "time_expired"));

    let marker = fx.engine.attempt_state(&alice.id, &"t-intro".into()).await.unwrap();
    assert_eq!(marker.state, AttemptState::Finished);
    let rows = fx.store.archive_rows(&alice.id, &"t-intro".into()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].mark(), 1);
    assert_eq!(rows[0].percentage(), 25);
    assert_eq!(rows[0].duration_secs(), 31 * 60);
    assert!(!rows[0].passed());

    assert!(matches!(
        events.recv().await.unwrap(),
        LifecycleEvent::AttemptStarted { .. }
    ));
    match events.recv().await.unwrap() {
        LifecycleEvent::AttemptFinished {
            forced, percentage, ..
        } => {
            assert!(forced);
            assert_eq!(percentage, 25);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn answering_after_expiry_finishes_the_attempt() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;

    fx.engine.start(&alice, &"t-intro".into()).await.unwrap();
    fx.engine
        .answer(&alice, &"q1".into(), Answer::scalar("1"))
        .await
        .unwrap();
    fx.clock.advance(Duration::minutes(45));

    let err = fx
        .engine
        .answer(&alice, &"q2".into(), Answer::scalar("5"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::TimeExpired { .. }));
    assert!(err.is_denial());

    let rows = fx.store.archive_rows(&alice.id, &"t-intro".into()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].mark(), 1);

    // A second expiry report does not archive twice.
    let decision = fx.engine.access(&alice, &Entity::Test("t-intro".into())).await;
    assert!(decision.is_allowed());
    assert_eq!(
        fx.store.archive_rows(&alice.id, &"t-intro".into()).await.unwrap().len(),
        1
    );
}

#[tokio::test]
async fn second_resit_is_refused_when_one_is_allowed() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;

    fx.sit_intro(&alice, 1).await;
    let marker = fx.engine.resit(&alice, &"t-intro".into()).await.unwrap();
    assert_eq!(marker.state, AttemptState::NotStarted);
    assert_eq!(marker.times_resat, 1);
    assert!(fx
        .store
        .result(&alice.id, &"t-intro".into())
        .await
        .unwrap()
        .is_none());

    fx.sit_intro(&alice, 2).await;
    let err = fx.engine.resit(&alice, &"t-intro".into()).await.unwrap_err();
    assert!(matches!(err, EngineError::AttemptsExhausted { .. }));
    assert!(err.is_invalid_transition());
    assert!(!err.is_denial());

    let rows = fx.store.archive_rows(&alice.id, &"t-intro".into()).await.unwrap();
    let numbers: Vec<u32> = rows.iter().map(|r| r.resit_number()).collect();
    assert_eq!(numbers, vec![0, 1]);
}

// --- Transitions ---

#[tokio::test]
async fn out_of_order_transitions_are_rejected() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    let test = "t-intro".into();

    let err = fx.engine.finish(&alice, &test).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            action: Transition::Finish,
            state: AttemptState::NotStarted
        }
    ));

    let err = fx
        .engine
        .answer(&alice, &"q1".into(), Answer::scalar("1"))
        .await
        .unwrap_err();
    assert!(err.is_invalid_transition());

    let err = fx.engine.resit(&alice, &test).await.unwrap_err();
    assert!(err.is_invalid_transition());

    fx.engine.start(&alice, &test).await.unwrap();
    let err = fx.engine.start(&alice, &test).await.unwrap_err();
    assert_eq!(err.to_string(), "cannot start while the attempt is in progress");
}

#[tokio::test]
async fn tests_without_questions_cannot_start() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    let err = fx.engine.start(&alice, &"t-drafts".into()).await.unwrap_err();
    assert!(matches!(err, EngineError::EmptyTest(_)));
}

#[tokio::test]
async fn denied_principals_cannot_start() {
    let fx = Fixture::new();
    let bob = fx.principal("bob").await;
    let err = fx.engine.start(&bob, &"t-forklift".into()).await.unwrap_err();
    match err {
        EngineError::Denied(denial) => assert_eq!(denial.code, DenialCode::NotInGroup),
        other => panic!("expected denial, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_answers_are_rejected() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    fx.engine.start(&alice, &"t-intro".into()).await.unwrap();

    let err = fx
        .engine
        .answer(&alice, &"q1".into(), Answer::scalar("7"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidAnswer { .. }));

    let err = fx
        .engine
        .answer(&alice, &"missing".into(), Answer::scalar("1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound { .. }));
}

#[tokio::test]
async fn later_answers_replace_earlier_ones() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    fx.engine.start(&alice, &"t-intro".into()).await.unwrap();
    fx.engine
        .answer(&alice, &"q1".into(), Answer::scalar("0"))
        .await
        .unwrap();
    fx.engine
        .answer(&alice, &"q1".into(), Answer::scalar("1"))
        .await
        .unwrap();
    let row = fx.engine.finish(&alice, &"t-intro".into()).await.unwrap();
    assert_eq!(row.mark(), 1);
}

#[tokio::test]
async fn failed_archive_write_keeps_the_attempt_open() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    fx.engine.start(&alice, &"t-intro".into()).await.unwrap();
    fx.answer_intro(&alice, 4).await;

    fx.store.fail_archive_appends(true);
    let err = fx.engine.finish(&alice, &"t-intro".into()).await.unwrap_err();
    assert!(matches!(err, EngineError::Persistence(_)));
    assert!(err.is_retryable());

    let marker = fx.engine.attempt_state(&alice.id, &"t-intro".into()).await.unwrap();
    assert_eq!(marker.state, AttemptState::InProgress);
    assert!(marker.started_at.is_some());
    assert!(fx.store.answer(&alice.id, &"q4".into()).await.unwrap().is_some());
    assert!(fx
        .store
        .result(&alice.id, &"t-intro".into())
        .await
        .unwrap()
        .is_none());

    fx.store.fail_archive_appends(false);
    let row = fx.engine.finish(&alice, &"t-intro".into()).await.unwrap();
    assert_eq!(row.percentage(), 100);
    assert_eq!(row.grade(), "Distinction");
}

#[tokio::test]
async fn lifecycle_events_are_published_in_order() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    let mut events = fx.engine.subscribe();

    fx.sit_intro(&alice, 4).await;
    fx.engine.resit(&alice, &"t-intro".into()).await.unwrap();

    assert!(matches!(
        events.recv().await.unwrap(),
        LifecycleEvent::AttemptStarted { .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        LifecycleEvent::AttemptFinished {
            passed: true,
            forced: false,
            resit_number: 0,
            ..
        }
    ));
    assert_eq!(
        events.recv().await.unwrap(),
        LifecycleEvent::AttemptResat {
            principal: alice.id.clone(),
            test: "t-intro".into(),
            times_resat: 1,
            remaining: Some(0),
        }
    );
}

// --- Access rules ---

#[tokio::test]
async fn questions_are_reachable_only_while_in_progress() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    let q1 = Entity::Question("q1".into());

    let before = fx.engine.can_access(&alice, &q1).await;
    assert_eq!(denial_code(&before), Some(DenialCode::NotStarted));

    fx.engine.start(&alice, &"t-intro".into()).await.unwrap();
    assert!(fx.engine.can_access(&alice, &q1).await.is_allowed());

    fx.engine.finish(&alice, &"t-intro".into()).await.unwrap();
    let after = fx.engine.can_access(&alice, &q1).await;
    assert_eq!(denial_code(&after), Some(DenialCode::AlreadyFinished));

    let admin = fx.principal("admin").await;
    assert!(fx.engine.can_access(&admin, &q1).await.is_allowed());
}

#[tokio::test]
async fn locked_resources_are_hidden_during_the_test() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    let notes = Entity::Resource("notes".into());

    assert!(fx.engine.can_access(&alice, &notes).await.is_allowed());
    fx.engine.start(&alice, &"t-intro".into()).await.unwrap();
    let during = fx.engine.can_access(&alice, &notes).await;
    assert_eq!(denial_code(&during), Some(DenialCode::ResourceLocked));

    fx.engine.finish(&alice, &"t-intro".into()).await.unwrap();
    assert!(fx.engine.can_access(&alice, &notes).await.is_allowed());
}

#[tokio::test]
async fn engine_wide_lock_applies_to_every_resource() {
    let fx = Fixture::with_config(coursegate_core::config::EngineConfig {
        lock_resources_during_test: true,
        ..Default::default()
    });
    let alice = fx.principal("alice").await;
    let slides = Entity::Resource("induction-day".into());

    fx.engine.start(&alice, &"t-intro".into()).await.unwrap();
    let decision = fx.engine.can_access(&alice, &slides).await;
    assert_eq!(denial_code(&decision), Some(DenialCode::ResourceLocked));
}

#[tokio::test]
async fn scheduled_resources_follow_their_window() {
    let fx = Fixture::new();
    let guest = fx.principal("guest").await;
    let slides = Entity::Resource("induction-day".into());

    assert!(fx.engine.can_access(&guest, &slides).await.is_allowed());

    fx.clock.set(t0() - Duration::hours(2));
    let early = fx.engine.can_access(&guest, &slides).await;
    assert_eq!(denial_code(&early), Some(DenialCode::OutsideSchedule));

    fx.clock.set(t0() + Duration::hours(9));
    assert!(fx.engine.can_access(&guest, &slides).await.is_allowed());

    fx.clock.set(t0() + Duration::hours(9) + Duration::seconds(1));
    assert_eq!(
        denial_code(&fx.engine.can_access(&guest, &slides).await),
        Some(DenialCode::OutsideSchedule)
    );
}

#[tokio::test]
async fn guests_and_administrators() {
    let fx = Fixture::new();
    let guest = fx.principal("guest").await;
    let admin = fx.principal("admin").await;

    assert!(fx
        .engine
        .can_access(&guest, &Entity::Level("intro".into()))
        .await
        .is_allowed());
    assert_eq!(
        denial_code(
            &fx.engine
                .can_access(&guest, &Entity::Level("forklift".into()))
                .await
        ),
        Some(DenialCode::NotInGroup)
    );

    for entity in [
        Entity::Level("forklift".into()),
        Entity::Test("t-forklift".into()),
        Entity::Trainee("bob".into()),
        Entity::Level("no-such-level".into()),
    ] {
        assert!(fx.engine.can_access(&admin, &entity).await.is_allowed());
    }
}

#[tokio::test]
async fn missing_entities_are_denied_not_errors() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    let decision = fx.engine.can_access(&alice, &Entity::Test("ghost".into())).await;
    assert_eq!(denial_code(&decision), Some(DenialCode::Missing));
}

#[tokio::test]
async fn trainee_records_follow_management() {
    let fx = Fixture::new();
    let mgr = fx.principal("mgr").await;
    let alice = fx.principal("alice").await;

    assert!(fx
        .engine
        .can_access(&mgr, &Entity::Trainee("alice".into()))
        .await
        .is_allowed());
    assert_eq!(
        denial_code(&fx.engine.can_access(&mgr, &Entity::Trainee("bob".into())).await),
        Some(DenialCode::NotManaged)
    );
    assert!(fx
        .engine
        .can_access(&alice, &Entity::Trainee("alice".into()))
        .await
        .is_allowed());
    assert_eq!(
        denial_code(
            &fx.engine
                .can_access(&alice, &Entity::Trainee("carol".into()))
                .await
        ),
        Some(DenialCode::NotYourRecord)
    );
}

#[tokio::test]
async fn managers_are_gated_by_managed_groups() {
    let fx = Fixture::new();
    let mgr = fx.principal("mgr").await;
    let decision = fx.engine.can_access(&mgr, &Entity::Level("forklift".into())).await;
    // Through the gate; stopped by the prerequisite.
    assert_eq!(denial_code(&decision), Some(DenialCode::NotEligible));
}

#[tokio::test]
async fn membership_changes_invalidate_cached_access() {
    let fx = Fixture::new();
    let bob = fx.principal("bob").await;
    let forklift = Entity::Level("forklift".into());

    assert_eq!(
        denial_code(&fx.engine.can_access(&bob, &forklift).await),
        Some(DenialCode::NotInGroup)
    );
    assert!(!fx
        .engine
        .reachable_tests(&bob)
        .await
        .unwrap()
        .contains(&"t-forklift".into()));

    let moved = Principal {
        role: Role::Trainee {
            groups: [GroupId::from("office"), GroupId::from("warehouse")].into(),
        },
        ..bob.clone()
    };
    fx.store.put_principal(moved.clone()).await.unwrap();

    assert_eq!(
        denial_code(&fx.engine.can_access(&moved, &forklift).await),
        Some(DenialCode::NotEligible)
    );
    assert!(fx
        .engine
        .reachable_tests(&moved)
        .await
        .unwrap()
        .contains(&"t-forklift".into()));
}

#[tokio::test]
async fn cached_access_follows_the_principal_passed_in() {
    let fx = Fixture::new();
    let alice = fx.principal("alice").await;
    let forklift = Entity::Level("forklift".into());

    assert_eq!(
        denial_code(&fx.engine.can_access(&alice, &forklift).await),
        Some(DenialCode::NotEligible)
    );

    let stripped = Principal {
        role: Role::Trainee {
            groups: Default::default(),
        },
        ..alice.clone()
    };
    assert_eq!(
        denial_code(&fx.engine.can_access(&stripped, &forklift).await),
        Some(DenialCode::NotInGroup)
    );
    assert!(!fx
        .engine
        .reachable_tests(&stripped)
        .await
        .unwrap()
        .contains(&"t-forklift".into()));

    let promoted = Principal {
        role: Role::Administrator,
        ..alice.clone()
    };
    assert!(fx.engine.can_access(&promoted, &forklift).await.is_allowed());

    assert_eq!(
        denial_code(&fx.engine.can_access(&alice, &forklift).await),
        Some(DenialCode::NotEligible)
    );
}

#[tokio::test]
async fn gating_changes_invalidate_cached_access() {
    let fx = Fixture::new();
    let guest = fx.principal("guest").await;
    let practice = Entity::Level("practice".into());
    assert!(fx.engine.can_access(&guest, &practice).await.is_allowed());

    let mut level = fx.store.level(&"practice".into()).await.unwrap().unwrap();
    level.gating_groups.insert("warehouse".into());
    fx.store.put_level(level).await.unwrap();

    assert_eq!(
        denial_code(&fx.engine.can_access(&guest, &practice).await),
        Some(DenialCode::NotInGroup)
    );
}

#[tokio::test]
async fn visible_children_filter_by_access() {
    let fx = Fixture::new();
    let admin = fx.principal("admin").await;
    let bob = fx.principal("bob").await;

    let names = |levels: Vec<coursegate_core::model::Level>| -> Vec<String> {
        levels.into_iter().map(|l| l.id.to_string()).collect()
    };
    assert_eq!(
        names(fx.engine.visible_children(&admin, &"intro".into()).await.unwrap()),
        vec!["forklift", "practice"]
    );
    assert_eq!(
        names(fx.engine.visible_children(&bob, &"intro".into()).await.unwrap()),
        vec!["practice"]
    );
}
