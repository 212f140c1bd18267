//! The `coursegate access` command.

use anyhow::Result;

use coursegate_core::model::{LevelId, PrincipalId, QuestionId, ResourceId, ResultId, TestId};
use coursegate_core::{Decision, Entity};

use super::{Session, StateArgs};

pub async fn execute(
    state: StateArgs,
    principal: String,
    entity: String,
    fail_on_deny: bool,
) -> Result<()> {
    let entity = parse_entity(&entity)?;
    let session = Session::open(&state)?;
    let principal = session.principal(&principal).await?;

    // `access` may finish an expired attempt, so state is saved either way.
    let decision = session.engine.access(&principal, &entity).await;
    session.save()?;

    match &decision {
        Decision::Allow => println!("allowed: {} may open {entity}", principal.id),
        Decision::Deny(denial) => {
            println!("denied: {}", denial.reason);
            if let Some(test) = &denial.failing_test {
                println!("  first unmet prerequisite: {test}");
            }
        }
        Decision::TimeExpired { test } => {
            println!("denied: time expired on {test}; the attempt has been finished");
        }
    }

    if fail_on_deny && !decision.is_allowed() {
        std::process::exit(1);
    }
    Ok(())
}

/// Parse `kind:id` into an entity reference.
fn parse_entity(raw: &str) -> Result<Entity> {
    let Some((kind, id)) = raw.split_once(':') else {
        anyhow::bail!("entity must look like kind:id, got {raw:?}");
    };
    anyhow::ensure!(!id.is_empty(), "entity id is empty in {raw:?}");
    let entity = match kind {
        "level" => Entity::Level(LevelId::new(id)),
        "resource" => Entity::Resource(ResourceId::new(id)),
        "test" => Entity::Test(TestId::new(id)),
        "question" => Entity::Question(QuestionId::new(id)),
        "result" => Entity::Result(ResultId::new(id)),
        "trainee" => Entity::Trainee(PrincipalId::new(id)),
        other => anyhow::bail!("unknown entity kind: {other}"),
    };
    Ok(entity)
}
