//! The `coursegate reset` command.

use anyhow::Result;

use coursegate_core::model::TestId;

use super::{Session, StateArgs};

pub async fn execute(state: StateArgs, principal: String, test: String) -> Result<()> {
    let session = Session::open(&state)?;
    let operator = session.principal(&principal).await?;
    let test = TestId::new(test);

    session.engine.reset(&operator, &test).await?;
    session.save()?;

    println!("Reset {test}: attempts, answers and results cleared.");
    Ok(())
}
