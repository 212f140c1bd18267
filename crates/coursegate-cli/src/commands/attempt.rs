//! The `coursegate attempt` command.

use anyhow::Result;
use comfy_table::{Cell, Table};

use coursegate_core::archive::ArchiveRow;
use coursegate_core::lifecycle::AttemptMarker;
use coursegate_core::model::{Answer, FileRef, Principal, QuestionId, TestId};

use super::{Session, StateArgs};
use crate::AttemptAction;

pub async fn execute(state: StateArgs, principal: String, action: AttemptAction) -> Result<()> {
    let session = Session::open(&state)?;
    let principal = session.principal(&principal).await?;

    // Expiry finishes the attempt before the error surfaces; keep that.
    let outcome = run(&session, &principal, action).await;
    session.save()?;
    outcome
}

async fn run(session: &Session, principal: &Principal, action: AttemptAction) -> Result<()> {
    let engine = &session.engine;
    match action {
        AttemptAction::Start { test } => {
            let marker = engine.start(principal, &TestId::new(test)).await?;
            print_marker(&marker);
        }
        AttemptAction::Answer {
            question,
            value,
            file,
        } => {
            let answer = match (value, file) {
                (Some(value), None) => Answer::scalar(value),
                (None, Some(uri)) => Answer::File(FileRef {
                    name: file_name(&uri).to_string(),
                    uri,
                    size_bytes: 0,
                }),
                _ => anyhow::bail!("pass exactly one of --value or --file"),
            };
            let question = QuestionId::new(question);
            engine.answer(principal, &question, answer).await?;
            println!("Saved answer to {question}");
        }
        AttemptAction::Finish { test } => {
            let row = engine.finish(principal, &TestId::new(test)).await?;
            print_row(&row);
        }
        AttemptAction::Resit { test } => {
            let marker = engine.resit(principal, &TestId::new(test)).await?;
            print_marker(&marker);
        }
        AttemptAction::Status { test } => {
            let marker = engine
                .attempt_state(&principal.id, &TestId::new(test))
                .await?;
            print_marker(&marker);
        }
    }
    Ok(())
}

fn file_name(uri: &str) -> &str {
    uri.rsplit('/').next().unwrap_or(uri)
}

fn print_marker(marker: &AttemptMarker) {
    println!(
        "{} on {}: {} (resat {} time(s))",
        marker.principal, marker.test, marker.state, marker.times_resat
    );
    if let Some(started) = marker.started_at {
        println!("  started  {}", started.to_rfc3339());
    }
    if let Some(finished) = marker.finished_at {
        println!("  finished {}", finished.to_rfc3339());
    }
}

fn print_row(row: &ArchiveRow) {
    let mut table = Table::new();
    table.set_header(vec!["Question", "Correct"]);
    for outcome in row.answers() {
        table.add_row(vec![
            Cell::new(&outcome.question),
            Cell::new(if outcome.correct { "yes" } else { "no" }),
        ]);
    }

    println!(
        "{} finished {} (attempt {}): {}/{} = {}% {} [{}]",
        row.principal(),
        row.test(),
        row.resit_number() + 1,
        row.mark(),
        row.out_of(),
        row.percentage(),
        row.grade(),
        if row.passed() { "passed" } else { "not passed" },
    );
    println!("{table}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_takes_last_segment() {
        assert_eq!(file_name("s3://certs/alice/eyes.pdf"), "eyes.pdf");
        assert_eq!(file_name("eyes.pdf"), "eyes.pdf");
    }
}
