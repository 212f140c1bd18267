//! The `coursegate leaderboard` command.

use anyhow::Result;
use comfy_table::{Cell, Table};

use coursegate_core::model::TestId;

use super::{Session, StateArgs};

pub async fn execute(state: StateArgs, test: Option<String>, format: String) -> Result<()> {
    let session = Session::open(&state)?;
    let engine = &session.engine;

    match test {
        Some(test) => {
            let board = engine.test_leaderboard(&TestId::new(test.as_str())).await?;
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&board)?),
                "text" => {
                    let mut table = Table::new();
                    table.set_header(vec!["Rank", "Trainee", "Attempt", "Score", "Grade"]);
                    for ranked in &board {
                        let row = &ranked.entry;
                        table.add_row(vec![
                            Cell::new(ranked.rank),
                            Cell::new(row.principal()),
                            Cell::new(row.resit_number() + 1),
                            Cell::new(format!("{}%", row.percentage())),
                            Cell::new(row.grade()),
                        ]);
                    }
                    println!("Leaderboard for {test}");
                    println!("{table}");
                }
                other => anyhow::bail!("unknown format: {other}"),
            }
        }
        None => {
            let board = engine.overall_leaderboard().await?;
            match format.as_str() {
                "json" => println!("{}", serde_json::to_string_pretty(&board)?),
                "text" => {
                    let mut table = Table::new();
                    table.set_header(vec!["Rank", "Trainee", "Tests", "Total"]);
                    for ranked in &board {
                        table.add_row(vec![
                            Cell::new(ranked.rank),
                            Cell::new(&ranked.entry.principal),
                            Cell::new(ranked.entry.tests_taken),
                            Cell::new(ranked.entry.total_percentage),
                        ]);
                    }
                    println!("Overall leaderboard");
                    println!("{table}");
                }
                other => anyhow::bail!("unknown format: {other}"),
            }
        }
    }

    Ok(())
}
