//! Subcommand implementations and the state file they share.

pub mod access;
pub mod attempt;
pub mod init;
pub mod leaderboard;
pub mod reset;
pub mod validate;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;

use coursegate_core::config::load_config_from;
use coursegate_core::memory::MemoryStore;
use coursegate_core::model::{Principal, PrincipalId};
use coursegate_core::parser;
use coursegate_core::traits::{EntityStore, ManualClock};
use coursegate_core::AssessmentEngine;

/// Options shared by every command that reads or writes engine state.
#[derive(Args, Debug, Clone)]
pub struct StateArgs {
    /// JSON snapshot holding engine state between invocations
    #[arg(long, default_value = "coursegate-state.json")]
    pub state: PathBuf,

    /// Course file to seed the snapshot from when it doesn't exist yet
    #[arg(long)]
    pub course: Option<PathBuf>,

    /// Pin the clock to an RFC 3339 instant
    #[arg(long)]
    pub now: Option<String>,

    /// Config file path
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// An engine over a snapshot file, saved back after each command.
pub struct Session {
    store: Arc<MemoryStore>,
    pub engine: AssessmentEngine,
    path: PathBuf,
}

impl Session {
    pub fn open(args: &StateArgs) -> Result<Self> {
        let config = load_config_from(args.config.as_deref())?;

        let store = if args.state.exists() {
            MemoryStore::load_json(&args.state)?
        } else if let Some(course_path) = &args.course {
            let course = parser::parse_course(course_path)?;
            tracing::info!(course = %course.name, state = %args.state.display(), "seeding new state");
            MemoryStore::from_course(course)
        } else {
            anyhow::bail!(
                "state file {} does not exist; pass --course to seed it",
                args.state.display()
            );
        };
        let store = Arc::new(store);

        let mut engine = AssessmentEngine::new(store.clone(), config);
        if let Some(now) = &args.now {
            let instant = DateTime::parse_from_rfc3339(now)
                .with_context(|| format!("invalid --now instant: {now}"))?
                .with_timezone(&Utc);
            engine = engine.with_clock(Arc::new(ManualClock::new(instant)));
        }

        Ok(Self {
            store,
            engine,
            path: args.state.clone(),
        })
    }

    pub async fn principal(&self, id: &str) -> Result<Principal> {
        let id = PrincipalId::new(id);
        self.store
            .principal(&id)
            .await?
            .with_context(|| format!("unknown principal: {id}"))
    }

    pub fn save(&self) -> Result<()> {
        self.store.save_json(&self.path)
    }
}
