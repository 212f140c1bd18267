//! coursegate CLI: operator harness over the assessment engine.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;

use commands::StateArgs;

#[derive(Parser)]
#[command(
    name = "coursegate",
    version,
    about = "Training-course access control and assessment engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate course TOML files
    Validate {
        /// Path to a course file or directory
        #[arg(long)]
        course: PathBuf,
    },

    /// Evaluate whether a principal may open an entity
    Access {
        #[command(flatten)]
        state: StateArgs,

        /// Acting principal id
        #[arg(long = "as")]
        principal: String,

        /// Entity as kind:id (level, resource, test, question, result, trainee)
        #[arg(long)]
        entity: String,

        /// Exit code 1 if access is denied
        #[arg(long)]
        fail_on_deny: bool,
    },

    /// Drive a principal's attempt at a test
    Attempt {
        #[command(flatten)]
        state: StateArgs,

        /// Acting principal id
        #[arg(long = "as")]
        principal: String,

        #[command(subcommand)]
        action: AttemptAction,
    },

    /// Wipe every attempt, answer and result for a test
    Reset {
        #[command(flatten)]
        state: StateArgs,

        /// Administrator performing the reset
        #[arg(long = "as")]
        principal: String,

        /// Test to reset
        #[arg(long)]
        test: String,
    },

    /// Print a test leaderboard, or the overall one
    Leaderboard {
        #[command(flatten)]
        state: StateArgs,

        /// Test to rank; omit for the cross-test leaderboard
        #[arg(long)]
        test: Option<String>,

        /// Output format: text, json
        #[arg(long, default_value = "text")]
        format: String,
    },

    /// Create a starter config and example course
    Init,
}

#[derive(Subcommand)]
pub enum AttemptAction {
    /// Begin the attempt
    Start {
        #[arg(long)]
        test: String,
    },
    /// Save an answer to one question
    Answer {
        #[arg(long)]
        question: String,
        /// Scalar answer value
        #[arg(long, conflicts_with = "file")]
        value: Option<String>,
        /// Uploaded file URI, for upload questions
        #[arg(long)]
        file: Option<String>,
    },
    /// Finish and score the attempt
    Finish {
        #[arg(long)]
        test: String,
    },
    /// Re-arm a finished attempt
    Resit {
        #[arg(long)]
        test: String,
    },
    /// Show the attempt marker
    Status {
        #[arg(long)]
        test: String,
    },
}

#[tokio::main]
async fn main() {
    let directive: tracing_subscriber::filter::Directive = match "coursegate=info".parse() {
        Ok(directive) => directive,
        Err(e) => {
            eprintln!("Error: bad log directive: {e}");
            process::exit(1);
        }
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Validate { course } => commands::validate::execute(course),
        Commands::Access {
            state,
            principal,
            entity,
            fail_on_deny,
        } => commands::access::execute(state, principal, entity, fail_on_deny).await,
        Commands::Attempt {
            state,
            principal,
            action,
        } => commands::attempt::execute(state, principal, action).await,
        Commands::Reset {
            state,
            principal,
            test,
        } => commands::reset::execute(state, principal, test).await,
        Commands::Leaderboard {
            state,
            test,
            format,
        } => commands::leaderboard::execute(state, test, format).await,
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
