//! Commands module
//!
//! Defines all CLI commands and their handlers.

mod job;
mod run;
mod validate;

pub use job::QueryCommand;
pub use run::{BatchArgs, RunArgs};
pub use validate::ValidateArgs;

use anyhow::Result;
use clap::Subcommand;
use simrun_orchestrator::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Submit a script and supervise it until it finishes
    Run(RunArgs),
    /// Submit several scripts and run them under the shared capacity
    Batch(BatchArgs),
    /// Check a script with the engine without submitting it
    Validate(ValidateArgs),
    #[command(flatten)]
    Query(QueryCommand),
}

/// Routes the command to the appropriate handler module
pub async fn handle_command(command: Commands, config: Config) -> Result<()> {
    match command {
        Commands::Run(args) => run::handle_run(args, config).await,
        Commands::Batch(args) => run::handle_batch(args, config).await,
        Commands::Validate(args) => validate::handle_validate(args, config).await,
        Commands::Query(command) => job::handle_query_command(command, &config).await,
    }
}
