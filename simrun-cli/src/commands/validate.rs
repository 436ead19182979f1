//! Validate command handler
//!
//! Runs the engine on a script without submitting it. No orchestrator is
//! started, so this works while another `run` owns the data directory.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use simrun_orchestrator::Config;
use simrun_orchestrator::script_check::{ScriptCheck, check_script};
use simrun_orchestrator::supervisor::CommandLineEngine;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Engine input script
    pub script: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn handle_validate(args: ValidateArgs, config: Config) -> Result<()> {
    let script = tokio::fs::read_to_string(&args.script)
        .await
        .with_context(|| format!("Failed to read script {}", args.script.display()))?;

    let engine = CommandLineEngine::new(config.engine.clone());
    let verdict = check_script(&engine, &config, &script).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&verdict)?);
    } else {
        print_verdict(&verdict);
    }

    if !verdict.valid {
        anyhow::bail!("{} was rejected by the engine", args.script.display());
    }
    Ok(())
}

fn print_verdict(verdict: &ScriptCheck) {
    if verdict.valid {
        println!("{} {}", "✓".green(), verdict.message);
        return;
    }
    println!("{} {}", "✗".red(), verdict.message.red());
    if let Some(error) = &verdict.error {
        for line in error.lines() {
            println!("  {}", line.dimmed());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(data_dir: &std::path::Path) -> Config {
        let mut config = Config::new(data_dir).with_engine("/bin/sh", &["{script}"]);
        config.engine.check_args = Vec::new();
        config
    }

    #[tokio::test]
    async fn test_accepted_script_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("in.melt");
        std::fs::write(&script, "echo ok\n").unwrap();

        let args = ValidateArgs { script, json: true };
        handle_validate(args, config(&dir.path().join("data"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_script_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("in.bad");
        std::fs::write(&script, "echo 'ERROR: Unknown command' >&2\nexit 1\n").unwrap();

        let args = ValidateArgs { script, json: false };
        let err = handle_validate(args, config(&dir.path().join("data"))).await.unwrap_err();
        assert!(err.to_string().contains("rejected by the engine"));
    }
}
