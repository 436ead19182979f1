//! Run command handlers
//!
//! `run` and `batch` start an orchestrator in this process, submit scripts
//! and stay attached until every submitted job is terminal. Ctrl-C cancels
//! whatever is still queued or running.

use anyhow::{Context, Result};
use clap::Args;
use colored::*;
use simrun_core::domain::job::{JobStatus, SimulationJob};
use simrun_core::dto::job::SubmitJob;
use simrun_orchestrator::{Config, Orchestrator, OrchestratorError};
use std::path::{Path, PathBuf};
use tokio::task::JoinSet;
use tracing::debug;
use uuid::Uuid;

use super::job::{colorize_status, print_artifacts, print_job_details, print_log_line};

/// Opens the orchestrator, explaining what to do when the data dir is taken
async fn open_orchestrator(config: Config) -> Result<Orchestrator> {
    Orchestrator::open(config).await.map_err(|e| match e {
        in_use @ OrchestratorError::StoreInUse { .. } => anyhow::Error::new(in_use)
            .context("another simrun run or batch owns this data directory; wait for it or pass a different --data-dir"),
        other => other.into(),
    })
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Engine input script
    pub script: PathBuf,

    /// Execution slots to reserve
    #[arg(short = 'n', long = "np", default_value_t = 1)]
    pub parallelism: u32,

    /// Job name (defaults to the script file name)
    #[arg(long)]
    pub name: Option<String>,

    /// Higher priorities are dispatched first
    #[arg(long, default_value_t = 0, allow_hyphen_values = true)]
    pub priority: i32,

    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Auxiliary input file copied into the workspace (repeatable)
    #[arg(long = "file")]
    pub files: Vec<String>,

    /// Print engine output while the job runs
    #[arg(short, long)]
    pub follow: bool,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    /// Engine input scripts, one job each
    #[arg(required = true)]
    pub scripts: Vec<PathBuf>,

    /// Execution slots to reserve per job
    #[arg(short = 'n', long = "np", default_value_t = 1)]
    pub parallelism: u32,

    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Auxiliary input file copied into every workspace (repeatable)
    #[arg(long = "file")]
    pub files: Vec<String>,
}

pub async fn handle_run(args: RunArgs, mut config: Config) -> Result<()> {
    default_resource_dir(&mut config, &args.script);
    let limit = config.max_simulation_time;

    let mut req = read_submission(&args.script, args.parallelism, &args.tags, &args.files).await?;
    if let Some(name) = args.name {
        req.name = name;
    }
    req = req.with_priority(args.priority);

    let orchestrator = open_orchestrator(config).await?;
    let job_id = orchestrator.submit(req).await?;
    println!("{} Submitted job {}", "✓".green(), job_id.to_string().cyan());

    let follower = args.follow.then(|| {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { follow_log(orchestrator, job_id).await })
    });

    let jobs = wait_all(&orchestrator, &[job_id]).await;
    if let Some(follower) = follower {
        match follower.await {
            Ok(Err(e)) => debug!(job_id = %job_id, error = %e, "Log follower stopped"),
            Err(e) => debug!(job_id = %job_id, error = %e, "Log follower panicked"),
            Ok(Ok(())) => {}
        }
    }
    orchestrator.shutdown().await;

    let job = jobs?
        .into_iter()
        .next()
        .context("job vanished before reaching a terminal state")?;

    println!();
    print_job_details(&job);
    println!();
    print_artifacts(&job.artifacts);

    match OrchestratorError::from_job(&job, limit) {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

pub async fn handle_batch(args: BatchArgs, mut config: Config) -> Result<()> {
    if let Some(first) = args.scripts.first() {
        default_resource_dir(&mut config, first);
    }

    let mut requests = Vec::with_capacity(args.scripts.len());
    for script in &args.scripts {
        requests.push(read_submission(script, args.parallelism, &args.tags, &args.files).await?);
    }

    let orchestrator = open_orchestrator(config).await?;
    let mut ids = Vec::with_capacity(requests.len());
    for req in requests {
        let name = req.name.clone();
        match orchestrator.submit(req).await {
            Ok(id) => {
                println!("{} Submitted {} as {}", "✓".green(), name.bold(), id.to_string().cyan());
                ids.push(id);
            }
            Err(e) => println!("{} {}: {}", "✗".red(), name.bold(), e.to_string().red()),
        }
    }

    let jobs = wait_all(&orchestrator, &ids).await;
    orchestrator.shutdown().await;
    let jobs = jobs?;

    let completed = jobs.iter().filter(|j| j.status == JobStatus::Completed).count();
    println!();
    println!(
        "{}",
        format!("{} of {} job(s) completed", completed, args.scripts.len()).bold()
    );

    if completed < args.scripts.len() {
        anyhow::bail!("{} job(s) did not complete", args.scripts.len() - completed);
    }
    Ok(())
}

/// Builds a submission from a script file
async fn read_submission(script: &Path, parallelism: u32, tags: &[String], files: &[String]) -> Result<SubmitJob> {
    let contents = tokio::fs::read_to_string(script)
        .await
        .with_context(|| format!("Failed to read script {}", script.display()))?;
    let name = script
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "simulation".to_string());

    let mut req = SubmitJob::new(name, contents, parallelism);
    for tag in tags {
        req = req.with_tag(tag.clone());
    }
    for file in files {
        req = req.with_auxiliary_file(file.clone());
    }
    Ok(req)
}

/// Auxiliary files are looked up next to the script unless a resource dir is configured
fn default_resource_dir(config: &mut Config, script: &Path) {
    if config.resource_dir.is_some() {
        return;
    }
    let dir = match script.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    config.resource_dir = Some(dir);
}

/// Waits for every job to finish; the first Ctrl-C cancels all of them
async fn wait_all(orchestrator: &Orchestrator, ids: &[Uuid]) -> Result<Vec<SimulationJob>> {
    let mut waits = JoinSet::new();
    for &id in ids {
        let orchestrator = orchestrator.clone();
        waits.spawn(async move { orchestrator.wait_for_terminal(id).await });
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    let mut finished = Vec::with_capacity(ids.len());

    loop {
        tokio::select! {
            next = waits.join_next() => {
                let Some(joined) = next else { break };
                let job = joined??;
                if ids.len() > 1 {
                    println!(
                        "  {} {} {}",
                        "▸".cyan(),
                        job.name.bold(),
                        colorize_status(&job.status)
                    );
                }
                finished.push(job);
            }
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                println!("{}", "Interrupted, cancelling jobs...".yellow());
                for &id in ids {
                    let orchestrator = orchestrator.clone();
                    tokio::spawn(async move {
                        match orchestrator.cancel(id).await {
                            Ok(_) | Err(OrchestratorError::InvalidState { .. }) => {}
                            Err(e) => debug!(job_id = %id, error = %e, "Cancel failed"),
                        }
                    });
                }
            }
        }
    }

    finished.sort_by_key(|job| ids.iter().position(|id| *id == job.id));
    Ok(finished)
}

async fn follow_log(orchestrator: Orchestrator, job_id: Uuid) -> Result<()> {
    let mut stream = orchestrator.stream_log(job_id).await?;
    while let Some(line) = stream.next().await? {
        print_log_line(&line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_submission_uses_file_name() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("in.melt");
        tokio::fs::write(&script, "units metal\nrun 1000\n").await.unwrap();

        let req = read_submission(&script, 4, &["copper".to_string()], &["Cu_u3.eam".to_string()])
            .await
            .unwrap();

        assert_eq!(req.name, "in.melt");
        assert_eq!(req.requested_parallelism, 4);
        assert_eq!(req.tags, vec!["copper".to_string()]);
        assert_eq!(req.auxiliary_files, vec!["Cu_u3.eam".to_string()]);
        assert!(req.script.contains("run 1000"));
    }

    #[tokio::test]
    async fn test_missing_script_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_submission(&dir.path().join("absent.in"), 1, &[], &[])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("absent.in"));
    }

    #[test]
    fn test_resource_dir_defaults_to_script_directory() {
        let mut config = Config::new("data");
        default_resource_dir(&mut config, Path::new("runs/copper/in.melt"));
        assert_eq!(config.resource_dir, Some(PathBuf::from("runs/copper")));

        let mut config = Config::new("data");
        default_resource_dir(&mut config, Path::new("in.melt"));
        assert_eq!(config.resource_dir, Some(PathBuf::from(".")));

        let mut config = Config::new("data").with_resource_dir("/srv/potentials");
        default_resource_dir(&mut config, Path::new("in.melt"));
        assert_eq!(config.resource_dir, Some(PathBuf::from("/srv/potentials")));
    }
}
