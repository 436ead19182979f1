//! Job command handlers
//!
//! Read-only queries against the durable job store: listing, details, logs
//! and artifacts. These never start an orchestrator, so they are safe to run
//! while another `simrun` process is executing jobs.

use anyhow::{Result, anyhow};
use clap::Subcommand;
use colored::*;
use simrun_core::domain::artifact::Artifact;
use simrun_core::domain::job::{JobStatus, SimulationJob};
use simrun_core::domain::log::{LogLine, LogSource};
use simrun_core::dto::job::JobSummary;
use simrun_orchestrator::Config;
use simrun_orchestrator::logs;
use simrun_orchestrator::repository::{JobStore, SqliteJobStore};
use simrun_orchestrator::workspace::Workspace;

use crate::id_resolver::resolve_job_id;
use crate::types::IdOrPrefix;

/// Query subcommands
#[derive(Subcommand)]
pub enum QueryCommand {
    /// List jobs, most recent first
    List {
        /// Only show jobs in this status (e.g. queued, running, failed)
        #[arg(long)]
        status: Option<JobStatus>,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Show job details
    Status {
        /// Job ID or unambiguous prefix
        id: String,

        /// Print the full record as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show captured engine output
    Logs {
        /// Job ID or unambiguous prefix
        id: String,

        /// Only print the last N lines
        #[arg(short, long)]
        tail: Option<usize>,
    },
    /// List the output files of a finished job
    Artifacts {
        /// Job ID or unambiguous prefix
        id: String,
    },
}

pub async fn handle_query_command(command: QueryCommand, config: &Config) -> Result<()> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let store = SqliteJobStore::connect(&config.database_url()).await?;

    match command {
        QueryCommand::List { status, json } => list_jobs(&store, status, json).await,
        QueryCommand::Status { id, json } => show_job(&store, &id, json).await,
        QueryCommand::Logs { id, tail } => show_logs(&store, config, &id, tail).await,
        QueryCommand::Artifacts { id } => show_artifacts(&store, &id).await,
    }
}

async fn list_jobs(store: &dyn JobStore, status: Option<JobStatus>, json: bool) -> Result<()> {
    let jobs = store.list(status).await?;

    if json {
        let summaries: Vec<JobSummary> = jobs.into_iter().map(JobSummary::from).collect();
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("{}", "No jobs found.".yellow());
    } else {
        println!("{}", format!("Found {} job(s):", jobs.len()).bold());
        println!();
        for job in jobs {
            print_job_summary(&job.into());
        }
    }

    Ok(())
}

async fn load_job(store: &dyn JobStore, id: &str) -> Result<SimulationJob> {
    let uuid = resolve_job_id(store, &IdOrPrefix::parse(id)).await?;
    store
        .get(uuid)
        .await?
        .ok_or_else(|| anyhow!("Job {} not found", uuid))
}

async fn show_job(store: &dyn JobStore, id: &str, json: bool) -> Result<()> {
    let job = load_job(store, id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job_details(&job);
    }
    Ok(())
}

async fn show_logs(store: &dyn JobStore, config: &Config, id: &str, tail: Option<usize>) -> Result<()> {
    let job = load_job(store, id).await?;
    let path = job
        .log_path
        .clone()
        .unwrap_or_else(|| Workspace::layout(config, job.id).log_path);

    let lines = match tail {
        Some(n) => logs::tail(&path, n).await?,
        None => logs::read_lines(&path).await?,
    };

    if lines.is_empty() {
        println!("{}", "No logs found for this job.".yellow());
    } else {
        println!("{}", format!("Logs for job {}:", job.id).bold());
        println!("{}", "─".repeat(80).dimmed());
        for line in &lines {
            print_log_line(line);
        }
        println!("{}", "─".repeat(80).dimmed());
    }

    Ok(())
}

async fn show_artifacts(store: &dyn JobStore, id: &str) -> Result<()> {
    let job = load_job(store, id).await?;

    if !job.is_terminal() {
        println!(
            "{}",
            format!("Job {} is {}; artifacts are collected when it finishes.", job.id, job.status).yellow()
        );
        return Ok(());
    }

    print_artifacts(&job.artifacts);
    Ok(())
}

// =============================================================================
// Output helpers
// =============================================================================

pub(crate) fn print_job_summary(job: &JobSummary) {
    println!("  {} {} {}", "▸".cyan(), job.name.bold(), job.id.to_string().dimmed());
    println!("    Status:   {}", colorize_status(&job.status));
    println!("    Slots:    {}", job.requested_parallelism);
    println!(
        "    Created:  {}",
        job.created_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
    );
    println!();
}

pub(crate) fn print_job_details(job: &SimulationJob) {
    println!("{}", "Job Details:".bold());
    println!("  ID:          {}", job.id.to_string().cyan());
    println!("  Name:        {}", job.name);
    if let Some(description) = &job.description {
        println!("  Description: {}", description);
    }
    println!("  Status:      {}", colorize_status(&job.status));
    println!("  Slots:       {}", job.requested_parallelism);
    println!("  Priority:    {}", job.priority);
    if !job.tags.is_empty() {
        println!("  Tags:        {}", job.tags.join(", "));
    }
    println!("  Created:     {}", job.created_at.format("%Y-%m-%d %H:%M:%S"));

    if let Some(started) = job.started_at {
        println!("  Started:     {}", started.format("%Y-%m-%d %H:%M:%S"));
    }

    if let Some(finished) = job.finished_at {
        println!("  Finished:    {}", finished.format("%Y-%m-%d %H:%M:%S"));

        if let Some(started) = job.started_at {
            let duration = finished.signed_duration_since(started);
            println!("  Duration:    {}s", duration.num_seconds());
        }
    }

    if job.attempts > 0 {
        println!("  Retries:     {}", job.attempts);
    }

    if job.is_terminal() {
        println!("\n{}", "Result:".bold());
        println!(
            "  Success:    {}",
            if job.status == JobStatus::Completed {
                "✓".green()
            } else {
                "✗".red()
            }
        );
        if let Some(code) = job.exit_code {
            println!("  Exit Code:  {}", code);
        }
        if let Some(kind) = job.failure_kind {
            println!("  Reason:     {}", kind);
        }
        if let Some(error) = &job.error {
            println!("\n{}", "Error:".bold());
            println!("{}", error.red());
        }
    }
}

pub(crate) fn print_artifacts(artifacts: &[Artifact]) {
    if artifacts.is_empty() {
        println!("{}", "No artifacts produced.".yellow());
        return;
    }

    println!("{}", format!("Artifacts ({}):", artifacts.len()).bold());
    for artifact in artifacts {
        println!(
            "  {} {} {}",
            "▸".cyan(),
            artifact.relative_path.display(),
            format!("({} bytes)", artifact.size_bytes).dimmed()
        );
    }
}

pub(crate) fn print_log_line(line: &LogLine) {
    let source = format!("{:<6}", line.source.to_string());
    let source_colored = match line.source {
        LogSource::Stdout => source.dimmed(),
        LogSource::Stderr => source.red(),
        LogSource::System => source.cyan(),
    };

    println!(
        "{} [{}] {}",
        line.timestamp.format("%H:%M:%S").to_string().dimmed(),
        source_colored,
        line.message
    );
}

pub(crate) fn colorize_status(status: &JobStatus) -> ColoredString {
    let status_str = status.as_str();
    match status {
        JobStatus::Created | JobStatus::Queued => status_str.yellow(),
        JobStatus::Running => status_str.cyan(),
        JobStatus::Completed => status_str.green(),
        JobStatus::Failed | JobStatus::TimedOut => status_str.red(),
        JobStatus::Cancelled => status_str.dimmed(),
    }
}
