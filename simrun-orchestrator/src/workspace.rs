//! Per-job workspace on disk
//!
//! Layout under the data root:
//! - `<job_id>/input/` - the script and copied auxiliary files
//! - `<job_id>/output/` - working directory of the engine, scanned for artifacts
//! - `<job_id>/logs/engine.log` - captured engine output as JSON lines

use simrun_core::domain::job::SimulationJob;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::validation::is_plain_file_name;

#[derive(Debug, Clone)]
pub struct Workspace {
    pub root: PathBuf,
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub script_path: PathBuf,
    pub log_path: PathBuf,
}

impl Workspace {
    /// Resolves the workspace paths of a job without touching the filesystem
    pub fn layout(config: &Config, job_id: Uuid) -> Self {
        let root = config.workspace_for(job_id);
        let input_dir = root.join("input");
        let logs_dir = root.join("logs");
        Self {
            script_path: input_dir.join(&config.engine.script_file_name),
            log_path: logs_dir.join("engine.log"),
            output_dir: root.join("output"),
            input_dir,
            logs_dir,
            root,
        }
    }

    /// Creates the directories and writes the job inputs
    ///
    /// Safe to call again for a retried job: the script is rewritten,
    /// auxiliary files are copied over the previous ones and the output of
    /// the faulted attempt is discarded so it cannot show up as artifacts.
    pub async fn prepare(&self, job: &SimulationJob, resource_dir: Option<&Path>) -> Result<()> {
        if job.attempts > 0 {
            match tokio::fs::remove_dir_all(&self.output_dir).await {
                Ok(()) => debug!(job_id = %job.id, attempt = job.attempts, "Cleared output of previous attempt"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        for dir in [&self.input_dir, &self.output_dir, &self.logs_dir] {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&self.script_path, job.script.as_bytes()).await?;

        for name in &job.auxiliary_files {
            self.copy_auxiliary(job.id, name, resource_dir).await?;
        }
        Ok(())
    }

    async fn copy_auxiliary(&self, job_id: Uuid, name: &str, resource_dir: Option<&Path>) -> Result<()> {
        if !is_plain_file_name(name) {
            return Err(OrchestratorError::InvalidSubmission(format!(
                "auxiliary file name '{}' is not a plain file name",
                name
            )));
        }

        let Some(resource_dir) = resource_dir else {
            warn!(job_id = %job_id, file = name, "No resource directory configured, skipping auxiliary file");
            return Ok(());
        };

        let Some(source) = resolve_inside(resource_dir, name).await else {
            warn!(job_id = %job_id, file = name, "Auxiliary file not found, skipping");
            return Ok(());
        };

        tokio::fs::copy(&source, self.input_dir.join(name)).await?;
        info!(job_id = %job_id, file = name, "Copied auxiliary file");
        Ok(())
    }
}

/// Canonical path of `root/name` if it exists and does not leave `root`
async fn resolve_inside(root: &Path, name: &str) -> Option<PathBuf> {
    let root = tokio::fs::canonicalize(root).await.ok()?;
    let candidate = tokio::fs::canonicalize(root.join(name)).await.ok()?;
    let metadata = tokio::fs::metadata(&candidate).await.ok()?;
    (candidate.starts_with(&root) && metadata.is_file()).then_some(candidate)
}
