//! Worker Pool
//!
//! A fixed number of long-lived workers pull assignments from a shared
//! channel. Each worker runs one job at a time: it prepares the workspace,
//! owns the job's supervisor until the engine is reaped, and hands the result
//! to finalization. The supervisor runs in its own task so that a panic in it
//! is caught here and treated as a worker fault instead of taking the worker
//! down.

use simrun_core::domain::job::SimulationJob;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{OrchestratorError, Result};
use crate::orchestrator::Inner;
use crate::supervisor::{Invocation, Supervisor, SupervisorOutcome};
use crate::workspace::Workspace;

/// A dispatched job on its way to a worker
pub(crate) struct Assignment {
    pub(crate) job: SimulationJob,
    pub(crate) cancel: CancellationToken,
    pub(crate) deadline: Instant,
    /// Idle-worker permit, returned when the worker is done with the job
    pub(crate) permit: Option<OwnedSemaphorePermit>,
}

impl Assignment {
    pub(crate) fn new(job: SimulationJob, cancel: CancellationToken, deadline: Instant) -> Self {
        Self {
            job,
            cancel,
            deadline,
            permit: None,
        }
    }
}

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(inner: Arc<Inner>, rx: mpsc::Receiver<Assignment>, size: usize) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..size)
            .map(|worker_id| {
                let inner = Arc::clone(&inner);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move { worker_loop(worker_id, inner, rx).await })
            })
            .collect();
        Self { handles }
    }

    pub(crate) fn into_handles(self) -> Vec<JoinHandle<()>> {
        self.handles
    }
}

async fn worker_loop(worker_id: usize, inner: Arc<Inner>, rx: Arc<Mutex<mpsc::Receiver<Assignment>>>) {
    debug!(worker_id, "Worker started");
    loop {
        // Idle workers park here until the dispatcher hands out a job
        let assignment = { rx.lock().await.recv().await };
        let Some(mut assignment) = assignment else {
            break;
        };
        let permit = assignment.permit.take();
        let job_id = assignment.job.id;

        info!(worker_id, job_id = %job_id, "Worker picked up job");
        execute(&inner, assignment).await;
        drop(permit);
    }
    debug!(worker_id, "Worker stopped");
}

async fn execute(inner: &Arc<Inner>, assignment: Assignment) {
    let job_id = assignment.job.id;
    let task = tokio::spawn(run_engine(Arc::clone(inner), assignment));

    match task.await {
        Ok(Ok(outcome)) => inner.finalize(job_id, outcome).await,
        Ok(Err(OrchestratorError::InvalidSubmission(error))) => {
            inner.finalize(job_id, SupervisorOutcome::LaunchFailed { error }).await
        }
        Ok(Err(e)) => inner.worker_fault(job_id, e.to_string()).await,
        Err(e) => inner.worker_fault(job_id, describe_join_error(e)).await,
    }
}

/// Prepares the workspace and supervises one engine run to completion
async fn run_engine(inner: Arc<Inner>, assignment: Assignment) -> Result<SupervisorOutcome> {
    let Assignment {
        mut job,
        cancel,
        deadline,
        ..
    } = assignment;
    let config = &inner.config;

    let workspace = Workspace::layout(config, job.id);
    workspace.prepare(&job, config.resource_dir.as_deref()).await?;

    let invocation = Invocation {
        job_id: job.id,
        script_path: workspace.script_path.clone(),
        parallelism: job.requested_parallelism,
        workspace: workspace.root.clone(),
        output_dir: workspace.output_dir.clone(),
    };
    let command = inner.engine.command(&invocation);

    let supervisor = Supervisor {
        job_id: job.id,
        deadline,
        termination_grace: config.termination_grace,
        cancel,
        log_path: workspace.log_path.clone(),
        error_tail_lines: config.error_tail_lines,
    };
    let launched = match supervisor.launch(command, workspace.output_dir.clone()).await {
        Ok(launched) => launched,
        Err(outcome) => return Ok(outcome),
    };

    job.log_path = Some(workspace.log_path.clone());
    job.process_id = Some(launched.pgid());
    if let Err(e) = inner.store.update(&job).await {
        warn!(job_id = %job.id, error = %e, "Could not record engine process group");
    }

    Ok(launched.supervise().await)
}

fn describe_join_error(err: JoinError) -> String {
    if err.is_cancelled() {
        return "execution task was cancelled".to_string();
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("execution task panicked: {}", message)
}
