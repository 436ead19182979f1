//! Startup recovery
//!
//! Picks up where a previous orchestrator process left off:
//! - `QUEUED` jobs re-enter the queue in their original order
//! - `CREATED` jobs are admitted
//! - `RUNNING` jobs lost their worker: any engine still alive is terminated
//!   and the job is handled as a worker fault

use chrono::Utc;
use simrun_core::domain::job::{FailureKind, JobOutcome, JobStatus, SimulationJob};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Inner, RunningJob};
use crate::error::Result;
use crate::supervisor::terminate_group;

impl Inner {
    pub(crate) async fn recover(self: &Arc<Self>) -> Result<()> {
        let mut jobs = self.store.list(None).await?;
        jobs.reverse();

        let mut queued: Vec<&SimulationJob> = jobs.iter().filter(|j| j.status == JobStatus::Queued).collect();
        queued.sort_by_key(|j| j.queued_at);
        let created: Vec<&SimulationJob> = jobs.iter().filter(|j| j.status == JobStatus::Created).collect();
        let running: Vec<&SimulationJob> = jobs.iter().filter(|j| j.status == JobStatus::Running).collect();

        if queued.is_empty() && created.is_empty() && running.is_empty() {
            return Ok(());
        }

        {
            let mut state = self.state.lock().await;
            for job in &queued {
                state.queue.push(job.id, job.priority, job.requested_parallelism);
            }
            for job in &created {
                let mut job = (*job).clone();
                job.mark_queued(Utc::now())?;
                if self.store.update_if(&job, JobStatus::Created).await? {
                    state.queue.push(job.id, job.priority, job.requested_parallelism);
                }
            }
        }

        for job in &running {
            self.recover_running(job).await;
        }

        info!(
            queued = queued.len(),
            created = created.len(),
            running = running.len(),
            "Recovered jobs from a previous run"
        );
        self.wake.notify_one();
        Ok(())
    }

    async fn recover_running(self: &Arc<Self>, job: &SimulationJob) {
        if let Some(pgid) = job.process_id {
            warn!(job_id = %job.id, pgid, "Terminating engine left behind by a previous run");
            terminate_group(pgid, self.config.termination_grace).await;
        }

        let mut state = self.state.lock().await;
        if self.ledger.try_reserve(job.requested_parallelism) {
            state.running.insert(
                job.id,
                RunningJob {
                    slots: job.requested_parallelism,
                    cancel: CancellationToken::new(),
                },
            );
            drop(state);
            self.worker_fault(job.id, "orchestrator restarted while the job was running".to_string())
                .await;
            return;
        }

        let outcome = JobOutcome::failed(
            FailureKind::WorkerFault,
            None,
            "orchestrator restarted while the job was running and its slots are no longer available",
        );
        if let Err(e) = self.write_terminal(job.id, outcome).await {
            error!(job_id = %job.id, error = %e, "Could not fail orphaned job");
        }
    }
}
