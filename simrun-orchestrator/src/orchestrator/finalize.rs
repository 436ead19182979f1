//! Finalization and worker-fault handling
//!
//! The terminal store write and the ledger release are done together while
//! holding the scheduler lock. If the write cannot be made, the slots stay
//! reserved: capacity is never returned for a job the store still shows as
//! `RUNNING`.

use chrono::Utc;
use simrun_core::domain::job::{FailureKind, JobOutcome, SimulationJob};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Inner, SchedulerState};
use crate::collector;
use crate::error::{OrchestratorError, Result};
use crate::supervisor::SupervisorOutcome;
use crate::workspace::Workspace;

const FINAL_WRITE_ATTEMPTS: u32 = 3;
const FINAL_WRITE_BACKOFF: Duration = Duration::from_millis(200);

impl Inner {
    /// Collects the results of a supervised run and finalizes the job
    pub(crate) async fn finalize(&self, job_id: Uuid, outcome: SupervisorOutcome) {
        let scan = self.config.artifacts.clone();
        let root = Workspace::layout(&self.config, job_id).root;
        let artifacts = match tokio::task::spawn_blocking(move || scan.scan(&root)).await {
            Ok(Ok(artifacts)) => artifacts,
            Ok(Err(e)) => {
                warn!(job_id = %job_id, error = %e, "Artifact scan failed");
                Vec::new()
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Artifact scan task failed");
                Vec::new()
            }
        };

        let outcome = collector::classify(&outcome, artifacts, self.config.max_simulation_time);
        let mut state = self.state.lock().await;
        self.finish_locked(&mut state, job_id, outcome).await;
    }

    /// Records the terminal state and releases the job's slots
    pub(crate) async fn finish_locked(&self, state: &mut SchedulerState, job_id: Uuid, outcome: JobOutcome) {
        let Some(running) = state.running.remove(&job_id) else {
            warn!(job_id = %job_id, "Finalizing a job that holds no reservation");
            return;
        };

        match self.write_terminal(job_id, outcome).await {
            Ok(job) => {
                self.ledger.release(running.slots);
                info!(
                    job_id = %job_id,
                    status = %job.status,
                    exit_code = ?job.exit_code,
                    artifacts = job.artifacts.len(),
                    committed = self.ledger.committed(),
                    "Job finished"
                );
                self.wake.notify_one();
                self.emit(job_id, job.status);
            }
            Err(e) => {
                error!(
                    job_id = %job_id,
                    slots = running.slots,
                    error = %e,
                    "Could not record terminal state, slots stay reserved until restart recovery"
                );
            }
        }
    }

    /// Terminal write with a few retries for transient store errors
    pub(crate) async fn write_terminal(&self, job_id: Uuid, outcome: JobOutcome) -> Result<SimulationJob> {
        let mut attempt = 1;
        loop {
            match self.try_write_terminal(job_id, &outcome).await {
                Ok(job) => return Ok(job),
                Err(e) if attempt < FINAL_WRITE_ATTEMPTS && !e.is_client_error() => {
                    warn!(job_id = %job_id, attempt, error = %e, "Terminal write failed, retrying");
                    tokio::time::sleep(FINAL_WRITE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_write_terminal(&self, job_id: Uuid, outcome: &JobOutcome) -> Result<SimulationJob> {
        let mut job = self
            .store
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::NotFound(job_id))?;
        job.finish(outcome.clone(), Utc::now())?;
        self.store.update(&job).await?;
        Ok(job)
    }

    /// Handles a failure of the execution unit itself
    ///
    /// The job keeps its reservation and stays `RUNNING` while it waits out
    /// the backoff, then re-enters dispatch ahead of the queue. Once the retry
    /// budget is spent it fails with [`FailureKind::WorkerFault`].
    pub(crate) async fn worker_fault(self: &Arc<Self>, job_id: Uuid, reason: String) {
        let mut state = self.state.lock().await;
        let Some(cancel) = state.running.get(&job_id).map(|r| r.cancel.clone()) else {
            warn!(job_id = %job_id, reason = %reason, "Worker fault for a job that holds no reservation");
            return;
        };

        if cancel.is_cancelled() {
            self.finish_locked(&mut state, job_id, JobOutcome::cancelled(None)).await;
            return;
        }

        let mut job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                error!(job_id = %job_id, "Faulted job is missing from the store");
                return;
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Cannot load faulted job, slots stay reserved until restart recovery");
                return;
            }
        };

        let attempt = job.attempts + 1;
        if !self.config.retry.allows(attempt) {
            error!(
                job_id = %job_id,
                retries = job.attempts,
                reason = %reason,
                "Worker fault retry budget exhausted"
            );
            let message = format!("worker fault after {} retries: {}", job.attempts, reason);
            let outcome = JobOutcome::failed(FailureKind::WorkerFault, None, message);
            self.finish_locked(&mut state, job_id, outcome).await;
            return;
        }

        job.attempts = attempt;
        job.process_id = None;
        if let Err(e) = self.store.update(&job).await {
            warn!(job_id = %job_id, error = %e, "Could not record retry attempt");
        }
        drop(state);

        let delay = self.config.retry.delay_for(attempt);
        warn!(
            job_id = %job_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "Worker fault, retrying after backoff"
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.backoff(job_id, delay, cancel).await });
    }

    async fn backoff(&self, job_id: Uuid, delay: Duration, cancel: CancellationToken) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let mut state = self.state.lock().await;
                if state.running.contains_key(&job_id) {
                    state.retry_ready.push_back(job_id);
                    drop(state);
                    self.wake.notify_one();
                }
            }
            _ = cancel.cancelled() => {
                let mut state = self.state.lock().await;
                self.finish_locked(&mut state, job_id, JobOutcome::cancelled(None)).await;
            }
            _ = self.shutdown.cancelled() => {
                debug!(job_id = %job_id, "Backoff abandoned at shutdown");
            }
        }
    }
}
