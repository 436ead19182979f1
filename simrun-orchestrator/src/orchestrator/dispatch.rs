//! Dispatch loop
//!
//! A single task hands queued jobs to idle workers. It waits for an idle
//! worker first, then for a job it can reserve capacity for. When the head of
//! the queue does not fit it sleeps until something releases capacity.

use chrono::Utc;
use simrun_core::domain::job::JobStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Inner, RunningJob};
use crate::error::Result;
use crate::worker::Assignment;

const DISPATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

pub(super) async fn run(inner: Arc<Inner>, assign_tx: mpsc::Sender<Assignment>) {
    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&inner.idle_workers).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = inner.shutdown.cancelled() => break,
        };

        let assignment = loop {
            match inner.next_assignment().await {
                Ok(Some(assignment)) => break Some(assignment),
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "Dispatch failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(DISPATCH_RETRY_DELAY) => continue,
                        _ = inner.shutdown.cancelled() => break None,
                    }
                }
            }
            tokio::select! {
                _ = inner.wake.notified() => {}
                _ = inner.shutdown.cancelled() => break None,
            }
        };
        let Some(mut assignment) = assignment else {
            break;
        };

        assignment.permit = Some(permit);
        if assign_tx.send(assignment).await.is_err() {
            warn!("Worker pool is gone, stopping dispatch");
            break;
        }
    }
    debug!("Dispatcher stopped");
}

impl Inner {
    /// Picks the next job to run and moves it to `RUNNING`
    ///
    /// Retries whose backoff elapsed go first; they already hold their slots.
    /// Otherwise only the head of the queue is considered.
    pub(crate) async fn next_assignment(&self) -> Result<Option<Assignment>> {
        let mut state = self.state.lock().await;
        if state.shutting_down {
            return Ok(None);
        }

        while let Some(job_id) = state.retry_ready.pop_front() {
            let Some(running) = state.running.get(&job_id) else {
                continue;
            };
            let cancel = running.cancel.clone();
            match self.store.get(job_id).await {
                Ok(Some(job)) if job.status == JobStatus::Running => {
                    info!(job_id = %job_id, attempt = job.attempts, "Retrying job after worker fault");
                    return Ok(Some(Assignment::new(job, cancel, self.deadline())));
                }
                Ok(_) => {
                    warn!(job_id = %job_id, "Retry entry no longer running, dropping it");
                    if let Some(stale) = state.running.remove(&job_id) {
                        self.ledger.release(stale.slots);
                        self.wake.notify_one();
                    }
                }
                Err(e) => {
                    state.retry_ready.push_front(job_id);
                    return Err(e);
                }
            }
        }

        let Some(head) = state.queue.head(std::time::Instant::now()).cloned() else {
            return Ok(None);
        };
        if !self.ledger.try_reserve(head.slots) {
            debug!(
                job_id = %head.job_id,
                slots = head.slots,
                committed = self.ledger.committed(),
                "Head of queue does not fit, waiting for capacity"
            );
            return Ok(None);
        }

        let mut job = match self.store.get(head.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.ledger.release(head.slots);
                state.queue.remove(head.job_id);
                warn!(job_id = %head.job_id, "Queued job vanished from the store");
                self.wake.notify_one();
                return Ok(None);
            }
            Err(e) => {
                self.ledger.release(head.slots);
                return Err(e);
            }
        };

        if let Err(e) = job.mark_running(Utc::now()) {
            self.ledger.release(head.slots);
            state.queue.remove(head.job_id);
            warn!(job_id = %head.job_id, error = %e, "Dropping queue entry for a job that is not queued");
            self.wake.notify_one();
            return Ok(None);
        }
        match self.store.update_if(&job, JobStatus::Queued).await {
            Ok(true) => {}
            Ok(false) => {
                self.ledger.release(head.slots);
                state.queue.remove(head.job_id);
                warn!(job_id = %head.job_id, "Job left QUEUED in the store before dispatch, dropping entry");
                self.wake.notify_one();
                return Ok(None);
            }
            Err(e) => {
                self.ledger.release(head.slots);
                return Err(e);
            }
        }

        state.queue.remove(head.job_id);
        let cancel = CancellationToken::new();
        state.running.insert(
            job.id,
            RunningJob {
                slots: head.slots,
                cancel: cancel.clone(),
            },
        );
        self.emit(job.id, JobStatus::Running);
        drop(state);

        info!(
            job_id = %job.id,
            slots = head.slots,
            committed = self.ledger.committed(),
            "Job dispatched"
        );
        Ok(Some(Assignment::new(job, cancel, self.deadline())))
    }

    /// Deadline of a run dispatched now
    fn deadline(&self) -> Instant {
        Instant::now() + self.config.max_simulation_time
    }
}
