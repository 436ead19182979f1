//! Orchestrator context
//!
//! [`Orchestrator`] owns one job store, one resource ledger, the scheduler
//! state and the worker pool. Instances are fully independent: tests start as
//! many as they like side by side.
//!
//! Locking: every job state transition and every ledger reserve/release
//! happens while holding the scheduler mutex, so the store and the ledger
//! never disagree about which jobs are `RUNNING`.

mod dispatch;
mod finalize;
mod recovery;

use chrono::Utc;
use serde::Serialize;
use simrun_core::domain::artifact::Artifact;
use simrun_core::domain::job::{JobOutcome, JobStatus, SimulationJob};
use simrun_core::domain::log::LogLine;
use simrun_core::dto::job::SubmitJob;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::ledger::{LedgerSnapshot, ResourceLedger};
use crate::lock::DataDirLock;
use crate::logs::{self, LogStream};
use crate::repository::{JobStore, SqliteJobStore};
use crate::scheduler::PendingQueue;
use crate::script_check::{ScriptCheck, check_script};
use crate::supervisor::{CommandLineEngine, EngineInvocation};
use crate::validation::{suspicious_lines, validate_submission};
use crate::worker::{Assignment, WorkerPool};
use crate::workspace::Workspace;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status change notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Handle to a running orchestrator; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: Config,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) engine: Arc<dyn EngineInvocation>,
    pub(crate) ledger: ResourceLedger,
    pub(crate) state: Mutex<SchedulerState>,
    /// Signalled whenever dispatch may be able to make progress
    pub(crate) wake: Notify,
    pub(crate) idle_workers: Arc<Semaphore>,
    pub(crate) events: broadcast::Sender<JobEvent>,
    pub(crate) shutdown: CancellationToken,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    /// Held from start until shutdown completes
    data_lock: std::sync::Mutex<Option<DataDirLock>>,
}

pub(crate) struct SchedulerState {
    pub(crate) queue: PendingQueue,
    /// Jobs holding a ledger reservation, including those waiting out a retry backoff
    pub(crate) running: HashMap<Uuid, RunningJob>,
    /// Retries whose backoff elapsed; their reservation is already held
    pub(crate) retry_ready: VecDeque<Uuid>,
    pub(crate) shutting_down: bool,
}

pub(crate) struct RunningJob {
    pub(crate) slots: u32,
    pub(crate) cancel: CancellationToken,
}

impl Orchestrator {
    /// Starts an orchestrator over the given store and engine
    ///
    /// Jobs left behind by a previous instance are recovered before the first
    /// dispatch.
    pub async fn start(config: Config, store: Arc<dyn JobStore>, engine: Arc<dyn EngineInvocation>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| OrchestratorError::Config(format!("{:#}", e)))?;
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let data_lock = DataDirLock::acquire(&config.data_dir)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let inner = Arc::new(Inner {
            ledger: ResourceLedger::new(config.total_capacity),
            state: Mutex::new(SchedulerState {
                queue: PendingQueue::new(config.aging_interval),
                running: HashMap::new(),
                retry_ready: VecDeque::new(),
                shutting_down: false,
            }),
            wake: Notify::new(),
            idle_workers: Arc::new(Semaphore::new(config.worker_count)),
            events,
            shutdown: CancellationToken::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
            data_lock: std::sync::Mutex::new(Some(data_lock)),
            config,
            store,
            engine,
        });

        inner.recover().await?;

        let (assign_tx, assign_rx) = mpsc::channel::<Assignment>(inner.config.worker_count);
        let pool = WorkerPool::spawn(Arc::clone(&inner), assign_rx, inner.config.worker_count);
        let dispatcher = tokio::spawn(dispatch::run(Arc::clone(&inner), assign_tx));

        {
            let mut tasks = inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.push(dispatcher);
            tasks.extend(pool.into_handles());
        }

        info!(
            capacity = inner.config.total_capacity,
            workers = inner.config.worker_count,
            data_dir = %inner.config.data_dir.display(),
            "Orchestrator started"
        );
        Ok(Self { inner })
    }

    /// Starts an orchestrator with the durable SQLite store and the configured
    /// command-line engine
    pub async fn open(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let store = SqliteJobStore::connect(&config.database_url()).await?;
        let engine = CommandLineEngine::new(config.engine.clone());
        Self::start(config, Arc::new(store), Arc::new(engine)).await
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.inner.store)
    }

    /// Admits a job; it is `QUEUED` when this returns
    ///
    /// Never waits for execution. A request for more slots than the host has
    /// is rejected before anything is stored.
    pub async fn submit(&self, req: SubmitJob) -> Result<Uuid> {
        validate_submission(&req, &self.inner.config)?;
        for line in suspicious_lines(&req.script) {
            warn!(name = %req.name, line, "Script uses a command that can reach outside the workspace");
        }

        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return Err(OrchestratorError::ShuttingDown);
        }

        let mut job = SimulationJob::from_submission(req, Utc::now());
        job.mark_queued(Utc::now())?;
        self.inner.store.insert(&job).await?;
        state.queue.push(job.id, job.priority, job.requested_parallelism);
        self.inner.emit(job.id, JobStatus::Queued);
        drop(state);

        info!(
            job_id = %job.id,
            name = %job.name,
            slots = job.requested_parallelism,
            priority = job.priority,
            "Job queued"
        );
        self.inner.wake.notify_one();
        Ok(job.id)
    }

    /// Runs the engine on a script without submitting it
    ///
    /// Uses the same engine and limits as submitted jobs but takes no slots.
    pub async fn validate_script(&self, script: &str) -> Result<ScriptCheck> {
        check_script(self.inner.engine.as_ref(), &self.inner.config, script).await
    }

    /// Cancels a job and returns its final snapshot
    ///
    /// Queued jobs are cancelled on the spot. For a running job this waits
    /// until the engine is terminated and the job is finalized; if the engine
    /// finished on its own first, the job keeps that outcome and the call
    /// fails with `InvalidState`.
    pub async fn cancel(&self, job_id: Uuid) -> Result<SimulationJob> {
        let events = self.inner.events.subscribe();
        {
            let mut state = self.inner.state.lock().await;
            let mut job = self.get_status(job_id).await?;

            match job.status {
                JobStatus::Created | JobStatus::Queued => {
                    let seen = job.status;
                    job.finish(JobOutcome::cancelled(None), Utc::now())?;
                    if !self.inner.store.update_if(&job, seen).await? {
                        let current = self.get_status(job_id).await?;
                        return Err(OrchestratorError::invalid_state(&current, "cancel"));
                    }
                    state.queue.remove(job_id);
                    self.inner.emit(job_id, JobStatus::Cancelled);
                    drop(state);

                    info!(job_id = %job_id, "Queued job cancelled");
                    return Ok(job);
                }
                JobStatus::Running => match state.running.get(&job_id) {
                    Some(running) => {
                        info!(job_id = %job_id, "Cancellation requested");
                        running.cancel.cancel();

                        // A retry waiting for a worker has no process to stop
                        if let Some(pos) = state.retry_ready.iter().position(|id| *id == job_id) {
                            state.retry_ready.remove(pos);
                            self.inner
                                .finish_locked(&mut state, job_id, JobOutcome::cancelled(None))
                                .await;
                        }
                    }
                    None => return Err(OrchestratorError::invalid_state(&job, "cancel while finalization is pending")),
                },
                _ => return Err(OrchestratorError::invalid_state(&job, "cancel")),
            }
        }

        let job = self.wait_with(job_id, events).await?;
        if job.status == JobStatus::Cancelled {
            Ok(job)
        } else {
            Err(OrchestratorError::invalid_state(&job, "cancel"))
        }
    }

    pub async fn get_status(&self, job_id: Uuid) -> Result<SimulationJob> {
        self.inner
            .store
            .get(job_id)
            .await?
            .ok_or(OrchestratorError::NotFound(job_id))
    }

    /// Jobs in the store, most recent first
    pub async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<SimulationJob>> {
        self.inner.store.list(status).await
    }

    /// Follows the job log from the beginning
    pub async fn stream_log(&self, job_id: Uuid) -> Result<LogStream> {
        self.stream_log_from(job_id, 0).await
    }

    /// Follows the job log starting at sequence number `from_seq`
    pub async fn stream_log_from(&self, job_id: Uuid, from_seq: u64) -> Result<LogStream> {
        self.get_status(job_id).await?;
        Ok(LogStream::new(
            job_id,
            self.log_path(job_id),
            Arc::clone(&self.inner.store),
            self.inner.config.log_poll_interval,
            from_seq,
        ))
    }

    /// Last `n` log lines, `n` clamped to `1..=10_000`
    pub async fn tail_log(&self, job_id: Uuid, n: usize) -> Result<Vec<LogLine>> {
        self.get_status(job_id).await?;
        Ok(logs::tail(&self.log_path(job_id), n).await?)
    }

    /// Artifacts of a terminal job; empty while the job is still live
    pub async fn get_artifacts(&self, job_id: Uuid) -> Result<Vec<Artifact>> {
        let job = self.get_status(job_id).await?;
        if job.is_terminal() {
            Ok(job.artifacts)
        } else {
            Ok(Vec::new())
        }
    }

    /// Waits until the job reaches a terminal state
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> Result<SimulationJob> {
        let events = self.inner.events.subscribe();
        self.wait_with(job_id, events).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    pub fn ledger(&self) -> LedgerSnapshot {
        self.inner.ledger.snapshot()
    }

    pub async fn queued_jobs(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Stops admission and dispatch, then waits for running engines to finish
    ///
    /// Queued jobs stay `QUEUED` in the store and are picked up by the next
    /// instance. Cancel running jobs first for a fast shutdown.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.shutting_down = true;
        }
        self.inner.shutdown.cancel();
        self.inner.wake.notify_one();

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Orchestrator task ended abnormally");
            }
        }
        self.inner
            .data_lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        info!("Orchestrator stopped");
    }

    async fn wait_with(&self, job_id: Uuid, mut events: broadcast::Receiver<JobEvent>) -> Result<SimulationJob> {
        loop {
            // Read under the lock so a terminal job is never observed before its
            // slots are released
            let job = {
                let _state = self.inner.state.lock().await;
                self.get_status(job_id).await?
            };
            if job.is_terminal() {
                return Ok(job);
            }

            loop {
                match events.recv().await {
                    Ok(event) if event.job_id == job_id && event.status.is_terminal() => break,
                    Ok(_) => continue,
                    // Missed events: fall back to the store
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(OrchestratorError::ShuttingDown),
                }
            }
        }
    }

    fn log_path(&self, job_id: Uuid) -> std::path::PathBuf {
        Workspace::layout(&self.inner.config, job_id).log_path
    }
}

impl Inner {
    /// Publishes a status change; callers hold the scheduler lock so events
    /// for one job arrive in transition order
    pub(crate) fn emit(&self, job_id: Uuid, status: JobStatus) {
        // No subscribers is fine
        let _ = self.events.send(JobEvent { job_id, status });
    }
}
