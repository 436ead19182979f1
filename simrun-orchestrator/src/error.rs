//! Error types for the orchestrator

use simrun_core::domain::job::{FailureKind, JobStatus, SimulationJob, TransitionError};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by the orchestration engine
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Requested parallelism can never be satisfied on this host
    #[error("requested parallelism {requested} exceeds total capacity {capacity}")]
    CapacityExceeded { requested: u32, capacity: u32 },

    /// Operation attempted on a job in an incompatible state
    #[error("job {job_id} is {status}: cannot {operation}")]
    InvalidState {
        job_id: Uuid,
        status: JobStatus,
        operation: String,
    },

    #[error("job not found: {0}")]
    NotFound(Uuid),

    /// Submission rejected by validation
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    /// The engine exited with a non-zero status
    #[error("engine failed with exit code {exit_code:?}: {diagnostics}")]
    EngineExecution {
        exit_code: Option<i32>,
        diagnostics: String,
    },

    #[error("engine exceeded the maximum simulation time of {limit:?}")]
    EngineTimeout { limit: Duration },

    /// The execution unit failed more often than the retry budget allows
    #[error("worker fault: {0}")]
    WorkerFault(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Another orchestrator process owns the data directory
    #[error("data directory {} is in use by another orchestrator (pid {owner})", .data_dir.display())]
    StoreInUse { data_dir: PathBuf, owner: String },

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    pub fn invalid_state(job: &SimulationJob, operation: impl Into<String>) -> Self {
        Self::InvalidState {
            job_id: job.id,
            status: job.status,
            operation: operation.into(),
        }
    }

    /// Error describing why a terminal job did not complete, if it didn't
    ///
    /// Execution-time failures are never returned from `submit`; front ends
    /// use this to turn a terminal snapshot into a typed error.
    pub fn from_job(job: &SimulationJob, limit: Duration) -> Option<Self> {
        let diagnostics = job.error.clone().unwrap_or_default();
        match (job.status, job.failure_kind) {
            (JobStatus::Failed, Some(FailureKind::WorkerFault)) => Some(Self::WorkerFault(diagnostics)),
            (JobStatus::Failed, _) => Some(Self::EngineExecution {
                exit_code: job.exit_code,
                diagnostics,
            }),
            (JobStatus::TimedOut, _) => Some(Self::EngineTimeout { limit }),
            (JobStatus::Cancelled, _) => Some(Self::invalid_state(job, "report a result")),
            _ => None,
        }
    }

    /// Whether the error is a caller mistake rather than an engine failure
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::CapacityExceeded { .. }
                | Self::InvalidState { .. }
                | Self::NotFound(_)
                | Self::InvalidSubmission(_)
        )
    }
}

impl From<TransitionError> for OrchestratorError {
    fn from(err: TransitionError) -> Self {
        Self::InvalidState {
            job_id: err.job_id,
            status: err.from,
            operation: format!("move to {}", err.to),
        }
    }
}
