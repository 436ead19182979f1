//! Job domain types
//!
//! A [`SimulationJob`] is the unit of work: one script executed by the external
//! engine with a requested degree of parallelism. Its status only ever moves
//! forward along the edges encoded in [`JobStatus::can_transition_to`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::artifact::Artifact;
use crate::dto::job::SubmitJob;

/// Simulation job record
///
/// Structure shared between the orchestrator (mutates and persists) and front
/// ends (read-only snapshots).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationJob {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub script: String,
    pub requested_parallelism: u32,

    /// Tie-breaker between queued jobs; higher runs first
    pub priority: i32,
    pub tags: Vec<String>,

    /// Input files copied from the resource root into the job workspace
    pub auxiliary_files: Vec<String>,

    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,

    /// Output files, in collector order
    pub artifacts: Vec<Artifact>,

    /// Captured stdout/stderr of the engine (JSON lines)
    pub log_path: Option<PathBuf>,

    /// Worker-fault retries consumed so far
    pub attempts: u32,

    /// Process group of the live engine run, if any
    pub process_id: Option<i32>,
}

/// Job lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Created,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

/// Classification of a terminal state other than `Completed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The engine exited with a non-zero code
    EngineExecution,
    /// The engine could not be started at all
    LaunchFailure,
    EngineTimeout,
    /// The execution unit itself failed more often than the retry budget allows
    WorkerFault,
    Cancelled,
}

/// Final fields written when a job reaches a terminal state
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job_id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub job_id: Uuid,
    pub from: JobStatus,
    pub to: JobStatus,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Created,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
        JobStatus::TimedOut,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::TimedOut
        )
    }

    /// Whether `self -> next` is an edge of the job state machine
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Created, Queued)
                | (Created, Cancelled)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "CREATED",
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
            JobStatus::TimedOut => "TIMED_OUT",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::EngineExecution => "engine_execution",
            FailureKind::LaunchFailure => "launch_failure",
            FailureKind::EngineTimeout => "engine_timeout",
            FailureKind::WorkerFault => "worker_fault",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "engine_execution" => Ok(FailureKind::EngineExecution),
            "launch_failure" => Ok(FailureKind::LaunchFailure),
            "engine_timeout" => Ok(FailureKind::EngineTimeout),
            "worker_fault" => Ok(FailureKind::WorkerFault),
            "cancelled" => Ok(FailureKind::Cancelled),
            other => Err(format!("unknown failure kind '{}'", other)),
        }
    }
}

impl JobOutcome {
    pub fn completed(artifacts: Vec<Artifact>) -> Self {
        Self {
            status: JobStatus::Completed,
            exit_code: None,
            error: None,
            failure_kind: None,
            artifacts,
        }
    }

    pub fn failed(kind: FailureKind, exit_code: Option<i32>, error: impl Into<String>) -> Self {
        let status = match kind {
            FailureKind::EngineTimeout => JobStatus::TimedOut,
            FailureKind::Cancelled => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        };
        Self {
            status,
            exit_code,
            error: Some(error.into()),
            failure_kind: Some(kind),
            artifacts: Vec::new(),
        }
    }

    pub fn cancelled(exit_code: Option<i32>) -> Self {
        Self::failed(FailureKind::Cancelled, exit_code, "cancelled by request")
    }

    pub fn with_artifacts(mut self, artifacts: Vec<Artifact>) -> Self {
        self.artifacts = artifacts;
        self
    }
}

impl SimulationJob {
    /// Creates a job in `Created` from a validated submission
    pub fn from_submission(req: SubmitJob, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: req.name,
            description: req.description,
            script: req.script,
            requested_parallelism: req.requested_parallelism,
            priority: req.priority,
            tags: req.tags,
            auxiliary_files: req.auxiliary_files,
            status: JobStatus::Created,
            created_at: now,
            queued_at: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            failure_kind: None,
            artifacts: Vec::new(),
            log_path: None,
            attempts: 0,
            process_id: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_queued(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Queued, now)
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(JobStatus::Running, now)
    }

    /// Moves the job into the outcome's terminal state and records its results
    pub fn finish(&mut self, outcome: JobOutcome, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !outcome.status.is_terminal() {
            return Err(self.invalid(outcome.status));
        }
        self.transition(outcome.status, now)?;

        if outcome.status == JobStatus::Completed {
            self.exit_code = None;
            self.error = None;
            self.failure_kind = None;
        } else {
            self.exit_code = outcome.exit_code;
            self.error = outcome.error;
            self.failure_kind = outcome.failure_kind;
        }
        self.artifacts = outcome.artifacts;
        self.process_id = None;
        Ok(())
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(self.invalid(next));
        }

        // Wall-clock steps backwards must not reorder the timestamps
        let at = now.max(self.latest_timestamp());
        match next {
            JobStatus::Queued => self.queued_at = Some(at),
            JobStatus::Running => self.started_at = Some(at),
            _ => self.finished_at = Some(at),
        }
        self.status = next;
        Ok(())
    }

    fn latest_timestamp(&self) -> DateTime<Utc> {
        [self.queued_at, self.started_at, self.finished_at]
            .into_iter()
            .flatten()
            .fold(self.created_at, |latest, at| latest.max(at))
    }

    fn invalid(&self, to: JobStatus) -> TransitionError {
        TransitionError {
            job_id: self.id,
            from: self.status,
            to,
        }
    }
}
