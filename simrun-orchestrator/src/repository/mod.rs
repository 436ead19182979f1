//! Job Store
//!
//! Durable keyed record of job metadata and state transitions. The store only
//! persists; transition rules are enforced by the domain types and the
//! orchestrator serializes writes for a given job.

mod job;
mod memory;

pub use job::SqliteJobStore;
pub use memory::InMemoryJobStore;

use async_trait::async_trait;
use simrun_core::domain::job::{JobStatus, SimulationJob};
use uuid::Uuid;

use crate::error::Result;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persists a new job record
    async fn insert(&self, job: &SimulationJob) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<SimulationJob>>;

    /// Lists jobs, most recently created first
    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<SimulationJob>>;

    /// Overwrites an existing record; fails with `NotFound` for unknown ids
    async fn update(&self, job: &SimulationJob) -> Result<()>;

    /// Overwrites the record only if its stored status is still `expected`
    ///
    /// Returns false, leaving the record untouched, when the status moved on
    /// or the job does not exist.
    async fn update_if(&self, job: &SimulationJob, expected: JobStatus) -> Result<bool>;
}
