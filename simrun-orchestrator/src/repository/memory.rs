//! In-memory job store
//!
//! Not durable; used for isolated orchestrator instances in tests and
//! short-lived embeddings.

use async_trait::async_trait;
use simrun_core::domain::job::{JobStatus, SimulationJob};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::repository::JobStore;

#[derive(Debug, Clone, Default)]
pub struct InMemoryJobStore {
    // Insertion sequence breaks created_at ties when listing
    jobs: Arc<RwLock<HashMap<Uuid, (u64, SimulationJob)>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &SimulationJob) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let seq = jobs.len() as u64;
        jobs.insert(job.id, (seq, job.clone()));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SimulationJob>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(&id).map(|(_, job)| job.clone()))
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<SimulationJob>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut matching: Vec<&(u64, SimulationJob)> = jobs
            .values()
            .filter(|(_, job)| status.is_none_or(|s| job.status == s))
            .collect();
        matching.sort_by(|(seq_a, a), (seq_b, b)| {
            b.created_at.cmp(&a.created_at).then(seq_b.cmp(seq_a))
        });
        Ok(matching.into_iter().map(|(_, job)| job.clone()).collect())
    }

    async fn update(&self, job: &SimulationJob) -> Result<()> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job.id) {
            Some((_, stored)) => {
                *stored = job.clone();
                Ok(())
            }
            None => Err(OrchestratorError::NotFound(job.id)),
        }
    }

    async fn update_if(&self, job: &SimulationJob, expected: JobStatus) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job.id) {
            Some((_, stored)) if stored.status == expected => {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use simrun_core::dto::job::SubmitJob;

    #[tokio::test]
    async fn test_list_is_newest_first() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let older = SimulationJob::from_submission(SubmitJob::new("old", "run 1", 1), now - Duration::seconds(5));
        let newer = SimulationJob::from_submission(SubmitJob::new("new", "run 1", 1), now);

        store.insert(&older).await.unwrap();
        store.insert(&newer).await.unwrap();

        let names: Vec<String> = store.list(None).await.unwrap().into_iter().map(|j| j.name).collect();
        assert_eq!(names, vec!["new".to_string(), "old".to_string()]);
    }

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let store = InMemoryJobStore::new();
        let job = SimulationJob::from_submission(SubmitJob::new("x", "run 1", 1), Utc::now());
        assert!(store.update(&job).await.is_err());

        store.insert(&job).await.unwrap();
        let mut changed = job.clone();
        changed.mark_queued(Utc::now()).unwrap();
        store.update(&changed).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_update_if_checks_stored_status() {
        let store = InMemoryJobStore::new();
        let mut job = SimulationJob::from_submission(SubmitJob::new("x", "run 1", 1), Utc::now());
        job.mark_queued(Utc::now()).unwrap();
        store.insert(&job).await.unwrap();

        let mut claimed = job.clone();
        claimed.mark_running(Utc::now()).unwrap();
        assert!(store.update_if(&claimed, JobStatus::Queued).await.unwrap());

        // A second claim of the same queued job loses
        assert!(!store.update_if(&claimed, JobStatus::Queued).await.unwrap());
        assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Running);
    }
}
