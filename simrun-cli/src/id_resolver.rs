//! ID resolver module
//!
//! Resolves job ID prefixes to full UUIDs by scanning the job store, so users
//! can type `simrun status 3f2a` instead of the whole identifier.

use anyhow::{Context, Result, anyhow};
use simrun_orchestrator::repository::JobStore;
use uuid::Uuid;

use crate::types::IdOrPrefix;

/// Resolves a job ID or prefix to a full UUID
///
/// A full UUID is returned as-is without touching the store, even if no such
/// job exists; the subsequent lookup reports that.
///
/// # Errors
/// Returns an error if no job matches the prefix, several do, or the store
/// cannot be read.
pub async fn resolve_job_id(store: &dyn JobStore, id_or_prefix: &IdOrPrefix) -> Result<Uuid> {
    if let Some(uuid) = id_or_prefix.as_uuid() {
        return Ok(uuid);
    }

    let jobs = store
        .list(None)
        .await
        .context("Failed to fetch jobs for ID resolution")?;

    let matches: Vec<Uuid> = jobs
        .iter()
        .map(|j| j.id)
        .filter(|id| id_or_prefix.matches(*id))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!("No job found with ID starting with '{}'", id_or_prefix)),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(Uuid::to_string).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple jobs: {}",
                id_or_prefix,
                ids.join(", ")
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use simrun_core::domain::job::SimulationJob;
    use simrun_core::dto::job::SubmitJob;
    use simrun_orchestrator::repository::InMemoryJobStore;

    async fn store_with(ids: &[&str]) -> InMemoryJobStore {
        let store = InMemoryJobStore::new();
        for id in ids {
            let mut job = SimulationJob::from_submission(SubmitJob::new("j", "run 1", 1), Utc::now());
            job.id = Uuid::parse_str(id).unwrap();
            store.insert(&job).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_unique_prefix_resolves() {
        let store = store_with(&[
            "aa000000-0000-4000-8000-000000000001",
            "bb000000-0000-4000-8000-000000000002",
        ])
        .await;

        let id = resolve_job_id(&store, &IdOrPrefix::parse("bb")).await.unwrap();
        assert_eq!(id.to_string(), "bb000000-0000-4000-8000-000000000002");
    }

    #[tokio::test]
    async fn test_ambiguous_and_missing_prefixes_fail() {
        let store = store_with(&[
            "aa000000-0000-4000-8000-000000000001",
            "aa100000-0000-4000-8000-000000000002",
        ])
        .await;

        let err = resolve_job_id(&store, &IdOrPrefix::parse("aa")).await.unwrap_err();
        assert!(err.to_string().contains("Ambiguous"));

        let err = resolve_job_id(&store, &IdOrPrefix::parse("ff")).await.unwrap_err();
        assert!(err.to_string().contains("No job found"));
    }
}
