//! SQLite-backed job store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use simrun_core::domain::artifact::Artifact;
use simrun_core::domain::job::{FailureKind, JobStatus, SimulationJob};
use sqlx::SqlitePool;
use std::path::PathBuf;
use uuid::Uuid;

use crate::db;
use crate::error::{OrchestratorError, Result};
use crate::repository::JobStore;

const SELECT_COLUMNS: &str = r#"
    SELECT id, name, description, script, requested_parallelism, priority, tags,
           auxiliary_files, status, created_at, queued_at, started_at, finished_at,
           exit_code, error, failure_kind, artifacts, log_path, attempts, process_id
    FROM simulation_jobs
"#;

/// Durable job store on top of a SQLite pool
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the database at `database_url` and applies migrations
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = db::create_pool(database_url).await?;
        db::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert(&self, job: &SimulationJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO simulation_jobs (
                id, name, description, script, requested_parallelism, priority, tags,
                auxiliary_files, status, created_at, queued_at, started_at, finished_at,
                exit_code, error, failure_kind, artifacts, log_path, attempts, process_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.description)
        .bind(&job.script)
        .bind(job.requested_parallelism as i64)
        .bind(job.priority as i64)
        .bind(serde_json::to_string(&job.tags)?)
        .bind(serde_json::to_string(&job.auxiliary_files)?)
        .bind(job.status.as_str())
        .bind(job.created_at)
        .bind(job.queued_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.exit_code.map(i64::from))
        .bind(&job.error)
        .bind(job.failure_kind.map(FailureKind::as_str))
        .bind(serde_json::to_string(&job.artifacts)?)
        .bind(job.log_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
        .bind(job.attempts as i64)
        .bind(job.process_id.map(i64::from))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SimulationJob>> {
        let row = sqlx::query_as::<_, JobRow>(&format!("{} WHERE id = $1", SELECT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SimulationJob::try_from).transpose()
    }

    async fn list(&self, status: Option<JobStatus>) -> Result<Vec<SimulationJob>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "{} WHERE status = $1 ORDER BY created_at DESC, rowid DESC",
                    SELECT_COLUMNS
                ))
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, JobRow>(&format!(
                    "{} ORDER BY created_at DESC, rowid DESC",
                    SELECT_COLUMNS
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(SimulationJob::try_from).collect()
    }

    async fn update(&self, job: &SimulationJob) -> Result<()> {
        let rows = self.write(job, None).await?;
        if rows == 0 {
            return Err(OrchestratorError::NotFound(job.id));
        }
        Ok(())
    }

    async fn update_if(&self, job: &SimulationJob, expected: JobStatus) -> Result<bool> {
        Ok(self.write(job, Some(expected)).await? == 1)
    }
}

impl SqliteJobStore {
    /// Overwrites the mutable columns, optionally guarded by the stored status
    async fn write(&self, job: &SimulationJob, expected: Option<JobStatus>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE simulation_jobs
            SET name = $1, description = $2, priority = $3, tags = $4, status = $5,
                queued_at = $6, started_at = $7, finished_at = $8, exit_code = $9,
                error = $10, failure_kind = $11, artifacts = $12, log_path = $13,
                attempts = $14, process_id = $15
            WHERE id = $16 AND ($17 IS NULL OR status = $17)
            "#,
        )
        .bind(&job.name)
        .bind(&job.description)
        .bind(job.priority as i64)
        .bind(serde_json::to_string(&job.tags)?)
        .bind(job.status.as_str())
        .bind(job.queued_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.exit_code.map(i64::from))
        .bind(&job.error)
        .bind(job.failure_kind.map(FailureKind::as_str))
        .bind(serde_json::to_string(&job.artifacts)?)
        .bind(job.log_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
        .bind(job.attempts as i64)
        .bind(job.process_id.map(i64::from))
        .bind(job.id)
        .bind(expected.map(JobStatus::as_str))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    script: String,
    requested_parallelism: i64,
    priority: i64,
    tags: String,
    auxiliary_files: String,
    status: String,
    created_at: DateTime<Utc>,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    exit_code: Option<i64>,
    error: Option<String>,
    failure_kind: Option<String>,
    artifacts: String,
    log_path: Option<String>,
    attempts: i64,
    process_id: Option<i64>,
}

impl TryFrom<JobRow> for SimulationJob {
    type Error = OrchestratorError;

    fn try_from(row: JobRow) -> Result<Self> {
        let status = row.status.parse::<JobStatus>().map_err(decode_error)?;
        let failure_kind = row
            .failure_kind
            .as_deref()
            .map(str::parse::<FailureKind>)
            .transpose()
            .map_err(decode_error)?;
        let artifacts: Vec<Artifact> = serde_json::from_str(&row.artifacts)?;

        Ok(SimulationJob {
            id: row.id,
            name: row.name,
            description: row.description,
            script: row.script,
            requested_parallelism: row.requested_parallelism as u32,
            priority: row.priority as i32,
            tags: serde_json::from_str(&row.tags)?,
            auxiliary_files: serde_json::from_str(&row.auxiliary_files)?,
            status,
            created_at: row.created_at,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
            exit_code: row.exit_code.map(|c| c as i32),
            error: row.error,
            failure_kind,
            artifacts,
            log_path: row.log_path.map(PathBuf::from),
            attempts: row.attempts as u32,
            process_id: row.process_id.map(|p| p as i32),
        })
    }
}

fn decode_error(message: String) -> OrchestratorError {
    OrchestratorError::Storage(sqlx::Error::Decode(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use simrun_core::domain::job::JobOutcome;
    use simrun_core::dto::job::SubmitJob;

    async fn memory_store() -> SqliteJobStore {
        SqliteJobStore::connect("sqlite::memory:").await.unwrap()
    }

    fn job(name: &str) -> SimulationJob {
        SimulationJob::from_submission(
            SubmitJob::new(name, "units metal\nrun 100\n", 2)
                .with_tag("eam")
                .with_auxiliary_file("Cu_u3.eam"),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let store = memory_store().await;
        let job = job("copper");

        store.insert(&job).await.unwrap();
        let loaded = store.get(job.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.name, "copper");
        assert_eq!(loaded.status, JobStatus::Created);
        assert_eq!(loaded.tags, vec!["eam".to_string()]);
        assert_eq!(loaded.auxiliary_files, vec!["Cu_u3.eam".to_string()]);
        assert_eq!(loaded.requested_parallelism, 2);
    }

    #[tokio::test]
    async fn test_get_unknown_returns_none() {
        let store = memory_store().await;
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_persists_terminal_state() {
        let store = memory_store().await;
        let mut job = job("melt");
        store.insert(&job).await.unwrap();

        job.mark_queued(Utc::now()).unwrap();
        job.mark_running(Utc::now()).unwrap();
        job.process_id = Some(1234);
        store.update(&job).await.unwrap();
        assert_eq!(store.get(job.id).await.unwrap().unwrap().process_id, Some(1234));

        job.finish(
            JobOutcome::failed(FailureKind::EngineExecution, Some(2), "ERROR: bad pair style"),
            Utc::now(),
        )
        .unwrap();
        store.update(&job).await.unwrap();

        let loaded = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.exit_code, Some(2));
        assert_eq!(loaded.failure_kind, Some(FailureKind::EngineExecution));
        assert_eq!(loaded.error.as_deref(), Some("ERROR: bad pair style"));
        assert!(loaded.process_id.is_none());
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_update_unknown_job_is_not_found() {
        let store = memory_store().await;
        let job = job("ghost");
        assert!(matches!(
            store.update(&job).await,
            Err(OrchestratorError::NotFound(id)) if id == job.id
        ));
    }

    #[tokio::test]
    async fn test_update_if_only_claims_expected_status() {
        let store = memory_store().await;
        let mut queued = job("claim");
        queued.mark_queued(Utc::now()).unwrap();
        store.insert(&queued).await.unwrap();

        let mut running = queued.clone();
        running.mark_running(Utc::now()).unwrap();
        assert!(store.update_if(&running, JobStatus::Queued).await.unwrap());
        assert!(!store.update_if(&running, JobStatus::Queued).await.unwrap());

        let mut cancelled = queued.clone();
        cancelled.finish(JobOutcome::cancelled(None), Utc::now()).unwrap();
        assert!(!store.update_if(&cancelled, JobStatus::Queued).await.unwrap());
        assert_eq!(store.get(queued.id).await.unwrap().unwrap().status, JobStatus::Running);

        assert!(!store.update_if(&job("ghost"), JobStatus::Created).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let store = memory_store().await;
        let created = job("a");
        let mut queued = job("b");
        queued.mark_queued(Utc::now()).unwrap();

        store.insert(&created).await.unwrap();
        store.insert(&queued).await.unwrap();

        assert_eq!(store.list(None).await.unwrap().len(), 2);

        let only_queued = store.list(Some(JobStatus::Queued)).await.unwrap();
        assert_eq!(only_queued.len(), 1);
        assert_eq!(only_queued[0].id, queued.id);
    }
}
