//! Job DTOs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::job::{JobStatus, SimulationJob};

/// Request to submit a new simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJob {
    pub name: String,
    pub description: Option<String>,
    pub script: String,
    pub requested_parallelism: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub auxiliary_files: Vec<String>,
}

impl SubmitJob {
    pub fn new(name: impl Into<String>, script: impl Into<String>, requested_parallelism: u32) -> Self {
        Self {
            name: name.into(),
            description: None,
            script: script.into(),
            requested_parallelism,
            priority: 0,
            tags: Vec::new(),
            auxiliary_files: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn with_auxiliary_file(mut self, file_name: impl Into<String>) -> Self {
        self.auxiliary_files.push(file_name.into());
        self
    }
}

/// Job summary for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub name: String,
    pub status: JobStatus,
    pub requested_parallelism: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<SimulationJob> for JobSummary {
    fn from(job: SimulationJob) -> Self {
        Self {
            id: job.id,
            name: job.name,
            status: job.status,
            requested_parallelism: job.requested_parallelism,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_summary_conversion() {
        let req = SubmitJob::new("melt", "run 1000", 4)
            .with_priority(2)
            .with_tag("copper");
        let job = SimulationJob::from_submission(req, Utc::now());

        let summary: JobSummary = job.clone().into();
        assert_eq!(summary.id, job.id);
        assert_eq!(summary.name, "melt");
        assert_eq!(summary.status, JobStatus::Created);
        assert_eq!(summary.requested_parallelism, 4);
    }

    #[test]
    fn test_submit_defaults_from_json() {
        let req: SubmitJob = serde_json::from_str(
            r#"{"name":"a","description":null,"script":"run 1","requested_parallelism":1}"#,
        )
        .unwrap();
        assert_eq!(req.priority, 0);
        assert!(req.tags.is_empty());
        assert!(req.auxiliary_files.is_empty());
    }
}
