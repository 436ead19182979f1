#![allow(dead_code)]

use simrun_core::domain::job::{JobStatus, SimulationJob};
use simrun_orchestrator::repository::{InMemoryJobStore, JobStore};
use simrun_orchestrator::scheduler::RetryPolicy;
use simrun_orchestrator::supervisor::{CommandLineEngine, EngineInvocation};
use simrun_orchestrator::{Config, Orchestrator};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Configuration running job scripts with `/bin/sh` and short timings
pub fn test_config(data_dir: &Path, capacity: u32) -> Config {
    let mut config = Config::new(data_dir)
        .with_capacity(capacity)
        .with_workers(4)
        .with_engine("/bin/sh", &["{script}"]);
    config.engine.parallel_launcher = Vec::new();
    config.engine.check_args = Vec::new();
    config.max_simulation_time = Duration::from_secs(30);
    config.termination_grace = Duration::from_millis(300);
    config.log_poll_interval = Duration::from_millis(20);
    config.retry = RetryPolicy::new(2, Duration::from_millis(20));
    config
}

pub async fn start(config: Config) -> Orchestrator {
    start_with_store(config, Arc::new(InMemoryJobStore::new())).await
}

pub async fn start_with_store(config: Config, store: Arc<dyn JobStore>) -> Orchestrator {
    let engine = CommandLineEngine::new(config.engine.clone());
    start_with(config, store, Arc::new(engine)).await
}

pub async fn start_with(config: Config, store: Arc<dyn JobStore>, engine: Arc<dyn EngineInvocation>) -> Orchestrator {
    Orchestrator::start(config, store, engine).await.unwrap()
}

/// Script that blocks until `<data_dir>/<gate>` exists
///
/// The engine runs in `<data_dir>/<job_id>/output`.
pub fn gated_script(gate: &str) -> String {
    format!("while [ ! -e ../../{gate} ]; do sleep 0.05; done\necho released\n")
}

pub fn open_gate(data_dir: &Path, gate: &str) {
    std::fs::write(data_dir.join(gate), "").unwrap();
}

/// Polls the job until `predicate` holds
pub async fn wait_until<F>(orch: &Orchestrator, job_id: Uuid, predicate: F) -> SimulationJob
where
    F: Fn(&SimulationJob) -> bool,
{
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let job = orch.get_status(job_id).await.unwrap();
            if predicate(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timed out waiting for job")
}

pub async fn wait_for_status(orch: &Orchestrator, job_id: Uuid, status: JobStatus) -> SimulationJob {
    wait_until(orch, job_id, |job| job.status == status).await
}

pub async fn wait_terminal(orch: &Orchestrator, job_id: Uuid) -> SimulationJob {
    tokio::time::timeout(Duration::from_secs(30), orch.wait_for_terminal(job_id))
        .await
        .expect("timed out waiting for terminal state")
        .unwrap()
}
