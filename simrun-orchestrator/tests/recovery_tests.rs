mod common;

use chrono::Utc;
use common::*;
use simrun_core::domain::job::{FailureKind, JobStatus, SimulationJob};
use simrun_core::dto::job::SubmitJob;
use simrun_orchestrator::{Orchestrator, OrchestratorError};
use simrun_orchestrator::repository::{InMemoryJobStore, JobStore};
use simrun_orchestrator::supervisor::group_alive;
use std::os::unix::process::CommandExt;
use std::sync::Arc;

fn job(name: &str, script: &str) -> SimulationJob {
    SimulationJob::from_submission(SubmitJob::new(name, script, 1), Utc::now())
}

#[tokio::test]
async fn test_recovers_jobs_left_by_previous_instance() {
    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryJobStore::new();

    // An engine process group that outlived its orchestrator
    let mut orphan_engine = std::process::Command::new("/bin/sh")
        .arg("-c")
        .arg("sleep 30")
        .process_group(0)
        .spawn()
        .unwrap();
    let orphan_pgid = orphan_engine.id() as i32;

    let created = job("created", "echo created\n");
    store.insert(&created).await.unwrap();

    let mut queued = job("queued", "echo queued\n");
    store.insert(&queued).await.unwrap();
    queued.mark_queued(Utc::now()).unwrap();
    store.update(&queued).await.unwrap();

    let mut running = job("running", "echo rerun > rerun.dat\n");
    store.insert(&running).await.unwrap();
    running.mark_queued(Utc::now()).unwrap();
    running.mark_running(Utc::now()).unwrap();
    running.process_id = Some(orphan_pgid);
    store.update(&running).await.unwrap();

    let orch = start_with_store(test_config(dir.path(), 1), Arc::new(store.clone())).await;

    let status = tokio::task::spawn_blocking(move || orphan_engine.wait().unwrap())
        .await
        .unwrap();
    assert!(!status.success());
    assert!(!group_alive(orphan_pgid));

    for id in [created.id, queued.id, running.id] {
        let job = wait_terminal(&orch, id).await;
        assert_eq!(job.status, JobStatus::Completed, "job {}", job.name);
    }

    let rerun = orch.get_status(running.id).await.unwrap();
    assert_eq!(rerun.attempts, 1);
    assert_eq!(orch.get_artifacts(running.id).await.unwrap().len(), 1);
    assert_eq!(orch.ledger().committed, 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_orphan_that_no_longer_fits_is_failed() {
    let dir = tempfile::tempdir().unwrap();
    let store = InMemoryJobStore::new();

    let mut wide = SimulationJob::from_submission(SubmitJob::new("wide", "echo hi\n", 4), Utc::now());
    store.insert(&wide).await.unwrap();
    wide.mark_queued(Utc::now()).unwrap();
    wide.mark_running(Utc::now()).unwrap();
    store.update(&wide).await.unwrap();

    // Restarted on a smaller host
    let orch = start_with_store(test_config(dir.path(), 2), Arc::new(store)).await;

    let job = orch.get_status(wide.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.failure_kind, Some(FailureKind::WorkerFault));
    assert_eq!(orch.ledger().committed, 0);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_sqlite_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let orch = Orchestrator::open(test_config(dir.path(), 1)).await.unwrap();
    let done = orch.submit(SubmitJob::new("done", "echo done\n", 1)).await.unwrap();
    assert_eq!(wait_terminal(&orch, done).await.status, JobStatus::Completed);

    let blocker = orch.submit(SubmitJob::new("blocker", gated_script("go"), 1)).await.unwrap();
    wait_for_status(&orch, blocker, JobStatus::Running).await;
    let pending = orch.submit(SubmitJob::new("pending", "echo later\n", 1)).await.unwrap();

    orch.cancel(blocker).await.unwrap();
    orch.shutdown().await;
    drop(orch);

    let pending_after_stop = {
        let reopened = Orchestrator::open(test_config(dir.path(), 1)).await.unwrap();
        let job = wait_terminal(&reopened, pending).await;
        assert_eq!(reopened.get_status(done).await.unwrap().status, JobStatus::Completed);
        assert_eq!(reopened.get_status(blocker).await.unwrap().status, JobStatus::Cancelled);
        assert_eq!(reopened.list_jobs(None).await.unwrap().len(), 3);
        reopened.shutdown().await;
        job
    };
    assert_eq!(pending_after_stop.status, JobStatus::Completed);
}

#[tokio::test]
async fn test_second_instance_cannot_take_over_live_store() {
    let dir = tempfile::tempdir().unwrap();

    let owner = Orchestrator::open(test_config(dir.path(), 1)).await.unwrap();
    let id = owner.submit(SubmitJob::new("long", gated_script("go"), 1)).await.unwrap();
    let running = wait_until(&owner, id, |job| job.status == JobStatus::Running && job.process_id.is_some()).await;
    let pgid = running.process_id.unwrap();

    let second = Orchestrator::open(test_config(dir.path(), 1)).await;
    assert!(matches!(second, Err(OrchestratorError::StoreInUse { .. })));

    // The refused instance must not have touched the live engine or its record
    assert!(group_alive(pgid));
    let job = owner.get_status(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.attempts, 0);

    open_gate(dir.path(), "go");
    assert_eq!(wait_terminal(&owner, id).await.status, JobStatus::Completed);
    owner.shutdown().await;
    drop(owner);

    let successor = Orchestrator::open(test_config(dir.path(), 1)).await.unwrap();
    assert_eq!(successor.get_status(id).await.unwrap().status, JobStatus::Completed);
    successor.shutdown().await;
}
