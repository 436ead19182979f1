//! Process Supervisor
//!
//! Runs one engine invocation from spawn to reaping:
//! - spawns the engine in its own process group with piped output
//! - pumps stdout/stderr line by line into the job log
//! - enforces the wall-clock deadline and honours cancellation
//! - terminates the whole group (SIGTERM, grace period, SIGKILL)
//! - makes sure no group member survives before reporting
//!
//! A run is split in two steps, [`Supervisor::launch`] and
//! [`LaunchedEngine::supervise`], so the caller can record the process
//! group id in between.

mod engine;
mod process_group;

pub use engine::{CommandLineEngine, EngineInvocation, Invocation};
pub use process_group::{ProcessGroupGuard, group_alive, signal_group, terminate_group};

use nix::sys::signal::Signal;
use simrun_core::domain::log::LogSource;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::logs::LogWriter;

type LogMessage = (LogSource, String);

const LOG_CHANNEL_CAPACITY: usize = 1024;

/// How a supervised run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorOutcome {
    /// The engine exited on its own; signal deaths are reported as `128 + signal`
    Exited { exit_code: i32, stderr_tail: Vec<String> },
    TimedOut { exit_code: Option<i32> },
    Cancelled { exit_code: Option<i32> },
    /// The engine never started
    LaunchFailed { error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Deadline,
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Deadline => write!(f, "deadline exceeded"),
            StopReason::Cancelled => write!(f, "cancellation requested"),
        }
    }
}

/// Parameters of one supervised run
pub struct Supervisor {
    pub job_id: Uuid,
    pub deadline: Instant,
    pub termination_grace: Duration,
    pub cancel: CancellationToken,
    pub log_path: PathBuf,
    pub error_tail_lines: usize,
}

/// A running engine owned by its supervisor
pub struct LaunchedEngine {
    job_id: Uuid,
    child: Child,
    guard: ProcessGroupGuard,
    deadline: Instant,
    termination_grace: Duration,
    cancel: CancellationToken,
    log_tx: Option<mpsc::Sender<LogMessage>>,
    pumps: Vec<JoinHandle<()>>,
    writer: JoinHandle<LogWriter>,
}

impl Supervisor {
    /// Spawns the engine; the command's stdio, group and working directory are
    /// set here
    pub async fn launch(self, mut command: Command, working_dir: PathBuf) -> Result<LaunchedEngine, SupervisorOutcome> {
        let mut writer = LogWriter::open(&self.log_path, self.error_tail_lines)
            .await
            .map_err(|e| launch_failed(format!("cannot open job log {}: {}", self.log_path.display(), e)))?;

        let program = format!("{:?}", command.as_std());
        command
            .current_dir(&working_dir)
            .process_group(0)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let error = format!("{}: {}", program, e);
                let _ = writer.append(LogSource::System, format!("failed to start engine: {}", error)).await;
                return Err(launch_failed(error));
            }
        };

        let Some(pgid) = child.id().map(|pid| pid as i32) else {
            return Err(launch_failed("engine exited before its process id was known"));
        };
        let guard = ProcessGroupGuard::new(pgid);
        let _ = writer
            .append(LogSource::System, format!("started engine (pid {}): {}", pgid, program))
            .await;
        info!(job_id = %self.job_id, pgid, "Engine started");

        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(stdout, LogSource::Stdout, log_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(stderr, LogSource::Stderr, log_tx.clone()));
        }

        Ok(LaunchedEngine {
            job_id: self.job_id,
            child,
            guard,
            deadline: self.deadline,
            termination_grace: self.termination_grace,
            cancel: self.cancel,
            log_tx: Some(log_tx),
            pumps,
            writer: spawn_writer(writer, log_rx),
        })
    }
}

impl LaunchedEngine {
    pub fn pgid(&self) -> i32 {
        self.guard.pgid()
    }

    /// Waits for exit, deadline or cancellation and reaps the process group
    pub async fn supervise(mut self) -> SupervisorOutcome {
        let (status, stop) = if self.cancel.is_cancelled() {
            self.stop(StopReason::Cancelled).await
        } else {
            let trigger = tokio::select! {
                status = self.child.wait() => Ok(status),
                _ = tokio::time::sleep_until(self.deadline) => Err(StopReason::Deadline),
                _ = self.cancel.cancelled() => Err(StopReason::Cancelled),
            };
            match trigger {
                Ok(status) => (status, None),
                Err(reason) => self.stop(reason).await,
            }
        };

        // The leader is gone; engine workers it forked may not be
        let pgid = self.pgid();
        if group_alive(pgid) {
            self.system_log(format!("terminating leftover processes in group {}", pgid)).await;
            terminate_group(pgid, self.termination_grace).await;
        }
        self.guard.disarm();

        let exit_code = status.as_ref().ok().map(|s| exit_code_of(*s));
        let stderr_tail = self.finish_logging().await;
        debug!(job_id = %self.job_id, exit_code = ?exit_code, "Engine reaped");

        match (stop, status) {
            (Some(StopReason::Deadline), _) => SupervisorOutcome::TimedOut { exit_code },
            (Some(StopReason::Cancelled), _) => SupervisorOutcome::Cancelled { exit_code },
            (None, Ok(status)) => SupervisorOutcome::Exited {
                exit_code: exit_code_of(status),
                stderr_tail,
            },
            (None, Err(e)) => SupervisorOutcome::Exited {
                exit_code: -1,
                stderr_tail: vec![format!("failed to wait for engine: {}", e)],
            },
        }
    }

    /// Cooperative then forceful termination of the group
    async fn stop(&mut self, reason: StopReason) -> (std::io::Result<ExitStatus>, Option<StopReason>) {
        let pgid = self.pgid();
        info!(job_id = %self.job_id, pgid, reason = %reason, "Stopping engine");
        self.system_log(format!("{}: sending SIGTERM to process group {}", reason, pgid)).await;
        signal_group(pgid, Signal::SIGTERM);

        if let Ok(status) = tokio::time::timeout(self.termination_grace, self.child.wait()).await {
            return (status, Some(reason));
        }

        // A cancellation that arrives during the grace period wins
        let reason = if self.cancel.is_cancelled() {
            StopReason::Cancelled
        } else {
            reason
        };
        self.system_log(format!("grace period elapsed: sending SIGKILL to process group {}", pgid))
            .await;
        signal_group(pgid, Signal::SIGKILL);
        (self.child.wait().await, Some(reason))
    }

    async fn system_log(&self, message: String) {
        if let Some(tx) = &self.log_tx {
            let _ = tx.send((LogSource::System, message)).await;
        }
    }

    /// Drains the output pumps and returns the stderr tail
    async fn finish_logging(&mut self) -> Vec<String> {
        self.log_tx = None;

        let drain_limit = self.termination_grace + Duration::from_secs(1);
        for pump in self.pumps.iter_mut() {
            if tokio::time::timeout(drain_limit, &mut *pump).await.is_err() {
                warn!(job_id = %self.job_id, "Output pipe still open after the engine exited");
                pump.abort();
            }
        }

        match (&mut self.writer).await {
            Ok(writer) => writer.stderr_tail(),
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Log writer task failed");
                Vec::new()
            }
        }
    }
}

fn launch_failed(error: impl Into<String>) -> SupervisorOutcome {
    SupervisorOutcome::LaunchFailed { error: error.into() }
}

fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

fn spawn_pump<R>(reader: R, source: LogSource, tx: mpsc::Sender<LogMessage>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if tx.send((source, line)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "Failed to read engine output");
                    break;
                }
            }
        }
    })
}

fn spawn_writer(mut writer: LogWriter, mut rx: mpsc::Receiver<LogMessage>) -> JoinHandle<LogWriter> {
    tokio::spawn(async move {
        while let Some((source, message)) = rx.recv().await {
            if let Err(e) = writer.append(source, message).await {
                warn!(path = %writer.path().display(), error = %e, "Failed to append to job log");
            }
        }
        writer
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::read_lines;

    struct Fixture {
        _dir: tempfile::TempDir,
        log_path: PathBuf,
        work_dir: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let work_dir = dir.path().join("output");
        std::fs::create_dir_all(&work_dir).unwrap();
        Fixture {
            log_path: dir.path().join("engine.log"),
            work_dir,
            _dir: dir,
        }
    }

    fn supervisor(fx: &Fixture, limit: Duration, cancel: CancellationToken) -> Supervisor {
        Supervisor {
            job_id: Uuid::new_v4(),
            deadline: Instant::now() + limit,
            termination_grace: Duration::from_millis(300),
            cancel,
            log_path: fx.log_path.clone(),
            error_tail_lines: 2,
        }
    }

    fn sh(script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script);
        command
    }

    async fn run(fx: &Fixture, script: &str, limit: Duration, cancel: CancellationToken) -> SupervisorOutcome {
        let launched = supervisor(fx, limit, cancel)
            .launch(sh(script), fx.work_dir.clone())
            .await
            .unwrap();
        launched.supervise().await
    }

    #[tokio::test]
    async fn test_successful_run_captures_output() {
        let fx = fixture();
        let outcome = run(&fx, "echo hello; echo oops >&2; touch result.dat", Duration::from_secs(10), CancellationToken::new()).await;

        assert!(matches!(outcome, SupervisorOutcome::Exited { exit_code: 0, .. }));
        assert!(fx.work_dir.join("result.dat").exists());

        let lines = read_lines(&fx.log_path).await.unwrap();
        assert!(lines.iter().any(|l| l.source == LogSource::Stdout && l.message == "hello"));
        assert!(lines.iter().any(|l| l.source == LogSource::Stderr && l.message == "oops"));
    }

    #[tokio::test]
    async fn test_failure_keeps_last_stderr_lines() {
        let fx = fixture();
        let outcome = run(
            &fx,
            "echo one >&2; echo two >&2; echo three >&2; exit 7",
            Duration::from_secs(10),
            CancellationToken::new(),
        )
        .await;

        assert_eq!(
            outcome,
            SupervisorOutcome::Exited {
                exit_code: 7,
                stderr_tail: vec!["two".to_string(), "three".to_string()],
            }
        );
    }

    #[tokio::test]
    async fn test_deadline_terminates_whole_group() {
        let fx = fixture();
        let launched = supervisor(&fx, Duration::from_millis(200), CancellationToken::new())
            .launch(sh("sleep 30 & sleep 30 & wait"), fx.work_dir.clone())
            .await
            .unwrap();
        let pgid = launched.pgid();

        let outcome = launched.supervise().await;

        assert!(matches!(outcome, SupervisorOutcome::TimedOut { .. }));
        assert!(!group_alive(pgid));
    }

    #[tokio::test]
    async fn test_sigterm_ignoring_engine_is_killed() {
        let fx = fixture();
        let started = std::time::Instant::now();
        let outcome = run(&fx, "trap '' TERM; sleep 30", Duration::from_millis(100), CancellationToken::new()).await;

        assert_eq!(outcome, SupervisorOutcome::TimedOut { exit_code: Some(128 + 9) });
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = run(&fx, "sleep 30", Duration::from_secs(30), cancel).await;
        assert!(matches!(outcome, SupervisorOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_supervise_stops_immediately() {
        let fx = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = run(&fx, "sleep 30", Duration::from_secs(30), cancel).await;
        assert!(matches!(outcome, SupervisorOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_failure() {
        let fx = fixture();
        let result = supervisor(&fx, Duration::from_secs(1), CancellationToken::new())
            .launch(Command::new("/nonexistent/engine"), fx.work_dir.clone())
            .await;

        assert!(matches!(result, Err(SupervisorOutcome::LaunchFailed { .. })));
    }
}
