//! Process-group signalling and reaping checks

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Sends `signal` to every member of the group; false if the group is gone
pub fn signal_group(pgid: i32, signal: Signal) -> bool {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!(pgid, signal = ?signal, error = %e, "Failed to signal process group");
            false
        }
    }
}

/// Whether any non-zombie process is still in the group
#[cfg(target_os = "linux")]
pub fn group_alive(pgid: i32) -> bool {
    live_members_from_proc(pgid).unwrap_or_else(|| probe(pgid))
}

#[cfg(not(target_os = "linux"))]
pub fn group_alive(pgid: i32) -> bool {
    probe(pgid)
}

fn probe(pgid: i32) -> bool {
    !matches!(killpg(Pid::from_raw(pgid), None), Err(Errno::ESRCH))
}

#[cfg(target_os = "linux")]
fn live_members_from_proc(pgid: i32) -> Option<bool> {
    let entries = std::fs::read_dir("/proc").ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        if !name.to_string_lossy().bytes().all(|b| b.is_ascii_digit()) {
            continue;
        }
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        // Fields after the parenthesised command: state ppid pgrp ...
        let Some(rest) = stat.rfind(')').map(|i| &stat[i + 1..]) else {
            continue;
        };
        let mut fields = rest.split_whitespace();
        let state = fields.next();
        let group = fields.nth(1).and_then(|g| g.parse::<i32>().ok());
        if group == Some(pgid) && !matches!(state, Some("Z") | Some("X")) {
            return Some(true);
        }
    }
    Some(false)
}

async fn wait_until_gone(pgid: i32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !group_alive(pgid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL whatever is left of the group
pub async fn terminate_group(pgid: i32, grace: Duration) {
    if !group_alive(pgid) {
        return;
    }
    debug!(pgid, "Terminating process group");
    signal_group(pgid, Signal::SIGTERM);
    if wait_until_gone(pgid, grace).await {
        return;
    }

    signal_group(pgid, Signal::SIGKILL);
    if !wait_until_gone(pgid, KILL_WAIT).await {
        warn!(pgid, "Process group still alive after SIGKILL");
    }
}

/// Kills the group when dropped unless disarmed
///
/// Held by a supervisor for the lifetime of a run so that a panicking or
/// aborted worker cannot leave engine processes behind.
#[derive(Debug)]
pub struct ProcessGroupGuard {
    pgid: i32,
    armed: bool,
}

impl ProcessGroupGuard {
    pub fn new(pgid: i32) -> Self {
        Self { pgid, armed: true }
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(pgid = self.pgid, "Supervisor dropped with live process group, killing it");
            let _ = killpg(Pid::from_raw(self.pgid), Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_group(script: &str) -> (tokio::process::Child, i32) {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        let pgid = child.id().unwrap() as i32;
        (child, pgid)
    }

    #[tokio::test]
    async fn test_terminate_group_reaps_children() {
        let (mut child, pgid) = spawn_group("sleep 30 & sleep 30 & wait");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(group_alive(pgid));

        terminate_group(pgid, Duration::from_millis(500)).await;
        let status = child.wait().await.unwrap();

        assert!(!status.success());
        assert!(!group_alive(pgid));
    }

    #[tokio::test]
    async fn test_guard_kills_group_on_drop() {
        let (mut child, pgid) = spawn_group("sleep 30");
        drop(ProcessGroupGuard::new(pgid));

        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_disarmed_guard_leaves_group_alone() {
        let (mut child, pgid) = spawn_group("exit 3");
        let mut guard = ProcessGroupGuard::new(pgid);
        guard.disarm();
        drop(guard);

        assert_eq!(child.wait().await.unwrap().code(), Some(3));
    }

    #[test]
    fn test_signal_missing_group() {
        // Process groups are never this large on Linux
        assert!(!signal_group(i32::MAX - 1, Signal::SIGTERM));
    }
}
