//! Data directory ownership
//!
//! One orchestrator owns a data directory at a time. Recovery treats every
//! `RUNNING` record as orphaned and signals its process group, so a second
//! instance on the same store would kill the first one's engines. Ownership
//! is an exclusive `flock` on `<data_dir>/.lock`, released when the lock is
//! dropped or the owning process dies.

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{OrchestratorError, Result};

const LOCK_FILE_NAME: &str = ".lock";

#[derive(Debug)]
pub struct DataDirLock {
    path: PathBuf,
    _file: Flock<File>,
}

impl DataDirLock {
    /// Takes the lock without waiting; fails with `StoreInUse` if another
    /// orchestrator holds it
    pub fn acquire(data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(LOCK_FILE_NAME);
        // No truncate on open: the current owner's pid must survive a failed attempt
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let locked = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, Errno::EWOULDBLOCK)) => {
                let owner = std::fs::read_to_string(&path)
                    .ok()
                    .map(|pid| pid.trim().to_string())
                    .filter(|pid| !pid.is_empty())
                    .unwrap_or_else(|| "unknown".to_string());
                return Err(OrchestratorError::StoreInUse {
                    data_dir: data_dir.to_path_buf(),
                    owner,
                });
            }
            Err((_, errno)) => return Err(std::io::Error::from(errno).into()),
        };

        let mut owner: &File = &locked;
        owner.set_len(0)?;
        write!(owner, "{}", std::process::id())?;
        debug!(path = %path.display(), "Data directory locked");

        Ok(Self { path, _file: locked })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_owner_is_refused_until_release() {
        let dir = tempfile::tempdir().unwrap();

        let first = DataDirLock::acquire(dir.path()).unwrap();
        let err = DataDirLock::acquire(dir.path()).unwrap_err();
        match err {
            OrchestratorError::StoreInUse { owner, .. } => {
                assert_eq!(owner, std::process::id().to_string());
            }
            other => panic!("unexpected error: {other}"),
        }

        drop(first);
        let again = DataDirLock::acquire(dir.path()).unwrap();
        assert!(again.path().ends_with(".lock"));
    }

    #[test]
    fn test_separate_directories_do_not_conflict() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let _a = DataDirLock::acquire(a.path()).unwrap();
        let _b = DataDirLock::acquire(b.path()).unwrap();
    }
}
