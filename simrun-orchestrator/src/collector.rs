//! Result Collector
//!
//! Turns a finished supervisor run into a [`JobOutcome`]: scans the job's
//! output directory for artifacts and classifies how the engine ended.

use chrono::{DateTime, Utc};
use simrun_core::domain::artifact::Artifact;
use simrun_core::domain::job::{FailureKind, JobOutcome};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::supervisor::SupervisorOutcome;

/// Declarative artifact discovery rule
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactScan {
    /// Directory to scan, relative to the job workspace
    pub directory: PathBuf,

    /// File name patterns with `*` and `?` wildcards; empty matches everything.
    /// A pattern containing `/` is matched against the relative path instead.
    pub patterns: Vec<String>,

    pub recursive: bool,

    pub order: ArtifactOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactOrder {
    /// Relative path, ascending
    #[default]
    Path,
    /// Most recently modified first
    ModifiedDesc,
}

impl Default for ArtifactScan {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
            patterns: Vec::new(),
            recursive: true,
            order: ArtifactOrder::Path,
        }
    }
}

impl ArtifactScan {
    /// Lists the artifacts under `workspace`
    ///
    /// A missing scan directory yields no artifacts. Symlinks are not
    /// followed.
    pub fn scan(&self, workspace: &Path) -> std::io::Result<Vec<Artifact>> {
        let base = workspace.join(&self.directory);
        let mut artifacts = Vec::new();
        if base.is_dir() {
            self.walk(&base, workspace, &mut artifacts)?;
        }

        match self.order {
            ArtifactOrder::Path => artifacts.sort_by(|a, b| a.relative_path.cmp(&b.relative_path)),
            ArtifactOrder::ModifiedDesc => artifacts.sort_by(|a, b| {
                b.modified_at
                    .cmp(&a.modified_at)
                    .then_with(|| a.relative_path.cmp(&b.relative_path))
            }),
        }
        Ok(artifacts)
    }

    fn walk(&self, dir: &Path, workspace: &Path, out: &mut Vec<Artifact>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();

            if file_type.is_dir() {
                if self.recursive {
                    self.walk(&path, workspace, out)?;
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let relative_path = path.strip_prefix(workspace).unwrap_or(&path).to_path_buf();
            if !self.matches(&path, &relative_path) {
                continue;
            }

            let metadata = entry.metadata()?;
            out.push(Artifact {
                path: path.clone(),
                relative_path,
                size_bytes: metadata.len(),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        Ok(())
    }

    fn matches(&self, path: &Path, relative_path: &Path) -> bool {
        if self.patterns.is_empty() {
            return true;
        }
        let file_name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        let relative = relative_path.to_string_lossy().replace('\\', "/");

        self.patterns.iter().any(|pattern| {
            if pattern.contains('/') {
                wildcard_match(pattern, &relative)
            } else {
                wildcard_match(pattern, &file_name)
            }
        })
    }
}

/// Matches `text` against a pattern where `*` is any run and `?` any one character
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == '?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

/// Classifies a supervisor result into the job's terminal fields
pub fn classify(outcome: &SupervisorOutcome, artifacts: Vec<Artifact>, time_limit: Duration) -> JobOutcome {
    match outcome {
        SupervisorOutcome::Exited { exit_code: 0, .. } => JobOutcome::completed(artifacts),
        SupervisorOutcome::Exited { exit_code, stderr_tail } => {
            let error = if stderr_tail.is_empty() {
                format!("engine exited with code {}", exit_code)
            } else {
                stderr_tail.join("\n")
            };
            JobOutcome::failed(FailureKind::EngineExecution, Some(*exit_code), error).with_artifacts(artifacts)
        }
        SupervisorOutcome::TimedOut { exit_code } => JobOutcome::failed(
            FailureKind::EngineTimeout,
            *exit_code,
            format!("engine exceeded the maximum simulation time of {}s", time_limit.as_secs()),
        )
        .with_artifacts(artifacts),
        SupervisorOutcome::Cancelled { exit_code } => JobOutcome::cancelled(*exit_code).with_artifacts(artifacts),
        SupervisorOutcome::LaunchFailed { error } => {
            JobOutcome::failed(FailureKind::LaunchFailure, None, format!("failed to start engine: {}", error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simrun_core::domain::job::JobStatus;

    fn touch(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_wildcards() {
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("dump.*.lammpstrj", "dump.100.lammpstrj"));
        assert!(wildcard_match("log.?", "log.1"));
        assert!(!wildcard_match("log.?", "log.10"));
        assert!(wildcard_match("*.data", "final.restart.data"));
        assert!(!wildcard_match("*.data", "final.data.bak"));
        assert!(wildcard_match("a*b*c", "aXXbYYc"));
        assert!(!wildcard_match("a*b*c", "aXXbYY"));
    }

    #[test]
    fn test_scan_lists_files_in_path_order() {
        let workspace = tempfile::tempdir().unwrap();
        touch(&workspace.path().join("output/b.dat"), "22");
        touch(&workspace.path().join("output/a.dat"), "1");
        touch(&workspace.path().join("output/sub/c.dat"), "333");
        touch(&workspace.path().join("input/script.in"), "run 1");

        let artifacts = ArtifactScan::default().scan(workspace.path()).unwrap();
        let names: Vec<_> = artifacts.iter().map(|a| a.relative_path.clone()).collect();

        assert_eq!(
            names,
            vec![
                PathBuf::from("output/a.dat"),
                PathBuf::from("output/b.dat"),
                PathBuf::from("output/sub/c.dat"),
            ]
        );
        assert_eq!(artifacts[2].size_bytes, 3);
        assert!(artifacts[0].path.is_absolute() || artifacts[0].path.starts_with(workspace.path()));
    }

    #[test]
    fn test_scan_applies_patterns_and_recursion() {
        let workspace = tempfile::tempdir().unwrap();
        touch(&workspace.path().join("output/dump.1.lammpstrj"), "x");
        touch(&workspace.path().join("output/log.lammps"), "x");
        touch(&workspace.path().join("output/nested/dump.2.lammpstrj"), "x");

        let scan = ArtifactScan {
            patterns: vec!["dump.*".to_string()],
            recursive: false,
            ..ArtifactScan::default()
        };
        let artifacts = scan.scan(workspace.path()).unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].relative_path, PathBuf::from("output/dump.1.lammpstrj"));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let workspace = tempfile::tempdir().unwrap();
        assert!(ArtifactScan::default().scan(workspace.path()).unwrap().is_empty());
    }

    #[test]
    fn test_classify() {
        let limit = Duration::from_secs(60);

        let done = classify(&SupervisorOutcome::Exited { exit_code: 0, stderr_tail: vec![] }, vec![], limit);
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.error.is_none());

        let failed = classify(
            &SupervisorOutcome::Exited {
                exit_code: 1,
                stderr_tail: vec!["ERROR: Unknown pair style".to_string()],
            },
            vec![],
            limit,
        );
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.exit_code, Some(1));
        assert_eq!(failed.error.as_deref(), Some("ERROR: Unknown pair style"));

        let timed_out = classify(&SupervisorOutcome::TimedOut { exit_code: Some(143) }, vec![], limit);
        assert_eq!(timed_out.status, JobStatus::TimedOut);
        assert_eq!(timed_out.failure_kind, Some(FailureKind::EngineTimeout));

        let cancelled = classify(&SupervisorOutcome::Cancelled { exit_code: None }, vec![], limit);
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let launch = classify(&SupervisorOutcome::LaunchFailed { error: "No such file".to_string() }, vec![], limit);
        assert_eq!(launch.status, JobStatus::Failed);
        assert_eq!(launch.failure_kind, Some(FailureKind::LaunchFailure));
    }
}
