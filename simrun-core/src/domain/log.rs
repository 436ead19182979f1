//! Log domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One captured line of engine output
///
/// Lines are stored one JSON document per line in the job's log file and are
/// numbered from zero in the order they were captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub source: LogSource,
    pub message: String,
}

/// Where a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Lines written by the orchestrator itself (launch, termination notices)
    System,
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogSource::Stdout => write!(f, "stdout"),
            LogSource::Stderr => write!(f, "stderr"),
            LogSource::System => write!(f, "system"),
        }
    }
}
