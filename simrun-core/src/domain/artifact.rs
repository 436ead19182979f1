//! Artifact domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// An output file produced by a simulation run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Absolute location of the file
    pub path: PathBuf,

    /// Location relative to the job workspace
    pub relative_path: PathBuf,

    pub size_bytes: u64,

    pub modified_at: Option<DateTime<Utc>>,
}
