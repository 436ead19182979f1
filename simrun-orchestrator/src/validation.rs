//! Submission validation
//!
//! Checks that run synchronously inside `submit`, before a job record is
//! created.

use simrun_core::dto::job::SubmitJob;

use crate::config::Config;
use crate::error::{OrchestratorError, Result};

const MAX_NAME_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 1000;
const MAX_TAGS: usize = 10;
const MAX_TAG_CHARS: usize = 50;

/// Engine commands that can reach outside the workspace
const SUSPICIOUS_COMMANDS: [&str; 3] = ["shell", "python", "include"];

/// Whether `name` is a bare file name made of `[A-Za-z0-9._-]`
pub fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// Validates a submission against the configured limits
///
/// Capacity is checked last so that malformed requests are reported as such.
pub fn validate_submission(req: &SubmitJob, config: &Config) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(invalid("name cannot be empty"));
    }
    if req.name.chars().count() > MAX_NAME_CHARS {
        return Err(invalid(format!("name is longer than {} characters", MAX_NAME_CHARS)));
    }
    if req
        .description
        .as_ref()
        .is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_CHARS)
    {
        return Err(invalid(format!(
            "description is longer than {} characters",
            MAX_DESCRIPTION_CHARS
        )));
    }
    if req.tags.len() > MAX_TAGS {
        return Err(invalid(format!("{} tags given, limit is {}", req.tags.len(), MAX_TAGS)));
    }
    if let Some(tag) = req.tags.iter().find(|t| t.chars().count() > MAX_TAG_CHARS) {
        return Err(invalid(format!("tag '{}' is longer than {} characters", tag, MAX_TAG_CHARS)));
    }
    if req.script.trim().is_empty() {
        return Err(invalid("script cannot be empty"));
    }
    if req.script.len() > config.max_script_size {
        return Err(invalid(format!(
            "script is {} bytes, limit is {}",
            req.script.len(),
            config.max_script_size
        )));
    }
    if req.requested_parallelism == 0 {
        return Err(invalid("requested_parallelism must be at least 1"));
    }
    if let Some(bad) = req.auxiliary_files.iter().find(|f| !is_plain_file_name(f)) {
        return Err(invalid(format!("invalid auxiliary file name '{}'", bad)));
    }
    if req.requested_parallelism > config.total_capacity {
        return Err(OrchestratorError::CapacityExceeded {
            requested: req.requested_parallelism,
            capacity: config.total_capacity,
        });
    }
    Ok(())
}

/// Script lines that use a suspicious engine command
///
/// These are accepted; the caller logs them.
pub fn suspicious_lines(script: &str) -> Vec<&str> {
    script
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter(|line| {
            line.split_whitespace()
                .next()
                .is_some_and(|command| SUSPICIOUS_COMMANDS.contains(&command))
        })
        .collect()
}

fn invalid(message: impl Into<String>) -> OrchestratorError {
    OrchestratorError::InvalidSubmission(message.into())
}
