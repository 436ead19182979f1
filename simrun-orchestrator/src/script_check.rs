//! Engine-backed script checking
//!
//! Runs the engine once on a script in a throwaway directory, with the
//! configured check arguments appended, and reports whether it accepted the
//! input. Nothing is stored and no slots are committed.

use serde::Serialize;
use std::process::Stdio;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{OrchestratorError, Result};
use crate::supervisor::{EngineInvocation, Invocation, ProcessGroupGuard, terminate_group};

/// Verdict of a script check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptCheck {
    pub valid: bool,
    pub message: String,
    /// Engine diagnostics when the script was rejected
    pub error: Option<String>,
}

impl ScriptCheck {
    fn accepted() -> Self {
        Self {
            valid: true,
            message: "Script is valid".to_string(),
            error: None,
        }
    }

    fn rejected(message: &str, error: impl Into<String>) -> Self {
        Self {
            valid: false,
            message: message.to_string(),
            error: Some(error.into()),
        }
    }
}

/// Checks `script` by running the engine on it
///
/// Scripts that could never be submitted are refused with `InvalidSubmission`
/// without starting the engine. An engine that does not finish within
/// `validation_timeout` has its process group terminated.
pub async fn check_script(engine: &dyn EngineInvocation, config: &Config, script: &str) -> Result<ScriptCheck> {
    if script.trim().is_empty() {
        return Err(OrchestratorError::InvalidSubmission("script cannot be empty".to_string()));
    }
    if script.len() > config.max_script_size {
        return Err(OrchestratorError::InvalidSubmission(format!(
            "script is {} bytes, limit is {}",
            script.len(),
            config.max_script_size
        )));
    }

    let check_id = Uuid::new_v4();
    let scratch = config.data_dir.join(".validate").join(check_id.to_string());
    tokio::fs::create_dir_all(&scratch).await?;

    let result = run_check(engine, config, script, check_id, &scratch).await;

    if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
        warn!(path = %scratch.display(), error = %e, "Failed to remove script check directory");
    }
    result
}

async fn run_check(
    engine: &dyn EngineInvocation,
    config: &Config,
    script: &str,
    check_id: Uuid,
    scratch: &std::path::Path,
) -> Result<ScriptCheck> {
    let script_path = scratch.join(&config.engine.script_file_name);
    tokio::fs::write(&script_path, script.as_bytes()).await?;

    let invocation = Invocation {
        job_id: check_id,
        script_path,
        parallelism: 1,
        workspace: scratch.to_path_buf(),
        output_dir: scratch.to_path_buf(),
    };
    let mut command = engine.command(&invocation);
    command
        .args(&config.engine.check_args)
        .current_dir(scratch)
        .process_group(0)
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(error = %e, "Failed to start engine for script check");
            return Ok(ScriptCheck::rejected("Validation error", e.to_string()));
        }
    };
    let Some(pgid) = child.id().map(|pid| pid as i32) else {
        return Ok(ScriptCheck::rejected(
            "Validation error",
            "engine exited before its process id was known",
        ));
    };
    let mut guard = ProcessGroupGuard::new(pgid);
    debug!(pgid, "Script check started");

    let output = match tokio::time::timeout(config.validation_timeout, child.wait_with_output()).await {
        Ok(output) => output,
        Err(_) => {
            info!(pgid, timeout = ?config.validation_timeout, "Script check timed out");
            terminate_group(pgid, config.termination_grace).await;
            guard.disarm();
            return Ok(ScriptCheck::rejected(
                "Validation timeout",
                format!("engine did not finish within {:?}", config.validation_timeout),
            ));
        }
    };
    // Engine helpers may outlive the leader
    terminate_group(pgid, config.termination_grace).await;
    guard.disarm();

    let output = match output {
        Ok(output) => output,
        Err(e) => return Ok(ScriptCheck::rejected("Validation error", e.to_string())),
    };
    if output.status.success() {
        return Ok(ScriptCheck::accepted());
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let diagnostics = if stderr.trim().is_empty() { stdout } else { stderr };
    let error = tail(&diagnostics, config.error_tail_lines);
    let error = if error.is_empty() {
        format!("engine exited with {}", output.status)
    } else {
        error
    };
    Ok(ScriptCheck::rejected("Script validation failed", error))
}

/// Last `lines` non-empty lines of `text`
fn tail(text: &str, lines: usize) -> String {
    let kept: Vec<&str> = text.lines().map(str::trim_end).filter(|l| !l.is_empty()).collect();
    kept[kept.len().saturating_sub(lines)..].join("\n")
}
