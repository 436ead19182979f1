//! Engine invocation contract
//!
//! Describes how a job becomes a command line for the external engine. The
//! supervisor owns everything around the command (process group, pipes,
//! working directory); an [`EngineInvocation`] only decides program and
//! arguments.

use std::path::PathBuf;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::EngineConfig;

/// Everything an engine needs to know about one run
#[derive(Debug, Clone)]
pub struct Invocation {
    pub job_id: Uuid,
    pub script_path: PathBuf,
    pub parallelism: u32,
    pub workspace: PathBuf,
    pub output_dir: PathBuf,
}

/// Builds the command that runs the engine for one invocation
pub trait EngineInvocation: Send + Sync {
    fn command(&self, invocation: &Invocation) -> Command;
}

/// Engine described by an executable and an argument template
///
/// Placeholders `{script}`, `{np}`, `{output}`, `{workspace}` and `{job_id}`
/// are substituted in both the arguments and the parallel launcher. The
/// launcher is only used when more than one slot was requested.
#[derive(Debug, Clone)]
pub struct CommandLineEngine {
    config: EngineConfig,
}

impl CommandLineEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Program and arguments for an invocation, launcher included
    pub fn argv(&self, invocation: &Invocation) -> Vec<String> {
        let substitute = |template: &String| {
            template
                .replace("{script}", &invocation.script_path.to_string_lossy())
                .replace("{np}", &invocation.parallelism.to_string())
                .replace("{output}", &invocation.output_dir.to_string_lossy())
                .replace("{workspace}", &invocation.workspace.to_string_lossy())
                .replace("{job_id}", &invocation.job_id.to_string())
        };

        let mut argv = Vec::new();
        if invocation.parallelism > 1 {
            argv.extend(self.config.parallel_launcher.iter().map(substitute));
        }
        argv.push(self.config.executable.clone());
        argv.extend(self.config.args.iter().map(substitute));
        argv
    }
}

impl EngineInvocation for CommandLineEngine {
    fn command(&self, invocation: &Invocation) -> Command {
        let argv = self.argv(invocation);
        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);
        command
    }
}
