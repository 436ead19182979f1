//! Orchestrator configuration
//!
//! Defines all tunable parameters of the engine: capacity, pool size, time
//! limits, filesystem layout, the engine invocation contract, artifact
//! discovery and the worker-fault retry policy.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::collector::{ArtifactOrder, ArtifactScan};
use crate::scheduler::RetryPolicy;

/// Orchestrator configuration
///
/// All limits are configurable so that tests can run tiny capacities with
/// millisecond timeouts while production uses host-derived values.
#[derive(Debug, Clone)]
pub struct Config {
    /// Execution slots available on this host (hard ceiling for the ledger)
    pub total_capacity: u32,

    /// Number of concurrent execution units in the worker pool
    pub worker_count: usize,

    /// Wall-clock limit for a single engine run, counted from dispatch
    pub max_simulation_time: Duration,

    /// Time between the cooperative and the forceful termination signal
    pub termination_grace: Duration,

    /// Root directory for per-job workspaces
    pub data_dir: PathBuf,

    /// Job store location; defaults to a SQLite file under `data_dir`
    pub database_url: Option<String>,

    /// Directory auxiliary input files are copied from
    pub resource_dir: Option<PathBuf>,

    /// Largest accepted script, in bytes
    pub max_script_size: usize,

    /// Wall-clock limit for a script check run
    pub validation_timeout: Duration,

    /// Number of trailing stderr lines kept as the failure message
    pub error_tail_lines: usize,

    /// How often a log follower re-checks a log that has no new lines
    pub log_poll_interval: Duration,

    /// Queue age that earns a waiting job one extra priority point
    pub aging_interval: Duration,

    pub engine: EngineConfig,

    pub artifacts: ArtifactScan,

    pub retry: RetryPolicy,
}

/// Declarative invocation contract of the external engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine executable (e.g. "lmp")
    pub executable: String,

    /// Arguments; `{script}`, `{np}`, `{output}`, `{workspace}` and `{job_id}`
    /// are substituted per job
    pub args: Vec<String>,

    /// Prefix used when a job requests more than one slot, e.g. `mpirun -np {np}`.
    /// Empty means the engine handles parallelism itself.
    pub parallel_launcher: Vec<String>,

    /// File name of the script inside the workspace input directory
    pub script_file_name: String,

    /// Extra arguments appended when the engine only checks a script
    pub check_args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            executable: "lmp".to_string(),
            args: vec!["-in".to_string(), "{script}".to_string()],
            parallel_launcher: vec!["mpirun".to_string(), "-np".to_string(), "{np}".to_string()],
            script_file_name: "script.in".to_string(),
            check_args: ["-screen", "none", "-log", "none"].map(String::from).to_vec(),
        }
    }
}

impl Config {
    /// Creates a configuration with defaults rooted at `data_dir`
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let total_capacity = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);

        Self {
            total_capacity,
            worker_count: total_capacity as usize,
            max_simulation_time: Duration::from_secs(3600),
            termination_grace: Duration::from_secs(5),
            data_dir: data_dir.into(),
            database_url: None,
            resource_dir: None,
            max_script_size: 1024 * 1024,
            validation_timeout: Duration::from_secs(30),
            error_tail_lines: 20,
            log_poll_interval: Duration::from_millis(200),
            aging_interval: Duration::from_secs(300),
            engine: EngineConfig::default(),
            artifacts: ArtifactScan::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Creates configuration from environment variables
    ///
    /// Every variable is optional; unset variables keep their default.
    /// - SIMRUN_DATA_DIR (default: ./simrun-data)
    /// - SIMRUN_DATABASE_URL (default: sqlite file under the data dir)
    /// - SIMRUN_TOTAL_CAPACITY (default: available CPU cores)
    /// - SIMRUN_WORKER_COUNT (default: same as capacity)
    /// - SIMRUN_MAX_SIMULATION_TIME (seconds, default: 3600)
    /// - SIMRUN_TERMINATION_GRACE (seconds, default: 5)
    /// - SIMRUN_RESOURCE_DIR
    /// - SIMRUN_MAX_SCRIPT_SIZE (bytes, default: 1 MiB)
    /// - SIMRUN_VALIDATION_TIMEOUT (seconds, default: 30)
    /// - SIMRUN_ENGINE_EXECUTABLE, SIMRUN_ENGINE_ARGS, SIMRUN_ENGINE_LAUNCHER,
    ///   SIMRUN_ENGINE_CHECK_ARGS
    ///   (argument lists are whitespace separated; an empty launcher disables it)
    /// - SIMRUN_ARTIFACT_DIR, SIMRUN_ARTIFACT_PATTERNS (comma separated)
    /// - SIMRUN_MAX_RETRIES, SIMRUN_RETRY_BACKOFF (seconds)
    pub fn from_env() -> anyhow::Result<Self> {
        let data_dir = std::env::var("SIMRUN_DATA_DIR").unwrap_or_else(|_| "simrun-data".to_string());
        let mut config = Self::new(data_dir);

        if let Ok(url) = std::env::var("SIMRUN_DATABASE_URL") {
            config.database_url = Some(url);
        }
        if let Some(capacity) = env_parse::<u32>("SIMRUN_TOTAL_CAPACITY")? {
            config.total_capacity = capacity;
            config.worker_count = capacity as usize;
        }
        if let Some(workers) = env_parse::<usize>("SIMRUN_WORKER_COUNT")? {
            config.worker_count = workers;
        }
        if let Some(secs) = env_parse::<u64>("SIMRUN_MAX_SIMULATION_TIME")? {
            config.max_simulation_time = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SIMRUN_TERMINATION_GRACE")? {
            config.termination_grace = Duration::from_secs(secs);
        }
        if let Ok(dir) = std::env::var("SIMRUN_RESOURCE_DIR") {
            config.resource_dir = Some(PathBuf::from(dir));
        }
        if let Some(size) = env_parse::<usize>("SIMRUN_MAX_SCRIPT_SIZE")? {
            config.max_script_size = size;
        }
        if let Some(secs) = env_parse::<u64>("SIMRUN_VALIDATION_TIMEOUT")? {
            config.validation_timeout = Duration::from_secs(secs);
        }

        if let Ok(executable) = std::env::var("SIMRUN_ENGINE_EXECUTABLE") {
            config.engine.executable = executable;
        }
        if let Ok(args) = std::env::var("SIMRUN_ENGINE_ARGS") {
            config.engine.args = split_words(&args);
        }
        if let Ok(launcher) = std::env::var("SIMRUN_ENGINE_LAUNCHER") {
            config.engine.parallel_launcher = split_words(&launcher);
        }
        if let Ok(args) = std::env::var("SIMRUN_ENGINE_CHECK_ARGS") {
            config.engine.check_args = split_words(&args);
        }

        if let Ok(dir) = std::env::var("SIMRUN_ARTIFACT_DIR") {
            config.artifacts.directory = PathBuf::from(dir);
        }
        if let Ok(patterns) = std::env::var("SIMRUN_ARTIFACT_PATTERNS") {
            config.artifacts.patterns = patterns
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(order) = std::env::var("SIMRUN_ARTIFACT_ORDER") {
            config.artifacts.order = match order.as_str() {
                "path" => ArtifactOrder::Path,
                "modified" => ArtifactOrder::ModifiedDesc,
                other => anyhow::bail!("SIMRUN_ARTIFACT_ORDER must be 'path' or 'modified', got '{}'", other),
            };
        }

        if let Some(retries) = env_parse::<u32>("SIMRUN_MAX_RETRIES")? {
            config.retry.max_retries = retries;
        }
        if let Some(secs) = env_parse::<u64>("SIMRUN_RETRY_BACKOFF")? {
            config.retry.initial_backoff = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Job store URL, resolving the default location under the data dir
    pub fn database_url(&self) -> String {
        match &self.database_url {
            Some(url) => url.clone(),
            None => format!(
                "sqlite://{}?mode=rwc",
                self.data_dir.join("simrun.db").display()
            ),
        }
    }

    /// Workspace directory of a job
    pub fn workspace_for(&self, job_id: uuid::Uuid) -> PathBuf {
        self.data_dir.join(job_id.to_string())
    }

    pub fn with_capacity(mut self, total_capacity: u32) -> Self {
        self.total_capacity = total_capacity;
        self
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_engine(mut self, executable: impl Into<String>, args: &[&str]) -> Self {
        self.engine.executable = executable.into();
        self.engine.args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn with_resource_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.resource_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.total_capacity == 0 {
            anyhow::bail!("total_capacity must be greater than 0");
        }

        if self.worker_count == 0 {
            anyhow::bail!("worker_count must be greater than 0");
        }

        if self.max_simulation_time.is_zero() {
            anyhow::bail!("max_simulation_time must be greater than 0");
        }

        if self.engine.executable.trim().is_empty() {
            anyhow::bail!("engine executable cannot be empty");
        }

        if self.engine.script_file_name.contains(['/', '\\']) {
            anyhow::bail!("script_file_name must be a plain file name");
        }

        if self.max_script_size == 0 {
            anyhow::bail!("max_script_size must be greater than 0");
        }

        if self.validation_timeout.is_zero() {
            anyhow::bail!("validation_timeout must be greater than 0");
        }

        if self.error_tail_lines == 0 {
            anyhow::bail!("error_tail_lines must be greater than 0");
        }

        if self.log_poll_interval.is_zero() {
            anyhow::bail!("log_poll_interval must be greater than 0");
        }

        if self.artifacts.directory.is_absolute() {
            anyhow::bail!("artifact directory must be relative to the job workspace");
        }

        self.retry.validate()?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new("simrun-data")
    }
}

fn env_parse<T>(key: &str) -> anyhow::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("invalid value for {}: '{}'", key, raw)),
        Err(_) => Ok(None),
    }
}

fn split_words(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(String::from).collect()
}
