//! Configuration module
//!
//! Options shared by every subcommand, layered over the `SIMRUN_*`
//! environment read by [`Config::from_env`].

use anyhow::Result;
use clap::Args;
use simrun_orchestrator::Config;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct GlobalArgs {
    /// Root directory for job workspaces and the default database
    #[arg(long, global = true, env = "SIMRUN_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Job store URL (defaults to a SQLite file under the data dir)
    #[arg(long, global = true, env = "SIMRUN_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Execution slots available on this host
    #[arg(long, global = true)]
    pub capacity: Option<u32>,

    /// Number of concurrent engine runs
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Engine executable
    #[arg(long, global = true)]
    pub engine: Option<String>,
}

impl GlobalArgs {
    pub fn into_config(self) -> Result<Config> {
        let mut config = Config::from_env()?;

        if let Some(dir) = self.data_dir {
            config.data_dir = dir;
        }
        if let Some(url) = self.database_url {
            config.database_url = Some(url);
        }
        if let Some(capacity) = self.capacity {
            config.total_capacity = capacity;
            // Pool size follows capacity unless set explicitly
            if self.workers.is_none() {
                config.worker_count = capacity as usize;
            }
        }
        if let Some(workers) = self.workers {
            config.worker_count = workers;
        }
        if let Some(engine) = self.engine {
            config.engine.executable = engine;
        }

        config.validate()?;
        Ok(config)
    }
}
