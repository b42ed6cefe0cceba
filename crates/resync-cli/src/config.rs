use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "resync")]
#[command(
    author,
    version,
    about = "Replicates MLS listing data from RESO Web API sources into local databases"
)]
#[command(after_help = "Examples:
  resync daemon
  resync sync --source ure
  resync purge --source ure
  resync stats
  resync check --config ./sources.toml")]
pub struct Config {
    /// Path to the sources.toml configuration file
    #[arg(long, global = true, env = "RESYNC_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Root directory of the batch store
    #[arg(long, global = true, env = "RESYNC_DATA_DIR", value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Maximum database connections per PostgreSQL destination
    #[arg(long, global = true, env = "RESYNC_DB_MAX_CONNECTIONS", default_value = "5")]
    pub db_max_connections: u32,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run every enabled operation on its cron schedule until interrupted
    Daemon,
    /// Fetch changed records and load them into every destination
    #[command(after_help = "Examples:
  resync sync                 # Sync all sources from config
  resync sync --source ure    # Sync a single source by name")]
    Sync {
        /// Restrict the run to one source
        #[arg(short, long, value_name = "NAME")]
        source: Option<String>,
    },
    /// Delete destination records that no longer exist upstream
    Purge {
        /// Restrict the run to one source
        #[arg(short, long, value_name = "NAME")]
        source: Option<String>,
    },
    /// Compare upstream against destinations and queue drifted keys
    #[command(after_help = "Flagged keys are fetched by the next sync within the same process,
so reconcile is mostly useful under `resync daemon`.")]
    Reconcile {
        /// Restrict the run to one source
        #[arg(short, long, value_name = "NAME")]
        source: Option<String>,
    },
    /// Show record counts and freshness per destination and resource
    Stats {
        /// Restrict the report to one source
        #[arg(short, long, value_name = "NAME")]
        source: Option<String>,
    },
    /// Validate configuration, credentials and metadata for every source
    Check {
        /// Restrict the check to one source
        #[arg(short, long, value_name = "NAME")]
        source: Option<String>,
    },
}
