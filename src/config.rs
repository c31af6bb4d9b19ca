use std::path::PathBuf;

use clap::Parser;

use crate::layout::MAX_LOG_SIZE;

/// Command-line configuration for the undo log engine: one `clap::Parser`
/// struct, with accessors for derived paths rather than letting callers
/// poke at the raw fields.
#[derive(Parser, Debug)]
#[command(author, version, about = "Undo log engine diagnostics and maintenance CLI")]
pub struct Config {
    /// Directory holding one subdirectory of segment files per log.
    #[clap(long = "data-dir", default_value = "undolog")]
    pub data_dir: PathBuf,

    /// Directory holding checkpoint files. Defaults to `<data-dir>/checkpoints`.
    #[clap(long = "checkpoint-dir")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Number of control slots (maximum concurrently live logs).
    #[clap(long = "max-logs", default_value_t = 256)]
    pub max_logs: usize,

    /// Overrides the per-log exhaustion threshold. Intended for tests;
    /// production deployments should leave this unset.
    #[clap(long = "max-log-size")]
    pub max_log_size: Option<u64>,
}

impl Config {
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("checkpoints"))
    }

    pub fn max_log_size(&self) -> u64 {
        self.max_log_size.unwrap_or(MAX_LOG_SIZE)
    }
}
