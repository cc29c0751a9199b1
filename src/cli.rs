//! Pieces shared by the `respawn` and `timebound` binaries.

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::outcome::{self, ExitOutcome, FAILURE_STATUS};
use clap::Args;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Flags every supervisor binary accepts.
#[derive(Args, Debug, Clone)]
pub struct CommonArgs {
    /// Log supervision decisions to stderr
    #[arg(short, long)]
    pub debug: bool,

    /// Optional TOML file overriding the built-in tuning
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

impl CommonArgs {
    pub fn load_config(&self) -> Result<SupervisorConfig, SupervisorError> {
        Ok(SupervisorConfig::load(self.config.as_deref())?)
    }
}

/// Install the stderr subscriber. `RUST_LOG` wins over `--debug`.
pub fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

/// Terminate the process according to a supervision result.
pub fn finish(result: Result<ExitOutcome, SupervisorError>) -> ! {
    match result {
        Ok(outcome) => {
            tracing::debug!(%outcome, code = ?outcome.code(), "supervisor exiting");
            if outcome.is_failure() {
                tracing::warn!(%outcome, "child did not run to completion");
            }
            outcome::exit_with(outcome)
        }
        Err(e) => {
            tracing::error!(error = %e, "supervision failed");
            std::process::exit(FAILURE_STATUS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Harness {
        #[command(flatten)]
        common: CommonArgs,
    }

    #[test]
    fn test_common_flags_parse() {
        let cli = Harness::try_parse_from(["prog", "-d", "--config", "/tmp/x.toml"]).unwrap();
        assert!(cli.common.debug);
        assert_eq!(cli.common.config, Some(PathBuf::from("/tmp/x.toml")));
    }

    #[test]
    fn test_defaults_without_config() {
        let cli = Harness::try_parse_from(["prog"]).unwrap();
        assert!(!cli.common.debug);
        assert_eq!(cli.common.load_config().unwrap(), SupervisorConfig::default());
    }
}
