use crate::error::ConfigError;
use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, optionally loaded from a TOML file.
///
/// Every field has a default, so an empty file (or no file) yields the
/// built-in supervision policy. Command-line flags override these values.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct SupervisorConfig {
    pub restart: RestartConfig,
    pub timebound: TimeBoundConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RestartConfig {
    /// Runs ending within this many ms of the window start count as rapid failures.
    pub short_run_ms: u64,
    /// Runs lasting longer than this reset the backoff window.
    pub long_run_ms: u64,
    /// Rapid failures tolerated in one window before giving up.
    pub crash_loop_limit: u32,
    /// Upper bound on the backoff window.
    pub max_backoff_secs: u64,
    /// Pause between rapid retries.
    pub retry_pause_ms: u64,
    /// Exit statuses that end supervision.
    pub success_codes: Vec<u8>,
    /// Restart regardless of how the child terminated.
    pub forever: bool,
    /// Continue a stopped child instead of stopping the supervisor.
    pub continue_on_stop: bool,
    /// Abandon the child once the original parent has exited.
    pub parented: bool,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeBoundConfig {
    /// Seconds between escalating alarms after the maximum runtime expires.
    pub escalation_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    /// How often the portable monitor checks that the ancestor is alive.
    pub ancestor_poll_ms: u64,
    /// Delay between terminating and killing an orphaned process group.
    pub orphan_grace_ms: u64,
}

impl SupervisorConfig {
    /// Load from `path`, or return defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let restart = &self.restart;
        if restart.crash_loop_limit == 0 {
            return Err(ConfigError::Invalid(
                "restart.crash_loop_limit must be at least 1".to_string(),
            ));
        }
        if restart.long_run_ms < restart.short_run_ms {
            return Err(ConfigError::Invalid(format!(
                "restart.long_run_ms ({}) is smaller than restart.short_run_ms ({})",
                restart.long_run_ms, restart.short_run_ms
            )));
        }
        if self.timebound.escalation_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "timebound.escalation_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

// --- Default implementations ---

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            short_run_ms: 1000,
            long_run_ms: 60_000,
            crash_loop_limit: 10,
            max_backoff_secs: 60,
            retry_pause_ms: 1,
            success_codes: vec![0],
            forever: false,
            continue_on_stop: false,
            parented: false,
        }
    }
}

impl Default for TimeBoundConfig {
    fn default() -> Self {
        Self {
            escalation_interval_secs: 5,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            ancestor_poll_ms: 1000,
            orphan_grace_ms: 1000,
        }
    }
}
