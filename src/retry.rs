use crate::clock;
use crate::config::{RestartConfig, SupervisorConfig};
use crate::error::SupervisorError;
use crate::monitor;
use crate::outcome::ExitOutcome;
use crate::ratelimit;
use crate::signals::{SignalRelay, RESTART_SIGNALS};
use crate::supervise::{SuperviseOptions, SupervisionLoop};
use nix::unistd::{getppid, Pid};
use rand::rngs::ThreadRng;
use rand::Rng;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exit statuses that count as success and end supervision.
#[derive(Clone, PartialEq, Eq)]
pub struct SuccessCodes([bool; 256]);

impl SuccessCodes {
    pub fn none() -> Self {
        Self([false; 256])
    }

    pub fn from_codes(codes: &[u8]) -> Self {
        let mut set = Self::none();
        for &code in codes {
            set.insert(code);
        }
        set
    }

    pub fn insert(&mut self, code: u8) {
        self.0[usize::from(code)] = true;
    }

    pub fn clear(&mut self) {
        self.0 = [false; 256];
    }

    pub fn contains(&self, code: u8) -> bool {
        self.0[usize::from(code)]
    }

    pub fn codes(&self) -> Vec<u8> {
        (0..=255u8).filter(|&c| self.contains(c)).collect()
    }

    /// Apply one `--exit` argument: `none` clears, a list adds.
    pub fn apply(&mut self, arg: &ExitCodesArg) {
        match arg {
            ExitCodesArg::None => self.clear(),
            ExitCodesArg::Codes(codes) => codes.iter().for_each(|&c| self.insert(c)),
        }
    }
}

impl Default for SuccessCodes {
    fn default() -> Self {
        Self::from_codes(&[0])
    }
}

impl std::fmt::Debug for SuccessCodes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.codes()).finish()
    }
}

/// A parsed `--exit` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCodesArg {
    None,
    Codes(Vec<u8>),
}

impl FromStr for ExitCodesArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "none" {
            return Ok(ExitCodesArg::None);
        }
        let mut codes = Vec::new();
        for word in s.split(',').filter(|w| !w.is_empty()) {
            if !word.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(format!("exit code {word} must start with a digit"));
            }
            let value: u64 = word
                .parse()
                .map_err(|_| format!("unable to parse exit code {word}"))?;
            let code =
                u8::try_from(value).map_err(|_| format!("exit code {word} exceeds 255"))?;
            codes.push(code);
        }
        if codes.is_empty() {
            return Err("no exit codes specified".to_string());
        }
        Ok(ExitCodesArg::Codes(codes))
    }
}

/// Decision returned by the restart policy after each run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartDecision {
    /// Stop restarting and report this outcome.
    Finish(ExitOutcome),
    /// Launch again after `delay`.
    Retry { delay: Duration },
    /// Too many rapid failures within one measurement window.
    CrashLoop { attempts: u32 },
}

/// Measurement window and backoff bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffState {
    /// Clock reading at which the current measurement window opened.
    pub window_start_ms: u64,
    /// Launches within the current window.
    pub attempts: u32,
    /// Current backoff window width.
    pub window_secs: u64,
}

/// Restart decision state machine.
///
/// Runs are classified by the time elapsed since the measurement window
/// opened. Short runs are rate limited and eventually declared a crash loop;
/// long runs retry at once; anything in between backs off with jitter.
pub struct RestartPolicy<R: Rng = ThreadRng> {
    config: RestartConfig,
    success: SuccessCodes,
    state: BackoffState,
    rng: R,
}

impl RestartPolicy<ThreadRng> {
    pub fn new(config: &RestartConfig) -> Self {
        let success = SuccessCodes::from_codes(&config.success_codes);
        Self::with_rng(config, success, rand::rng(), clock::now())
    }
}

impl<R: Rng> RestartPolicy<R> {
    pub fn with_rng(
        config: &RestartConfig,
        success: SuccessCodes,
        rng: R,
        start_ms: u64,
    ) -> Self {
        Self {
            config: config.clone(),
            success,
            state: BackoffState {
                window_start_ms: start_ms,
                attempts: 0,
                window_secs: 0,
            },
            rng,
        }
    }

    pub fn state(&self) -> &BackoffState {
        &self.state
    }

    /// Classify a finished run that ended at `now_ms` and decide what to do next.
    pub fn evaluate(&mut self, outcome: ExitOutcome, now_ms: u64) -> RestartDecision {
        self.state.attempts = self.state.attempts.saturating_add(1);

        if outcome.is_failure() {
            return RestartDecision::Finish(outcome);
        }

        if !self.config.forever {
            match outcome {
                ExitOutcome::Exited(status) if self.success.contains(status) => {
                    return RestartDecision::Finish(outcome)
                }
                ExitOutcome::Signaled(_) => return RestartDecision::Finish(outcome),
                _ => {}
            }
        }

        let elapsed = now_ms.saturating_sub(self.state.window_start_ms);

        if elapsed <= self.config.short_run_ms {
            self.state.window_secs = 0;
            if self.state.attempts >= self.config.crash_loop_limit {
                warn!(
                    attempts = self.state.attempts,
                    elapsed_ms = elapsed,
                    "rapid failure limit reached"
                );
                return RestartDecision::CrashLoop {
                    attempts: self.state.attempts,
                };
            }
            debug!(
                attempts = self.state.attempts,
                elapsed_ms = elapsed,
                "rapid failure, pausing briefly"
            );
            return RestartDecision::Retry {
                delay: Duration::from_millis(self.config.retry_pause_ms),
            };
        }

        let delay = if elapsed > self.config.long_run_ms {
            self.state.window_secs = 0;
            debug!(elapsed_ms = elapsed, "long run ended, restarting immediately");
            Duration::ZERO
        } else {
            self.state.window_secs =
                ratelimit::next_window(self.state.window_secs, self.config.max_backoff_secs);
            let delay = ratelimit::jitter(&mut self.rng, self.state.window_secs);
            debug!(
                elapsed_ms = elapsed,
                window_secs = self.state.window_secs,
                delay_ms = delay.as_millis() as u64,
                "backing off before restart"
            );
            delay
        };

        self.state.window_start_ms = now_ms;
        self.state.attempts = 0;
        RestartDecision::Retry { delay }
    }
}

/// Run `command` under the restart policy until it finishes for good.
pub fn respawn(
    command: &[String],
    config: &SupervisorConfig,
) -> Result<ExitOutcome, SupervisorError> {
    let ancestor: Option<Pid> = config.restart.parented.then(getppid);
    if ancestor == Some(Pid::from_raw(1)) {
        warn!("already parented by pid 1, watching it anyway");
    }

    let mut policy = RestartPolicy::new(&config.restart);
    let mut relay = SignalRelay::new(RESTART_SIGNALS)?;
    let supervise = SuperviseOptions {
        continue_on_stop: config.restart.continue_on_stop,
        escalate_alarm: false,
        orphan_grace: Duration::from_millis(config.monitor.orphan_grace_ms),
    };

    let mut launches: u64 = 0;
    loop {
        launches += 1;
        debug!(launches, attempt = policy.state().attempts + 1, "spawning");

        relay.intercept()?;
        let outcome = {
            let mut monitor = monitor::create(ancestor, RESTART_SIGNALS, &config.monitor)?;
            SupervisionLoop::new(&relay, supervise).run(command, monitor.as_mut())
        };
        relay.release()?;
        let outcome = outcome?;

        match policy.evaluate(outcome, clock::now()) {
            RestartDecision::Finish(outcome) => {
                debug!(%outcome, launches, "supervision finished");
                return Ok(outcome);
            }
            RestartDecision::CrashLoop { attempts } => {
                return Err(SupervisorError::CrashLoop {
                    program: command.first().cloned().unwrap_or_default(),
                    attempts,
                });
            }
            RestartDecision::Retry { delay } => {
                info!(%outcome, delay_ms = delay.as_millis() as u64, "restarting");
                clock::sleep_until(delay);
            }
        }
    }
}
