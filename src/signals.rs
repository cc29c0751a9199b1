/// Signal interception and relay bookkeeping.
///
/// Signals still at their default disposition are redirected to a handler
/// that only records the signal number in a process-wide pending set. The
/// supervision loop samples that set and forwards every recorded signal to
/// the child. Signals the supervisor inherited as ignored or handled are left
/// alone so the child keeps the disposition its ancestors chose.
use crate::error::{fatal, SupervisorError};
use crate::monitor;
use nix::libc::c_int;
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
use std::sync::atomic::{AtomicU64, Ordering};

/// Signals the restart supervisor relays to its child.
pub const RESTART_SIGNALS: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGINT,
    Signal::SIGABRT,
    Signal::SIGTERM,
    Signal::SIGCONT,
];

/// Signals the time-bound supervisor intercepts; the alarm drives escalation.
pub const TIMEBOUND_SIGNALS: &[Signal] = &[
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGINT,
    Signal::SIGABRT,
    Signal::SIGTERM,
    Signal::SIGCONT,
    Signal::SIGALRM,
];

static PENDING: AtomicU64 = AtomicU64::new(0);

/// Guard that blocks delivery of every signal to the calling thread until dropped.
pub struct SignalBlock {
    saved: SigSet,
}

impl SignalBlock {
    pub fn acquire() -> Result<Self, SupervisorError> {
        let mut saved = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut saved))
            .map_err(|e| SupervisorError::environment("unable to set blocking signal mask", e))?;
        Ok(Self { saved })
    }
}

impl Drop for SignalBlock {
    fn drop(&mut self) {
        if let Err(e) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.saved), None) {
            fatal("unable to reset blocking signal mask", e);
        }
    }
}

/// Bitmask of signal numbers. Bit zero is never used.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PendingSignalSet(u64);

impl PendingSignalSet {
    /// Signal numbers at or above this value cannot be represented.
    pub const CAPACITY: i32 = u64::BITS as i32;

    pub fn empty() -> Self {
        Self(0)
    }

    #[cfg(test)]
    pub(crate) fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn contains(&self, signal: Signal) -> bool {
        let n = signal as i32;
        n < Self::CAPACITY && self.0 & (1u64 << n) != 0
    }

    #[cfg(test)]
    pub(crate) fn insert(&mut self, signal: Signal) -> Result<(), SupervisorError> {
        self.0 |= bit(signal)?;
        Ok(())
    }

    /// Members in ascending signal number order.
    pub fn iter(&self) -> impl Iterator<Item = Signal> + '_ {
        (1..Self::CAPACITY)
            .filter(move |n| self.0 & (1u64 << n) != 0)
            .filter_map(|n| Signal::try_from(n).ok())
    }
}

fn bit(signal: Signal) -> Result<u64, SupervisorError> {
    let n = signal as i32;
    if !(1..PendingSignalSet::CAPACITY).contains(&n) {
        return Err(SupervisorError::SignalOutOfRange(n));
    }
    Ok(1u64 << n)
}

/// Atomically read and clear the process-wide pending set.
pub fn sample() -> Result<PendingSignalSet, SupervisorError> {
    let _block = SignalBlock::acquire()?;
    Ok(PendingSignalSet(PENDING.swap(0, Ordering::SeqCst)))
}

/// Record `signal` as pending, exactly as if it had been delivered.
pub fn add(signal: Signal) -> Result<(), SupervisorError> {
    let mask = bit(signal)?;
    let _block = SignalBlock::acquire()?;
    PENDING.fetch_or(mask, Ordering::SeqCst);
    Ok(())
}

extern "C" fn record_signal(signum: c_int) {
    // Runs with every signal blocked (see the sa_mask below).
    if (1..PendingSignalSet::CAPACITY).contains(&signum) {
        PENDING.fetch_or(1u64 << signum, Ordering::SeqCst);
    }
    monitor::wake(signum);
}

#[derive(Debug)]
struct StrategyEntry {
    signal: Signal,
    /// Disposition replaced by `intercept`; `None` when the signal was left alone.
    saved: Option<SigAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelayState {
    Released,
    Intercepting,
}

/// Owns the strategy table and the interception lifecycle
/// `Released -> Intercepting -> Released`.
#[derive(Debug)]
pub struct SignalRelay {
    entries: Vec<StrategyEntry>,
    state: RelayState,
}

impl SignalRelay {
    /// Build a relay for `strategy`. Signals that do not fit the pending set are rejected.
    pub fn new(strategy: &[Signal]) -> Result<Self, SupervisorError> {
        let entries = strategy
            .iter()
            .map(|&signal| {
                bit(signal)?;
                Ok(StrategyEntry {
                    signal,
                    saved: None,
                })
            })
            .collect::<Result<Vec<_>, SupervisorError>>()?;
        Ok(Self {
            entries,
            state: RelayState::Released,
        })
    }

    pub fn is_intercepting(&self) -> bool {
        self.state == RelayState::Intercepting
    }

    /// Signals that are currently redirected to the pending set.
    pub fn intercepted(&self) -> impl Iterator<Item = Signal> + '_ {
        self.entries
            .iter()
            .filter(|e| e.saved.is_some())
            .map(|e| e.signal)
    }

    /// Redirect every strategy signal still at its default disposition.
    ///
    /// Pending bits left over from an earlier interception are discarded first.
    pub fn intercept(&mut self) -> Result<(), SupervisorError> {
        if self.state == RelayState::Intercepting {
            return Ok(());
        }

        sample()?;

        // With delivery blocked, the probe below cannot route a signal to the
        // wrong disposition; anything arriving meanwhile stays kernel-pending.
        let _block = SignalBlock::acquire()?;

        for entry in &mut self.entries {
            let probe = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            // SAFETY: installs SIG_DFL transiently while all signals are blocked.
            let original = unsafe { sigaction(entry.signal, &probe) }.map_err(|e| {
                SupervisorError::environment(format!("unable to query signal {}", entry.signal), e)
            })?;

            if original.handler() != SigHandler::SigDfl {
                // SAFETY: restores exactly the disposition that was just read.
                unsafe { sigaction(entry.signal, &original) }.map_err(|e| {
                    SupervisorError::environment(
                        format!("unable to restore signal {}", entry.signal),
                        e,
                    )
                })?;
                tracing::debug!(signal = %entry.signal, "leaving non-default signal untouched");
                continue;
            }

            let flags = original.flags()
                & !(SaFlags::SA_RESTART | SaFlags::SA_RESETHAND | SaFlags::SA_SIGINFO);
            let catcher = SigAction::new(SigHandler::Handler(record_signal), flags, SigSet::all());

            tracing::debug!(signal = %entry.signal, "installing catcher");
            // SAFETY: record_signal only touches an atomic and writes to a pipe.
            unsafe { sigaction(entry.signal, &catcher) }.map_err(|e| {
                SupervisorError::environment(
                    format!("unable to intercept signal {}", entry.signal),
                    e,
                )
            })?;
            entry.saved = Some(original);
        }

        self.state = RelayState::Intercepting;
        tracing::debug!(signals = ?self.intercepted().collect::<Vec<_>>(), "relay intercepting");
        Ok(())
    }

    /// Read and clear the pending set.
    pub fn sample(&self) -> Result<PendingSignalSet, SupervisorError> {
        sample()
    }

    /// Queue `signal` for relay on the next sample.
    pub fn queue(&self, signal: Signal) -> Result<(), SupervisorError> {
        add(signal)
    }

    /// Restore every disposition replaced by `intercept`.
    pub fn release(&mut self) -> Result<(), SupervisorError> {
        for entry in &mut self.entries {
            let Some(original) = entry.saved.take() else {
                continue;
            };
            // SAFETY: reinstates the disposition captured by intercept.
            unsafe { sigaction(entry.signal, &original) }.map_err(|e| {
                SupervisorError::environment(format!("unable to reset signal {}", entry.signal), e)
            })?;
        }
        self.state = RelayState::Released;
        Ok(())
    }
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        if self.is_intercepting() {
            if let Err(e) = self.release() {
                fatal("failed to release intercepted signals", e);
            }
        }
    }
}

/// Reset `signal` to its default disposition.
pub fn reset_default(signal: Signal) -> Result<(), SupervisorError> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    // SAFETY: SIG_DFL carries no handler code.
    unsafe { sigaction(signal, &action) }
        .map(|_| ())
        .map_err(|e| SupervisorError::environment(format!("unable to reset signal {signal}"), e))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nix::sys::signal::raise;
    use serial_test::serial;

    /// Current handler for `signal`, read by swapping and restoring under a full block.
    pub(crate) fn disposition(signal: Signal) -> SigHandler {
        let _block = SignalBlock::acquire().unwrap();
        let probe = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let original = unsafe { sigaction(signal, &probe) }.unwrap();
        unsafe { sigaction(signal, &original) }.unwrap();
        original.handler()
    }

    fn set_disposition(signal: Signal, handler: SigHandler) {
        let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(signal, &action) }.unwrap();
    }

    #[test]
    fn test_pending_set_iterates_ascending() {
        let mut set = PendingSignalSet::empty();
        set.insert(Signal::SIGTERM).unwrap();
        set.insert(Signal::SIGHUP).unwrap();
        set.insert(Signal::SIGINT).unwrap();
        let order: Vec<Signal> = set.iter().collect();
        assert_eq!(order, vec![Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM]);
        assert!(set.contains(Signal::SIGINT));
        assert!(!set.contains(Signal::SIGQUIT));
    }

    #[test]
    fn test_pending_set_never_uses_bit_zero() {
        let set = PendingSignalSet::from_bits(1);
        assert_eq!(set.iter().count(), 0);
    }

    #[test]
    #[serial]
    fn test_sample_twice_is_empty() {
        sample().unwrap();
        assert!(sample().unwrap().is_empty());
        assert!(sample().unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn test_add_then_sample_clears() {
        sample().unwrap();
        add(Signal::SIGCONT).unwrap();
        let set = sample().unwrap();
        assert!(set.contains(Signal::SIGCONT));
        assert!(sample().unwrap().is_empty());
    }

    #[test]
    #[serial]
    fn test_intercept_release_round_trip() {
        set_disposition(Signal::SIGHUP, SigHandler::SigDfl);
        set_disposition(Signal::SIGQUIT, SigHandler::SigIgn);

        let mut relay = SignalRelay::new(&[Signal::SIGHUP, Signal::SIGQUIT]).unwrap();
        relay.intercept().unwrap();
        assert!(relay.is_intercepting());
        assert!(matches!(
            disposition(Signal::SIGHUP),
            SigHandler::Handler(_)
        ));
        assert_eq!(disposition(Signal::SIGQUIT), SigHandler::SigIgn);
        assert_eq!(relay.intercepted().collect::<Vec<_>>(), vec![Signal::SIGHUP]);

        relay.release().unwrap();
        assert!(!relay.is_intercepting());
        assert_eq!(disposition(Signal::SIGHUP), SigHandler::SigDfl);
        assert_eq!(disposition(Signal::SIGQUIT), SigHandler::SigIgn);

        set_disposition(Signal::SIGQUIT, SigHandler::SigDfl);
    }

    #[test]
    #[serial]
    fn test_intercepted_signal_is_recorded() {
        set_disposition(Signal::SIGHUP, SigHandler::SigDfl);
        let mut relay = SignalRelay::new(&[Signal::SIGHUP]).unwrap();
        relay.intercept().unwrap();

        raise(Signal::SIGHUP).unwrap();
        let set = relay.sample().unwrap();
        assert!(set.contains(Signal::SIGHUP));
        assert!(relay.sample().unwrap().is_empty());

        relay.release().unwrap();
    }

    #[test]
    #[serial]
    fn test_intercept_discards_stale_bits() {
        add(Signal::SIGTERM).unwrap();
        set_disposition(Signal::SIGUSR1, SigHandler::SigDfl);
        let mut relay = SignalRelay::new(&[Signal::SIGUSR1]).unwrap();
        relay.intercept().unwrap();
        assert!(relay.sample().unwrap().is_empty());
        relay.release().unwrap();
    }

    #[test]
    #[serial]
    fn test_drop_releases_interception() {
        set_disposition(Signal::SIGUSR2, SigHandler::SigDfl);
        {
            let mut relay = SignalRelay::new(&[Signal::SIGUSR2]).unwrap();
            relay.intercept().unwrap();
            assert_ne!(disposition(Signal::SIGUSR2), SigHandler::SigDfl);
        }
        assert_eq!(disposition(Signal::SIGUSR2), SigHandler::SigDfl);
    }

    #[test]
    #[serial]
    fn test_queue_is_seen_by_sample() {
        let relay = SignalRelay::new(RESTART_SIGNALS).unwrap();
        relay.sample().unwrap();
        relay.queue(Signal::SIGCONT).unwrap();
        assert_eq!(
            relay.sample().unwrap().iter().collect::<Vec<_>>(),
            vec![Signal::SIGCONT]
        );
    }
}
