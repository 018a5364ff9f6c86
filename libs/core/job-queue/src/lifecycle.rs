//! Consumer loop lifecycle: signals, idle timeout, iteration budget
//!
//! While a loop runs, HUP/INT/TERM only raise a flag. The loop looks at it
//! between iterations, so a message is never abandoned half way. The
//! previous handlers are put back when the [`SignalTrap`] is dropped, which
//! happens on every exit path of the loop.

use crate::config::ConsumerConfig;
use crate::error::JobQueueResult;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

pub use signal_trap::SignalTrap;

/// Why a consumer loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The configured number of receive cycles ran
    MaxExecutions,
    /// Nothing was matched for the configured idle timeout
    IdleTimeout,
    /// A signal or the shutdown channel asked the loop to stop
    ShutdownRequested,
}

#[cfg(unix)]
mod signal_trap {
    use crate::error::{JobQueueError, JobQueueResult};
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{debug, warn};

    const TRAPPED: [Signal; 3] = [Signal::SIGHUP, Signal::SIGINT, Signal::SIGTERM];

    static SIGNALS_RECEIVED: AtomicU64 = AtomicU64::new(0);

    extern "C" fn record_signal(_: nix::libc::c_int) {
        SIGNALS_RECEIVED.fetch_add(1, Ordering::SeqCst);
    }

    /// Scoped interception of HUP, INT and TERM
    pub struct SignalTrap {
        previous: Vec<(Signal, SigAction)>,
        baseline: u64,
    }

    impl SignalTrap {
        /// Replace the handlers, remembering the previous ones
        pub fn install() -> JobQueueResult<Self> {
            let action = SigAction::new(
                SigHandler::Handler(record_signal),
                SaFlags::SA_RESTART,
                SigSet::empty(),
            );
            let mut trap = SignalTrap {
                previous: Vec::with_capacity(TRAPPED.len()),
                baseline: SIGNALS_RECEIVED.load(Ordering::SeqCst),
            };

            for signal in TRAPPED {
                // SAFETY: the handler only touches an atomic
                let previous = unsafe { sigaction(signal, &action) }.map_err(|e| {
                    JobQueueError::Config(format!("failed to trap {signal}: {e}"))
                })?;
                trap.previous.push((signal, previous));
            }
            debug!("Trapping terminate signals to exit the loop");
            Ok(trap)
        }

        /// Whether a trapped signal arrived since installation
        pub fn triggered(&self) -> bool {
            SIGNALS_RECEIVED.load(Ordering::SeqCst) > self.baseline
        }
    }

    impl Drop for SignalTrap {
        fn drop(&mut self) {
            for (signal, previous) in self.previous.drain(..).rev() {
                // SAFETY: reinstalls the exact action that was in place before
                if let Err(e) = unsafe { sigaction(signal, &previous) } {
                    warn!(signal = %signal, error = %e, "Failed to restore signal handler");
                }
            }
            debug!("Restored previous signal handlers");
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use nix::sys::signal::raise;

        fn swap(signal: Signal, handler: SigHandler) -> SigAction {
            let action = SigAction::new(handler, SaFlags::empty(), SigSet::empty());
            unsafe { sigaction(signal, &action) }.unwrap()
        }

        #[test]
        fn test_trap_flags_signal_and_restores_previous_handler() {
            let original = swap(Signal::SIGHUP, SigHandler::SigIgn);

            {
                let trap = SignalTrap::install().unwrap();
                assert!(!trap.triggered());

                raise(Signal::SIGHUP).unwrap();
                assert!(trap.triggered());
            }

            let restored = swap(Signal::SIGHUP, original.handler());
            assert!(matches!(restored.handler(), SigHandler::SigIgn));
        }
    }
}

#[cfg(not(unix))]
mod signal_trap {
    use crate::error::JobQueueResult;

    /// Signal interception is only available on unix
    pub struct SignalTrap;

    impl SignalTrap {
        pub fn install() -> JobQueueResult<Self> {
            Ok(SignalTrap)
        }

        pub fn triggered(&self) -> bool {
            false
        }
    }
}

/// Decides when a consumer loop stops
pub struct LifecycleController {
    trap: Option<SignalTrap>,
    shutdown: Option<watch::Receiver<bool>>,
    remaining: Option<u64>,
    idle_timeout: Option<Duration>,
    last_matched_at: Instant,
}

impl LifecycleController {
    /// Begin a loop: install the signal trap if configured and start the idle clock
    pub fn start(
        config: &ConsumerConfig,
        shutdown: Option<watch::Receiver<bool>>,
    ) -> JobQueueResult<Self> {
        let trap = if config.trap_signals {
            Some(SignalTrap::install()?)
        } else {
            None
        };

        Ok(Self {
            trap,
            shutdown,
            remaining: config.max_executions,
            idle_timeout: config.idle_timeout,
            last_matched_at: Instant::now(),
        })
    }

    /// Whether the iteration budget is used up
    pub fn executions_exhausted(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Restart the idle clock
    pub fn mark_matched(&mut self) {
        self.last_matched_at = Instant::now();
    }

    pub fn idle_expired(&self) -> bool {
        self.idle_timeout
            .is_some_and(|timeout| self.last_matched_at.elapsed() > timeout)
    }

    pub fn shutdown_requested(&self) -> bool {
        let trapped = self.trap.as_ref().is_some_and(SignalTrap::triggered);
        let requested = self.shutdown.as_ref().is_some_and(|rx| *rx.borrow());
        trapped || requested
    }

    /// Sleep between polls; a change on the shutdown channel cuts it short
    pub async fn pause(&mut self, interval: Duration) {
        let sleep = tokio::time::sleep(interval);
        tokio::pin!(sleep);

        match self.shutdown.as_mut() {
            Some(rx) => {
                tokio::select! {
                    changed = rx.changed() => {
                        // sender gone: nothing can interrupt the pause any more
                        if changed.is_err() {
                            (&mut sleep).await;
                        }
                    }
                    _ = &mut sleep => {}
                }
            }
            None => sleep.await,
        }
    }

    /// Account for one finished iteration and tell whether to stop
    pub fn finish_iteration(&mut self) -> Option<StopReason> {
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(1);
        }

        if self.shutdown_requested() {
            info!("Caught signal to shutdown; finished current message, quitting");
            return Some(StopReason::ShutdownRequested);
        }
        if self.executions_exhausted() {
            return Some(StopReason::MaxExecutions);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn untrapped() -> ConsumerConfig {
        ConsumerConfig::new().with_signal_trap(false)
    }

    #[test]
    fn test_iteration_budget() {
        let mut lifecycle = LifecycleController::start(&untrapped().with_max_executions(2), None).unwrap();

        assert!(!lifecycle.executions_exhausted());
        assert_eq!(lifecycle.finish_iteration(), None);
        assert_eq!(lifecycle.finish_iteration(), Some(StopReason::MaxExecutions));
        assert!(lifecycle.executions_exhausted());
    }

    #[test]
    fn test_zero_budget_is_exhausted_immediately() {
        let lifecycle = LifecycleController::start(&untrapped().with_max_executions(0), None).unwrap();
        assert!(lifecycle.executions_exhausted());
    }

    #[test]
    fn test_unbounded_without_max_executions() {
        let mut lifecycle = LifecycleController::start(&untrapped(), None).unwrap();
        for _ in 0..100 {
            assert_eq!(lifecycle.finish_iteration(), None);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout_restarts_on_match() {
        let mut lifecycle = LifecycleController::start(
            &untrapped().with_idle_timeout(Duration::from_secs(5)),
            None,
        )
        .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!lifecycle.idle_expired());

        lifecycle.mark_matched();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!lifecycle.idle_expired());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(lifecycle.idle_expired());
    }

    #[test]
    fn test_shutdown_channel() {
        let (tx, rx) = watch::channel(false);
        let mut lifecycle = LifecycleController::start(&untrapped(), Some(rx)).unwrap();
        assert!(!lifecycle.shutdown_requested());

        tx.send(true).unwrap();
        assert!(lifecycle.shutdown_requested());
        assert_eq!(lifecycle.finish_iteration(), Some(StopReason::ShutdownRequested));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_is_cut_short_by_shutdown() {
        let (tx, rx) = watch::channel(false);
        let mut lifecycle = LifecycleController::start(&untrapped(), Some(rx)).unwrap();

        let started = Instant::now();
        let pause = lifecycle.pause(Duration::from_secs(60));
        let notify = async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            tx.send(true).unwrap();
        };
        tokio::join!(pause, notify);

        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_with_dropped_sender_sleeps_fully() {
        let (tx, rx) = watch::channel(false);
        drop(tx);
        let mut lifecycle = LifecycleController::start(&untrapped(), Some(rx)).unwrap();

        let started = Instant::now();
        lifecycle.pause(Duration::from_secs(3)).await;
        assert!(started.elapsed() >= Duration::from_secs(3));
    }
}
