//! Consumer loop configuration
//!
//! This module provides `ConsumerConfig` for configuring a `JobWorker`.

use std::time::Duration;

/// Pause between polls when nothing was received
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// What happens to a message that can never succeed (unroutable or poison)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeadLetterPolicy {
    /// Leave it on the queue for transport-level redelivery or expiry
    #[default]
    Leave,
    /// Delete it from the queue
    Delete,
}

/// Configuration for the consumer loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Visibility timeout for received messages (None = the queue's own)
    pub visibility_timeout: Option<Duration>,

    /// Stop after this long without a matched message
    pub idle_timeout: Option<Duration>,

    /// Stop after this many receive cycles
    pub max_executions: Option<u64>,

    /// Pause between polls; zero disables pausing
    pub poll_interval: Duration,

    /// Pause after every message, not only after empty polls
    pub always_sleep: bool,

    /// Return the first processing error instead of logging it
    pub raise_on_error: bool,

    /// Intercept HUP/INT/TERM while the loop runs
    pub trap_signals: bool,

    /// Treatment of unroutable and poison messages
    pub dead_letter_policy: DeadLetterPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: None,
            idle_timeout: None,
            max_executions: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            always_sleep: false,
            raise_on_error: false,
            trap_signals: true,
            dead_letter_policy: DeadLetterPolicy::Leave,
        }
    }
}

impl ConsumerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the queue's visibility timeout
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// Set the idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Set the number of receive cycles after which the loop stops
    pub fn with_max_executions(mut self, count: u64) -> Self {
        self.max_executions = Some(count);
        self
    }

    /// Set the poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_always_sleep(mut self, always_sleep: bool) -> Self {
        self.always_sleep = always_sleep;
        self
    }

    pub fn with_raise_on_error(mut self, raise: bool) -> Self {
        self.raise_on_error = raise;
        self
    }

    /// Enable or disable OS signal interception
    pub fn with_signal_trap(mut self, enable: bool) -> Self {
        self.trap_signals = enable;
        self
    }

    pub fn with_dead_letter_policy(mut self, policy: DeadLetterPolicy) -> Self {
        self.dead_letter_policy = policy;
        self
    }
}
