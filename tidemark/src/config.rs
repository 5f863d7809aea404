//! Daemon configuration.
//!
//! The batch size, poll interval and gap timeout are policy tunables: batch
//! size trades transaction size against throughput, and the gap timeout
//! trades correctness (waiting for a slow writer) against liveness (bounding
//! how long a shard can stall). None of them are hard-coded in the agent.

use std::time::Duration;

/// Retry behaviour for transient store failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts before escalating to `Errored`.
    pub max_retries: u32,
    /// Base delay between retry attempts.
    pub base_delay: Duration,
    /// Maximum delay between retry attempts (for exponential backoff).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

/// Configuration for the projection daemon and its shard agents.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Maximum number of events fetched and committed per batch.
    pub batch_size: usize,
    /// How long a live shard waits between polls of the event log.
    pub poll_interval: Duration,
    /// How long a shard holds position at a sequence gap before logging the
    /// skip and advancing past it.
    pub gap_timeout: Duration,
    /// Retry behaviour for transient store failures.
    pub retry: RetryConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            poll_interval: Duration::from_millis(250),
            gap_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Sets the maximum batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the live-mode poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Sets the gap-wait timeout.
    #[must_use]
    pub const fn with_gap_timeout(mut self, gap_timeout: Duration) -> Self {
        self.gap_timeout = gap_timeout;
        self
    }

    /// Sets the retry behaviour for transient store failures.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}
