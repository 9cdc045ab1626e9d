//! Configuration for the sync engine.

use std::time::Duration;

use rand::Rng;

/// Configuration for a [`crate::DataSynchronizer`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity that scopes the bookkeeping database, usually the app id
    /// plus the active user id.
    pub instance_key: String,
    /// Pause after a pass that completed.
    pub short_sleep: Duration,
    /// Pause after a pass that did not run or failed.
    pub long_sleep: Duration,
    /// Backoff applied on top of `long_sleep` after consecutive failures.
    pub retry: RetryConfig,
    /// Timeout handed to every remote call.
    pub remote_timeout: Duration,
    /// Whether `start()` spawns the background worker.
    pub worker_enabled: bool,
}

impl SyncConfig {
    /// Creates a configuration for the given instance key.
    pub fn new(instance_key: impl Into<String>) -> Self {
        Self {
            instance_key: instance_key.into(),
            short_sleep: Duration::from_secs(1),
            long_sleep: Duration::from_secs(5),
            retry: RetryConfig::default(),
            remote_timeout: Duration::from_secs(30),
            worker_enabled: true,
        }
    }

    /// Sets the instance key.
    pub fn with_instance_key(mut self, instance_key: impl Into<String>) -> Self {
        self.instance_key = instance_key.into();
        self
    }

    /// Sets the pause after a successful pass.
    pub fn with_short_sleep(mut self, sleep: Duration) -> Self {
        self.short_sleep = sleep;
        self
    }

    /// Sets the pause after a failed pass.
    pub fn with_long_sleep(mut self, sleep: Duration) -> Self {
        self.long_sleep = sleep;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the remote call timeout.
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    /// Enables or disables the background worker.
    pub fn with_worker_enabled(mut self, enabled: bool) -> Self {
        self.worker_enabled = enabled;
        self
    }

    /// How long the worker waits after a pass.
    ///
    /// `consecutive_failures` is zero after a pass that completed.
    pub fn sleep_after(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            self.short_sleep
        } else {
            self.long_sleep + self.retry.delay_for_attempt(consecutive_failures.saturating_sub(1))
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Exponential backoff for engine-level failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first repeated failure.
    pub initial_delay: Duration,
    /// Upper bound on the backoff.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a configuration with the given initial delay.
    pub fn new(initial_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never adds backoff.
    pub fn no_backoff() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}
