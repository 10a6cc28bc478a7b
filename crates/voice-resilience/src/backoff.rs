//! Exponential backoff with jitter
//!
//! Retry delays grow as `min(max_delay, initial_delay * multiplier^(n-1))`
//! and are spread by a random jitter so many sessions recovering at once do
//! not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;

/// Backoff strategy configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Multiplier for each retry (typically 2.0)
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0); 0.0 disables jitter
    pub jitter: f64,
    /// Maximum number of attempts
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Create a new backoff config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set initial delay
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set multiplier
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Set maximum attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Un-jittered delay for the 1-indexed attempt `n`.
    ///
    /// Attempt 0 is treated as attempt 1.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }
}

/// One completed backoff wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStep {
    /// 1-indexed attempt number
    pub attempt: u32,
    /// Delay that was (or will be) waited
    pub delay: Duration,
}

/// Returned when a wait is requested after the attempt budget is spent
#[derive(Debug, Clone, Error)]
#[error("retry exhausted after {attempts} attempts ({reason})")]
pub struct RetryExhausted {
    /// Attempts made
    pub attempts: u32,
    /// Reason passed to the rejected wait
    pub reason: String,
}

/// Exponential backoff engine
#[derive(Debug)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new backoff instance
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Create with default config
    pub fn default_config() -> Self {
        Self::new(BackoffConfig::default())
    }

    /// Attempts consumed so far
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Borrow the config
    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// False once the attempt counter reaches `max_attempts`
    pub fn can_retry(&self) -> bool {
        self.attempt < self.config.max_attempts
    }

    /// Get remaining attempts
    pub fn remaining_attempts(&self) -> u32 {
        self.config.max_attempts.saturating_sub(self.attempt)
    }

    /// Reset the backoff state
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    fn delay_with_jitter(&self, base_delay: Duration) -> Duration {
        let jitter_range = base_delay.as_secs_f64() * self.config.jitter;
        if jitter_range <= 0.0 {
            return base_delay;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..jitter_range);
        let jittered = base_delay.as_secs_f64() + jitter;

        Duration::from_secs_f64(jittered.max(0.0)).min(self.config.max_delay)
    }

    /// Jittered delay the next wait would use, without advancing
    pub fn peek_delay(&self) -> Option<Duration> {
        if !self.can_retry() {
            return None;
        }
        Some(self.delay_with_jitter(self.config.base_delay(self.attempt + 1)))
    }

    /// Advance the attempt counter without sleeping
    pub fn next_step(&mut self, reason: &str) -> Result<BackoffStep, RetryExhausted> {
        if !self.can_retry() {
            return Err(RetryExhausted {
                attempts: self.attempt,
                reason: reason.to_string(),
            });
        }

        self.attempt += 1;
        let delay = self.delay_with_jitter(self.config.base_delay(self.attempt));
        Ok(BackoffStep {
            attempt: self.attempt,
            delay,
        })
    }

    /// Suspend for the next delay.
    ///
    /// Fails with [`RetryExhausted`] instead of waiting once the budget is spent.
    pub async fn wait(&mut self, reason: &str) -> Result<BackoffStep, RetryExhausted> {
        let step = self.next_step(reason)?;
        tracing::debug!(
            attempt = step.attempt,
            remaining = self.remaining_attempts(),
            delay = ?step.delay,
            reason,
            "Waiting before retry"
        );
        tokio::time::sleep(step.delay).await;
        Ok(step)
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_step("iterate").ok().map(|step| step.delay)
    }
}
