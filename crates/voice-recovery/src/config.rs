//! Recovery configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use voice_recovery_error::{RecoveryError, Result};
use voice_recovery_traits::SessionId;
use voice_resilience::{
    scaled_cooldown, BackoffConfig, CircuitBreakerConfig, DEFAULT_COOLDOWN_MULTIPLIER,
};

/// Jitter factor applied when `jitter` is enabled
pub const JITTER_FACTOR: f64 = 0.1;

/// Upper bound accepted for `breakerCooldownMultiplier`
pub const MAX_COOLDOWN_MULTIPLIER: f64 = 1_000.0;

/// Tunables for the recovery subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RecoveryConfig {
    /// Reconnect attempts before falling back
    pub max_retries: u32,
    /// Delay before the first reconnect, in milliseconds
    pub base_delay_ms: u64,
    /// Backoff ceiling, in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub backoff_factor: f64,
    /// Randomize delays by ±10%
    pub jitter: bool,
    /// Period of the checkpoint sweep, in milliseconds
    pub state_checkpoint_interval_ms: u64,
    /// Debounce window for user notifications, in milliseconds
    pub user_notification_delay_ms: u64,
    /// Ping/acknowledgement bound, in milliseconds
    pub stability_check_timeout_ms: u64,
    /// Breaker cooldown as a multiple of the backoff ceiling
    pub breaker_cooldown_multiplier: f64,
    /// Fall back to text mode on exhaustion (otherwise escalate)
    pub fallback_to_text: bool,
    /// Emit escalation records and notifications
    pub escalation_enabled: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
            jitter: true,
            state_checkpoint_interval_ms: 10_000,
            user_notification_delay_ms: 3_000,
            stability_check_timeout_ms: 5_000,
            breaker_cooldown_multiplier: DEFAULT_COOLDOWN_MULTIPLIER,
            fallback_to_text: true,
            escalation_enabled: true,
        }
    }
}

impl RecoveryConfig {
    /// Create a config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the reconnect attempt budget
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the first delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the backoff ceiling
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the growth factor
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    /// Enables or disables jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Sets the checkpoint sweep period
    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.state_checkpoint_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Sets the notification debounce window
    pub fn with_notification_delay(mut self, delay: Duration) -> Self {
        self.user_notification_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Sets the stability-check timeout
    pub fn with_stability_timeout(mut self, timeout: Duration) -> Self {
        self.stability_check_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the breaker cooldown multiplier
    pub fn with_breaker_cooldown_multiplier(mut self, multiplier: f64) -> Self {
        self.breaker_cooldown_multiplier = multiplier;
        self
    }

    /// Enables or disables text fallback
    pub fn with_fallback_to_text(mut self, enabled: bool) -> Self {
        self.fallback_to_text = enabled;
        self
    }

    /// Enables or disables escalation
    pub fn with_escalation(mut self, enabled: bool) -> Self {
        self.escalation_enabled = enabled;
        self
    }

    /// Delay before the first reconnect
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Backoff ceiling
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Checkpoint sweep period
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.state_checkpoint_interval_ms)
    }

    /// Notification debounce window
    pub fn notification_delay(&self) -> Duration {
        Duration::from_millis(self.user_notification_delay_ms)
    }

    /// Stability-check timeout
    pub fn stability_timeout(&self) -> Duration {
        Duration::from_millis(self.stability_check_timeout_ms)
    }

    /// Backoff engine settings
    pub fn backoff_config(&self) -> BackoffConfig {
        BackoffConfig::new()
            .with_initial_delay(self.base_delay())
            .with_max_delay(self.max_delay())
            .with_multiplier(self.backoff_factor)
            .with_max_attempts(self.max_retries)
            .with_jitter(if self.jitter { JITTER_FACTOR } else { 0.0 })
    }

    /// Breaker settings for one session
    pub fn breaker_config(&self, session_id: &SessionId) -> CircuitBreakerConfig {
        CircuitBreakerConfig::from_backoff(
            session_id.as_str(),
            &self.backoff_config(),
            self.breaker_cooldown_multiplier,
        )
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(RecoveryError::Config("maxRetries must be at least 1".into()));
        }
        if self.base_delay_ms == 0 {
            return Err(RecoveryError::Config("baseDelayMs must be positive".into()));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(RecoveryError::Config(format!(
                "maxDelayMs ({}) is below baseDelayMs ({})",
                self.max_delay_ms, self.base_delay_ms
            )));
        }
        if !(self.backoff_factor >= 1.0) {
            return Err(RecoveryError::Config("backoffFactor must be >= 1.0".into()));
        }
        if !(self.breaker_cooldown_multiplier > 0.0) {
            return Err(RecoveryError::Config(
                "breakerCooldownMultiplier must be positive".into(),
            ));
        }
        if self.breaker_cooldown_multiplier > MAX_COOLDOWN_MULTIPLIER
            || scaled_cooldown(self.max_delay(), self.breaker_cooldown_multiplier).is_none()
        {
            return Err(RecoveryError::Config(format!(
                "breakerCooldownMultiplier must be at most {MAX_COOLDOWN_MULTIPLIER}"
            )));
        }
        if self.state_checkpoint_interval_ms == 0 {
            return Err(RecoveryError::Config(
                "stateCheckpointIntervalMs must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Parses and validates a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Writes the config as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}
