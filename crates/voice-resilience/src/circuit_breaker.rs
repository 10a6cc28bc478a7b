//! Per-session circuit breaker
//!
//! A two-state latch. It opens when the backoff engine reports exhaustion
//! and closes again either on its own once the cooldown has elapsed or when
//! a later reconnection succeeds and calls [`CircuitBreaker::reset`].

use crate::backoff::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Default cooldown multiplier applied to the backoff ceiling
pub const DEFAULT_COOLDOWN_MULTIPLIER: f64 = 3.0;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum CircuitState {
    /// Recovery attempts are allowed
    Closed = 0,
    /// Recovery attempts are short-circuited to fallback
    Open = 1,
}

impl From<u8> for CircuitState {
    fn from(v: u8) -> Self {
        match v {
            1 => CircuitState::Open,
            _ => CircuitState::Closed,
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Time the breaker stays open before closing on its own
    pub cooldown: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            cooldown: BackoffConfig::default()
                .max_delay
                .mul_f64(DEFAULT_COOLDOWN_MULTIPLIER),
            name: "default".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with a name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Cooldown derived from the backoff ceiling: `multiplier * max_delay`.
    ///
    /// Saturates at [`Duration::MAX`] instead of overflowing.
    pub fn from_backoff(name: impl Into<String>, backoff: &BackoffConfig, multiplier: f64) -> Self {
        Self {
            name: name.into(),
            cooldown: scaled_cooldown(backoff.max_delay, multiplier).unwrap_or(Duration::MAX),
        }
    }

    /// Set cooldown
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// `max_delay * multiplier`, `None` when it does not fit in a [`Duration`].
///
/// Negative and NaN multipliers count as zero.
pub fn scaled_cooldown(max_delay: Duration, multiplier: f64) -> Option<Duration> {
    let multiplier = if multiplier.is_nan() { 0.0 } else { multiplier.max(0.0) };
    Duration::try_from_secs_f64(max_delay.as_secs_f64() * multiplier).ok()
}

/// Error when circuit is open
#[derive(Debug, Clone, Error)]
#[error("Circuit '{name}' is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    /// Name of the circuit breaker
    pub name: String,
    /// Time until the circuit closes on its own
    pub retry_after: Duration,
}

/// Circuit breaker metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitMetrics {
    /// Current state
    pub state: CircuitState,
    /// Times the breaker went from closed to open
    pub activations: u64,
}

/// Circuit breaker guarding reconnection for one session
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    activations: AtomicU64,
    opened_at: RwLock<Option<Instant>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with config
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            activations: AtomicU64::new(0),
            opened_at: RwLock::new(None),
        }
    }

    /// Create with default config and name
    pub fn with_name(name: impl Into<String>) -> Self {
        Self::new(CircuitBreakerConfig::new(name))
    }

    /// Borrow the config
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Raw state, without applying the cooldown
    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::SeqCst))
    }

    /// Open the breaker.
    ///
    /// Returns true when this call moved it from closed to open; opening an
    /// already-open breaker is a no-op that keeps the original timestamp.
    pub async fn open(&self) -> bool {
        let mut opened_at = self.opened_at.write().await;
        if self.state() == CircuitState::Open && !self.cooldown_elapsed(*opened_at) {
            return false;
        }

        *opened_at = Some(Instant::now());
        self.state.store(CircuitState::Open as u8, Ordering::SeqCst);
        self.activations.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            circuit = %self.config.name,
            cooldown = ?self.config.cooldown,
            "Circuit opened"
        );
        true
    }

    /// True while open and the cooldown has not elapsed.
    ///
    /// Closes the breaker as a side effect once the cooldown is over.
    pub async fn is_open(&self) -> bool {
        if self.state() == CircuitState::Closed {
            return false;
        }

        let opened_at = *self.opened_at.read().await;
        if self.cooldown_elapsed(opened_at) {
            self.transition_to_closed().await;
            tracing::info!(circuit = %self.config.name, "Circuit closed after cooldown");
            return false;
        }
        true
    }

    /// Fails with [`CircuitOpenError`] while the breaker is open
    pub async fn check(&self) -> Result<(), CircuitOpenError> {
        if !self.is_open().await {
            return Ok(());
        }
        Err(CircuitOpenError {
            name: self.config.name.clone(),
            retry_after: self.retry_after().await.unwrap_or_default(),
        })
    }

    /// Remaining cooldown, `None` when closed
    pub async fn retry_after(&self) -> Option<Duration> {
        if self.state() == CircuitState::Closed {
            return None;
        }
        let opened = (*self.opened_at.read().await)?;
        Some(self.config.cooldown.saturating_sub(opened.elapsed()))
    }

    /// Close the breaker after a successful reconnection
    pub async fn reset(&self) {
        if self.state() == CircuitState::Open {
            tracing::info!(circuit = %self.config.name, "Circuit reset after successful reconnection");
        }
        self.transition_to_closed().await;
    }

    /// Get metrics
    pub fn metrics(&self) -> CircuitMetrics {
        CircuitMetrics {
            state: self.state(),
            activations: self.activations.load(Ordering::SeqCst),
        }
    }

    fn cooldown_elapsed(&self, opened_at: Option<Instant>) -> bool {
        match opened_at {
            Some(opened) => opened.elapsed() > self.config.cooldown,
            None => true,
        }
    }

    async fn transition_to_closed(&self) {
        let mut opened_at = self.opened_at.write().await;
        *opened_at = None;
        self.state.store(CircuitState::Closed as u8, Ordering::SeqCst);
    }
}
