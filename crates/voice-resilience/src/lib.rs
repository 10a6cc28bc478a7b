//! # Voice Resilience
//!
//! Retry primitives used by the voice session recovery orchestrator:
//!
//! - **Exponential Backoff**: capped exponential delays with jitter and an attempt budget
//! - **Circuit Breaker**: per-session latch that stops reconnect storms for a cooldown
//! - **Timeouts**: bounded ping/acknowledgement round-trips
//! - **Error Classification**: transient vs. fatal transport session errors
//!
//! ## Exponential Backoff
//!
//! ```rust
//! use voice_resilience::{BackoffConfig, ExponentialBackoff};
//! use std::time::Duration;
//!
//! let config = BackoffConfig::new()
//!     .with_initial_delay(Duration::from_secs(1))
//!     .with_max_delay(Duration::from_secs(10))
//!     .with_max_attempts(5)
//!     .with_jitter(0.0);
//!
//! let delays: Vec<_> = ExponentialBackoff::new(config).collect();
//! assert_eq!(delays[0], Duration::from_secs(1));
//! assert_eq!(delays[4], Duration::from_secs(10));
//! ```
//!
//! ## Circuit Breaker
//!
//! ```rust
//! use voice_resilience::{BackoffConfig, CircuitBreaker, CircuitBreakerConfig, CircuitState};
//!
//! # async fn example() {
//! let backoff = BackoffConfig::default();
//! let cb = CircuitBreaker::new(CircuitBreakerConfig::from_backoff("session-1", &backoff, 3.0));
//!
//! assert!(cb.open().await);
//! assert!(!cb.open().await); // already open
//! assert_eq!(cb.state(), CircuitState::Open);
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod circuit_breaker;
pub mod classify;
pub mod timeout;

// Re-export main types
pub use backoff::{BackoffConfig, BackoffStep, ExponentialBackoff, RetryExhausted};

pub use circuit_breaker::{
    scaled_cooldown, CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitOpenError,
    CircuitState, DEFAULT_COOLDOWN_MULTIPLIER,
};

pub use classify::{RetryClassifier, TransportErrorClassifier};

pub use timeout::{with_timeout, TimeoutError, DEFAULT_STABILITY_TIMEOUT};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_circuit_breaker_creation() {
        let cb = CircuitBreaker::with_name("test");
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_backoff_config() {
        let config = BackoffConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.max_delay, Duration::from_secs(10));
    }

    #[test]
    fn test_default_breaker_cooldown_is_three_ceilings() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.cooldown, Duration::from_secs(30));
    }
}
