//! Process-wide recovery counters
//!
//! Counters only ever grow; they reset with the process. With the `metrics`
//! feature every increment is mirrored into the `metrics` facade.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cumulative recovery counters shared by all sessions
#[derive(Debug, Default)]
pub struct RecoveryMetrics {
    total_recovery_attempts: AtomicU64,
    successful_recoveries: AtomicU64,
    failed_recoveries: AtomicU64,
    total_recovery_time_ms: AtomicU64,
    circuit_breaker_activations: AtomicU64,
    fallback_activations: AtomicU64,
    escalations: AtomicU64,
    notifications_sent: AtomicU64,
}

/// Point-in-time view of [`RecoveryMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Recovery processes started
    pub total_recovery_attempts: u64,
    /// Recoveries that restored the session
    pub successful_recoveries: u64,
    /// Recoveries that exhausted their retries
    pub failed_recoveries: u64,
    /// Mean time from loss to restoration, in milliseconds
    pub average_recovery_time_ms: u64,
    /// Breakers opened
    pub circuit_breaker_activations: u64,
    /// Sessions degraded to text mode
    pub fallback_activations: u64,
    /// Sessions handed to human support
    pub escalations: u64,
    /// Notifications delivered
    pub notifications_sent: u64,
}

macro_rules! bump {
    ($field:expr, $name:literal) => {{
        $field.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(concat!("voice_recovery_", $name)).increment(1);
    }};
}

impl RecoveryMetrics {
    /// Creates zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// A recovery process started
    pub fn record_attempt(&self) {
        bump!(self.total_recovery_attempts, "attempts_total");
    }

    /// A recovery restored the session after `elapsed`
    pub fn record_success(&self, elapsed: Duration) {
        bump!(self.successful_recoveries, "successes_total");
        self.total_recovery_time_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::histogram!("voice_recovery_duration_seconds").record(elapsed.as_secs_f64());
    }

    /// A recovery exhausted its retries
    pub fn record_failure(&self) {
        bump!(self.failed_recoveries, "failures_total");
    }

    /// A breaker opened
    pub fn record_breaker_activation(&self) {
        bump!(self.circuit_breaker_activations, "breaker_activations_total");
    }

    /// A session fell back to text
    pub fn record_fallback(&self) {
        bump!(self.fallback_activations, "fallbacks_total");
    }

    /// A session was escalated
    pub fn record_escalation(&self) {
        bump!(self.escalations, "escalations_total");
    }

    /// A notification reached the sink
    pub fn record_notification(&self) {
        bump!(self.notifications_sent, "notifications_total");
    }

    /// Reads all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        let successes = self.successful_recoveries.load(Ordering::Relaxed);
        let total_time = self.total_recovery_time_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_recovery_attempts: self.total_recovery_attempts.load(Ordering::Relaxed),
            successful_recoveries: successes,
            failed_recoveries: self.failed_recoveries.load(Ordering::Relaxed),
            average_recovery_time_ms: if successes == 0 { 0 } else { total_time / successes },
            circuit_breaker_activations: self.circuit_breaker_activations.load(Ordering::Relaxed),
            fallback_activations: self.fallback_activations.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            notifications_sent: self.notifications_sent.load(Ordering::Relaxed),
        }
    }
}
