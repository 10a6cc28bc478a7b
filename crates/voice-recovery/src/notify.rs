//! Debounced user notifications
//!
//! Every scheduled notification waits out the configured delay before it
//! reaches the sink. Scheduling again for the same session supersedes the
//! pending one, so only the latest intent within a window is surfaced.

use crate::metrics::RecoveryMetrics;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};
use voice_recovery_traits::{
    NotificationSink, NotificationType, SessionId, Severity, UserNotification,
};

/// User-readable text for each notification type
pub fn default_message(kind: NotificationType) -> &'static str {
    match kind {
        NotificationType::SessionRecovered => {
            "Your voice session is back. Picking up right where you left off."
        }
        NotificationType::FallbackToText => {
            "Voice is having trouble, so we switched to text. Your progress is saved and you can try voice again any time."
        }
        NotificationType::EscalationRequired => {
            "We couldn't restore your session automatically. Our support team has been alerted."
        }
        NotificationType::ConnectionUnstable => "Your connection is unstable. Reconnecting...",
    }
}

/// Schedules delayed notifications per session
pub struct Notifier {
    sink: Arc<dyn NotificationSink>,
    metrics: Arc<RecoveryMetrics>,
    delay: Duration,
    pending: DashMap<SessionId, u64>,
    generation: AtomicU64,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("delay", &self.delay)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Notifier {
    /// Creates a notifier delivering to `sink` after `delay`
    pub fn new(sink: Arc<dyn NotificationSink>, metrics: Arc<RecoveryMetrics>, delay: Duration) -> Self {
        Self {
            sink,
            metrics,
            delay,
            pending: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Schedules a notification with the default message for its type
    pub fn schedule(
        self: &Arc<Self>,
        session_id: &SessionId,
        kind: NotificationType,
        data: serde_json::Value,
        severity: Severity,
    ) {
        self.schedule_message(session_id, kind, default_message(kind), data, severity);
    }

    /// Schedules a notification, superseding any pending one for the session
    pub fn schedule_message(
        self: &Arc<Self>,
        session_id: &SessionId,
        kind: NotificationType,
        message: impl Into<String>,
        data: serde_json::Value,
        severity: Severity,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(previous) = self.pending.insert(session_id.clone(), generation) {
            trace!(session = %session_id, previous, "Superseding pending notification");
        }

        let this = Arc::clone(self);
        let session_id = session_id.clone();
        let message = message.into();
        tokio::spawn(async move {
            tokio::time::sleep(this.delay).await;

            // Only the latest intent fires, and nothing fires after cancel.
            let current = this.pending.remove_if(&session_id, |_, g| *g == generation);
            if current.is_none() {
                debug!(session = %session_id, kind = %kind, "Notification superseded or cancelled");
                return;
            }

            let notification = UserNotification {
                session_id: session_id.clone(),
                kind,
                message,
                data,
                timestamp: Utc::now(),
                severity,
            };
            match this.sink.notify(notification).await {
                Ok(()) => {
                    this.metrics.record_notification();
                    debug!(session = %session_id, kind = %kind, "Notification delivered");
                }
                Err(e) => warn!(session = %session_id, kind = %kind, error = %e, "Notification sink failed"),
            }
        });
    }

    /// True when a notification is waiting to fire for the session
    pub fn has_pending(&self, session_id: &SessionId) -> bool {
        self.pending.contains_key(session_id)
    }

    /// Drops the pending notification for a session
    pub fn cancel(&self, session_id: &SessionId) {
        self.pending.remove(session_id);
    }

    /// Drops every pending notification
    pub fn cancel_all(&self) {
        self.pending.clear();
    }
}
