//! Recovery orchestrator
//!
//! Per-session state machine driven by lifecycle signals:
//!
//! ```text
//! Stable ──lost──▶ Recovering ──ping ok / restored──▶ Restored
//!                      │
//!                      ├──exhausted / breaker open──▶ FallbackText
//!                      └──restore failed / no checkpoint──▶ Escalated
//! ```
//!
//! At most one reconnect loop runs per session. Each loop carries an epoch;
//! it stops acting as soon as the session's active entry no longer holds
//! that epoch, which is how cleanup and supersession cancel it.
//!
//! Signals from the channel returned by [`RecoveryOrchestrator::start`] are
//! queued per session. Sessions are handled concurrently; signals for one
//! session run one at a time in arrival order.

use crate::checkpoint::CheckpointStore;
use crate::config::RecoveryConfig;
use crate::metrics::{MetricsSnapshot, RecoveryMetrics};
use crate::notify::Notifier;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use voice_recovery_error::{RecoveryError, Result};
use voice_recovery_traits::{
    CheckpointPersister, DiagnosticsSink, EscalationRecord, LifecycleSignal, NotificationSink,
    NotificationType, SessionCheckpoint, SessionId, SessionRestorer, SessionStateProvider,
    Severity, TransportControl,
};
use voice_resilience::{
    with_timeout, CircuitBreaker, ExponentialBackoff, RetryClassifier, TransportErrorClassifier,
};

/// Capacity of the lifecycle signal channel returned by [`RecoveryOrchestrator::start`]
pub const SIGNAL_BUFFER: usize = 256;

/// Recovery state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryState {
    /// Connected, nothing to do
    Stable,
    /// Reconnect loop running
    Recovering,
    /// Session resumed from checkpoint
    Restored,
    /// Voice abandoned, session continues in text mode
    FallbackText,
    /// Handed to human support
    Escalated,
}

impl RecoveryState {
    /// True for the outcomes of a recovery
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Restored | Self::FallbackText | Self::Escalated)
    }
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stable => "stable",
            Self::Recovering => "recovering",
            Self::Restored => "restored",
            Self::FallbackText => "fallback_text",
            Self::Escalated => "escalated",
        };
        f.write_str(s)
    }
}

/// External collaborators the orchestrator talks to
#[derive(Clone)]
pub struct Collaborators {
    /// Reads canonical session state for checkpoints
    pub state_provider: Arc<dyn SessionStateProvider>,
    /// Applies checkpoints to the live session
    pub restorer: Arc<dyn SessionRestorer>,
    /// Outbound transport commands
    pub transport: Arc<dyn TransportControl>,
    /// Durable checkpoint side-channel, in-memory only when `None`
    pub persister: Option<Arc<dyn CheckpointPersister>>,
    /// User-facing notifications
    pub notifications: Arc<dyn NotificationSink>,
    /// Escalation records
    pub diagnostics: Arc<dyn DiagnosticsSink>,
}

/// Process-local retry bookkeeping for one session
#[derive(Debug)]
struct RecoveryAttemptState {
    retries: AtomicU32,
    breaker: Arc<CircuitBreaker>,
}

struct Inner {
    config: RecoveryConfig,
    store: Arc<CheckpointStore>,
    transport: Arc<dyn TransportControl>,
    diagnostics: Arc<dyn DiagnosticsSink>,
    notifier: Arc<Notifier>,
    metrics: Arc<RecoveryMetrics>,
    classifier: TransportErrorClassifier,
    active: DashMap<SessionId, u64>,
    next_epoch: AtomicU64,
    sessions: DashMap<SessionId, Arc<RecoveryAttemptState>>,
    states: DashMap<SessionId, RecoveryState>,
    started: DashMap<SessionId, Instant>,
    errors: DashMap<SessionId, u32>,
    loops: DashMap<SessionId, (u64, JoinHandle<()>)>,
    queues: DashMap<SessionId, VecDeque<LifecycleSignal>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Voice session recovery orchestrator.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for RecoveryOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryOrchestrator")
            .field("config", &self.inner.config)
            .field("active", &self.inner.active.len())
            .field("sessions", &self.inner.states.len())
            .finish()
    }
}

impl RecoveryOrchestrator {
    /// Creates an orchestrator; fails on invalid config
    pub fn new(config: RecoveryConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(RecoveryMetrics::new());
        let store = Arc::new(CheckpointStore::new(
            collaborators.state_provider,
            collaborators.restorer,
            collaborators.persister,
        ));
        let notifier = Arc::new(Notifier::new(
            collaborators.notifications,
            metrics.clone(),
            config.notification_delay(),
        ));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                transport: collaborators.transport,
                diagnostics: collaborators.diagnostics,
                notifier,
                metrics,
                classifier: TransportErrorClassifier,
                active: DashMap::new(),
                next_epoch: AtomicU64::new(0),
                sessions: DashMap::new(),
                states: DashMap::new(),
                started: DashMap::new(),
                errors: DashMap::new(),
                loops: DashMap::new(),
                queues: DashMap::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Starts the checkpoint sweep and the signal pump.
    ///
    /// Signals sent on the returned channel go through [`Self::dispatch`].
    pub fn start(&self) -> mpsc::Sender<LifecycleSignal> {
        let (tx, mut rx) = mpsc::channel(SIGNAL_BUFFER);

        let this = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                this.dispatch(signal);
            }
            debug!("Lifecycle signal channel closed");
        });

        let sweeper = self
            .inner
            .store
            .clone()
            .spawn_sweeper(self.inner.config.checkpoint_interval());

        self.inner.tasks.lock().extend([pump, sweeper]);
        info!(
            interval = ?self.inner.config.checkpoint_interval(),
            "Voice recovery started"
        );
        tx
    }

    /// Stops the sweep, the signal pump and every reconnect loop
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }

        let sessions: Vec<SessionId> = self.inner.loops.iter().map(|e| e.key().clone()).collect();
        for session_id in sessions {
            if let Some((_, (_, handle))) = self.inner.loops.remove(&session_id) {
                handle.abort();
            }
        }

        // Per-session workers stop after the signal they are handling.
        self.inner.queues.clear();
        self.inner.active.clear();
        self.inner.notifier.cancel_all();
        info!("Voice recovery shut down");
    }

    /// Queues a signal behind any still pending for the same session.
    ///
    /// The first signal for an idle session spawns a worker that drains the
    /// session's queue and exits once it is empty. Must be called from within
    /// a tokio runtime.
    pub fn dispatch(&self, signal: LifecycleSignal) {
        let session_id = signal.session_id().clone();
        match self.inner.queues.entry(session_id.clone()) {
            Entry::Occupied(mut queue) => queue.get_mut().push_back(signal),
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::new());
                let this = self.clone();
                tokio::spawn(async move { this.drain_signals(session_id, signal).await });
            }
        }
    }

    async fn drain_signals(self, session_id: SessionId, first: LifecycleSignal) {
        let mut next = Some(first);
        while let Some(signal) = next {
            self.handle_signal(signal).await;
            next = self.next_signal(&session_id);
        }
        debug!(session = %session_id, "Signal queue drained");
    }

    /// Pops the next queued signal; an empty queue is released atomically
    fn next_signal(&self, session_id: &SessionId) -> Option<LifecycleSignal> {
        match self.inner.queues.entry(session_id.clone()) {
            Entry::Occupied(mut queue) => {
                let signal = queue.get_mut().pop_front();
                if signal.is_none() {
                    queue.remove();
                }
                signal
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Handles one lifecycle signal inline
    pub async fn handle_signal(&self, signal: LifecycleSignal) {
        debug!(session = %signal.session_id(), signal = signal.kind(), "Lifecycle signal");
        match signal {
            LifecycleSignal::ConnectionLost { session_id, reason } => {
                self.on_connection_lost(&session_id, reason.as_deref()).await
            }
            LifecycleSignal::ConnectionRestored { session_id } => {
                self.on_connection_restored(&session_id).await
            }
            LifecycleSignal::SessionError { session_id, error } => {
                self.on_session_error(&session_id, &error).await
            }
            LifecycleSignal::StateCorrupted { session_id, error } => {
                self.on_state_corrupted(&session_id, error.as_deref()).await
            }
        }
    }

    /// Starts recovery for a session; a no-op while one is already running
    pub async fn on_connection_lost(&self, session_id: &SessionId, reason: Option<&str>) {
        let Some(epoch) = self.begin_recovery(session_id) else {
            debug!(session = %session_id, "Recovery already in progress, ignoring");
            return;
        };

        let reason = reason.unwrap_or("connection lost").to_string();
        info!(session = %session_id, reason = %reason, "Voice connection lost, starting recovery");

        self.inner.metrics.record_attempt();
        self.inner.store.track(session_id);
        self.inner.started.insert(session_id.clone(), Instant::now());
        let attempt = self.attempt_state(session_id);
        attempt.retries.store(0, Ordering::SeqCst);

        if let Err(e) = self
            .inner
            .store
            .refresh_tracked(session_id, self.error_count(session_id))
            .await
        {
            warn!(session = %session_id, error = %e, "Could not checkpoint before recovery");
        }

        if !self.is_current(session_id, epoch) {
            debug!(session = %session_id, "Session cleaned up while checkpointing");
            return;
        }

        if attempt.breaker.is_open().await {
            if self.finish_recovery(session_id, epoch) {
                info!(session = %session_id, "Circuit open, skipping reconnect");
                self.fallback(session_id, "circuit breaker open").await;
            }
            return;
        }

        if !self.set_state_if_current(session_id, epoch, RecoveryState::Recovering) {
            debug!(session = %session_id, "Session cleaned up before reconnecting");
            return;
        }

        let this = self.clone();
        let id = session_id.clone();
        let handle = tokio::spawn(async move {
            this.clone().run_recovery(id.clone(), epoch, reason).await;
            this.inner.loops.remove_if(&id, |_, (owner, _)| *owner == epoch);
        });
        self.inner.loops.insert(session_id.clone(), (epoch, handle));

        // The loop may already have finished and missed its own entry.
        if !self.is_current(session_id, epoch) {
            self.inner.loops.remove_if(session_id, |_, (owner, _)| *owner == epoch);
        }
    }

    /// Handles the transport reporting the connection back
    pub async fn on_connection_restored(&self, session_id: &SessionId) {
        let active_epoch = self.inner.active.get(session_id).map(|e| *e.value());
        match active_epoch {
            Some(epoch) => {
                if !self.finish_recovery(session_id, epoch) {
                    return;
                }
                info!(session = %session_id, "Connection restored during recovery");
                self.complete_recovery(session_id).await;
            }
            None => {
                // Late reconnects after fallback or a process reload still resume.
                if matches!(
                    self.state(session_id),
                    Some(RecoveryState::Stable) | Some(RecoveryState::Restored)
                ) {
                    debug!(session = %session_id, "Connection restored, nothing to recover");
                    return;
                }

                match self.inner.store.get_or_load(session_id).await {
                    Ok(Some(checkpoint)) => {
                        info!(session = %session_id, "Late reconnect, resuming from checkpoint");
                        self.restore_and_finish(session_id, checkpoint).await;
                    }
                    Ok(None) => debug!(session = %session_id, "Connection restored without checkpoint"),
                    Err(e) => {
                        let retries = self.retry_count(session_id);
                        self.escalate(session_id, &e.to_string(), None, retries).await;
                    }
                }
            }
        }
    }

    /// Routes a transport session error by its retryability
    pub async fn on_session_error(&self, session_id: &SessionId, error: &str) {
        let count = {
            let mut entry = self.inner.errors.entry(session_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if self.inner.classifier.is_retryable(error) {
            debug!(session = %session_id, error, count, "Transient session error");
            self.on_connection_lost(session_id, Some(error)).await;
        } else {
            warn!(session = %session_id, error, count, "Non-transient session error");
            self.on_state_corrupted(session_id, Some(error)).await;
        }
    }

    /// Restores from checkpoint immediately, escalating when there is none
    pub async fn on_state_corrupted(&self, session_id: &SessionId, error: Option<&str>) {
        let error = error.unwrap_or("session state corrupted");
        warn!(session = %session_id, error, "Session state corrupted");

        if self.inner.active.remove(session_id).is_some() {
            debug!(session = %session_id, "Abandoning reconnect loop for corrupted session");
        }

        let retries = self.retry_count(session_id);
        match self.inner.store.get_or_load(session_id).await {
            Ok(Some(checkpoint)) => match self.inner.store.restore_checkpoint(&checkpoint).await {
                Ok(updated) => {
                    self.set_state(session_id, RecoveryState::Restored);
                    info!(session = %session_id, "Corrupted session restored from checkpoint");
                    self.inner.notifier.schedule(
                        session_id,
                        NotificationType::SessionRecovered,
                        json!({ "recoveryAttempts": updated.recovery_attempts }),
                        Severity::Info,
                    );
                }
                Err(e) => {
                    self.escalate(session_id, &e.to_string(), Some(checkpoint), retries)
                        .await
                }
            },
            Ok(None) => {
                let reason = format!("{error}; no checkpoint available");
                self.escalate(session_id, &reason, None, retries).await;
            }
            Err(e) => self.escalate(session_id, &e.to_string(), None, retries).await,
        }
    }

    /// User-triggered voice retry after a text fallback.
    ///
    /// Fails with [`RecoveryError::CircuitOpen`] while the session's breaker
    /// is cooling down.
    pub async fn retry_voice(&self, session_id: &SessionId) -> Result<()> {
        let breaker = self.inner.sessions.get(session_id).map(|s| s.breaker.clone());
        if let Some(breaker) = breaker {
            if let Err(open) = breaker.check().await {
                return Err(RecoveryError::CircuitOpen {
                    session_id: session_id.to_string(),
                    retry_after_ms: open.retry_after.as_millis() as u64,
                });
            }
        }

        self.inner
            .transport
            .request_retry(session_id)
            .await
            .map_err(|e| RecoveryError::Transport(e.to_string()))?;

        info!(session = %session_id, "User requested voice retry");
        self.on_connection_lost(session_id, Some("voice retry requested"))
            .await;
        Ok(())
    }

    /// Drops every trace of a session; safe at any point, including mid-recovery
    pub async fn cleanup_session(&self, session_id: &SessionId) {
        self.inner.active.remove(session_id);
        self.inner.sessions.remove(session_id);
        self.inner.states.remove(session_id);
        self.inner.started.remove(session_id);
        self.inner.errors.remove(session_id);
        // Any loop still sleeping sees its epoch gone and exits on wake.
        self.inner.loops.remove(session_id);
        self.inner.notifier.cancel(session_id);
        self.inner.store.remove(session_id).await;
        debug!(session = %session_id, "Session cleaned up");
    }

    /// Current state, `None` for unknown sessions
    pub fn state(&self, session_id: &SessionId) -> Option<RecoveryState> {
        self.inner.states.get(session_id).map(|s| *s.value())
    }

    /// Latest in-memory checkpoint
    pub fn checkpoint(&self, session_id: &SessionId) -> Option<SessionCheckpoint> {
        self.inner.store.get(session_id)
    }

    /// True while a reconnect loop owns the session
    pub fn is_recovering(&self, session_id: &SessionId) -> bool {
        self.inner.active.contains_key(session_id)
    }

    /// Sessions covered by the periodic checkpoint sweep
    pub fn tracked_sessions(&self) -> Vec<SessionId> {
        self.inner.store.tracked_sessions()
    }

    /// Starts sweeping a session before any failure
    pub fn track_session(&self, session_id: &SessionId) {
        self.inner.store.track(session_id);
        self.inner
            .states
            .entry(session_id.clone())
            .or_insert(RecoveryState::Stable);
    }

    /// True while the session's breaker is open
    pub async fn is_circuit_open(&self, session_id: &SessionId) -> bool {
        let breaker = self.inner.sessions.get(session_id).map(|s| s.breaker.clone());
        match breaker {
            Some(breaker) => breaker.is_open().await,
            None => false,
        }
    }

    /// Counter snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Active configuration
    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    /// Checkpoint store shared with the sweep
    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.inner.store
    }

    // ============ Recovery loop ============

    async fn run_recovery(self, session_id: SessionId, epoch: u64, reason: String) {
        if !self.is_current(&session_id, epoch) {
            return;
        }
        let Some(attempt) = self.inner.sessions.get(&session_id).map(|s| s.value().clone()) else {
            return;
        };
        let mut backoff = ExponentialBackoff::new(self.inner.config.backoff_config());

        loop {
            let step = match backoff.wait(&reason).await {
                Ok(step) => step,
                Err(exhausted) => {
                    self.handle_exhausted(&session_id, epoch, &attempt, exhausted.attempts)
                        .await;
                    return;
                }
            };

            if !self.is_current(&session_id, epoch) {
                debug!(session = %session_id, "Recovery cancelled, timer is a no-op");
                return;
            }

            attempt.retries.store(step.attempt, Ordering::SeqCst);
            debug!(
                session = %session_id,
                attempt = step.attempt,
                delay = ?step.delay,
                "Reconnect attempt"
            );

            if step.attempt == 1 {
                self.inner.notifier.schedule(
                    &session_id,
                    NotificationType::ConnectionUnstable,
                    json!({ "maxRetries": self.inner.config.max_retries }),
                    Severity::Warning,
                );
            }

            let outcome = self.try_reconnect(&session_id).await;

            if !self.is_current(&session_id, epoch) {
                debug!(session = %session_id, "Recovery superseded during attempt");
                return;
            }

            match outcome {
                Ok(()) => {
                    if self.finish_recovery(&session_id, epoch) {
                        info!(session = %session_id, attempt = step.attempt, "Reconnected");
                        self.complete_recovery(&session_id).await;
                    }
                    return;
                }
                Err(e) => {
                    *self.inner.errors.entry(session_id.clone()).or_insert(0) += 1;
                    if e.is_retryable() {
                        debug!(
                            session = %session_id,
                            attempt = step.attempt,
                            error = %e,
                            "Reconnect attempt failed"
                        );
                    } else {
                        warn!(session = %session_id, attempt = step.attempt, error = %e, code = ?e.code(), "Unexpected reconnect failure");
                    }
                }
            }
        }
    }

    async fn try_reconnect(&self, session_id: &SessionId) -> Result<()> {
        self.inner
            .transport
            .request_reconnect(session_id)
            .await
            .map_err(|e| RecoveryError::ReconnectFailed(e.to_string()))?;

        let ping = self.inner.transport.ping(session_id);
        match with_timeout(self.inner.config.stability_timeout(), "stability check", ping).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(RecoveryError::StabilityCheckFailed(
                "ping not acknowledged".into(),
            )),
            Ok(Err(e)) => Err(RecoveryError::StabilityCheckFailed(e.to_string())),
            Err(timeout) => Err(RecoveryError::StabilityCheckTimeout {
                millis: timeout.duration.as_millis() as u64,
            }),
        }
    }

    async fn handle_exhausted(
        &self,
        session_id: &SessionId,
        epoch: u64,
        attempt: &RecoveryAttemptState,
        attempts: u32,
    ) {
        if !self.finish_recovery(session_id, epoch) {
            return;
        }

        if attempt.breaker.open().await {
            self.inner.metrics.record_breaker_activation();
        }
        self.inner.metrics.record_failure();
        warn!(session = %session_id, attempts, "Reconnect attempts exhausted");

        match self.inner.store.get_or_load(session_id).await {
            Ok(Some(_)) => self.fallback(session_id, "retries exhausted").await,
            Ok(None) => {
                self.escalate(session_id, "max retries exceeded with no checkpoint", None, attempts)
                    .await
            }
            Err(e) => self.escalate(session_id, &e.to_string(), None, attempts).await,
        }
    }

    // ============ Outcomes ============

    async fn complete_recovery(&self, session_id: &SessionId) {
        match self.inner.store.get_or_load(session_id).await {
            Ok(Some(checkpoint)) => self.restore_and_finish(session_id, checkpoint).await,
            Ok(None) => {
                warn!(session = %session_id, "Reconnected without a checkpoint to restore");
                self.mark_recovered(session_id, 0).await;
            }
            Err(e) => {
                let retries = self.retry_count(session_id);
                self.escalate(session_id, &e.to_string(), None, retries).await;
            }
        }
    }

    async fn restore_and_finish(&self, session_id: &SessionId, checkpoint: SessionCheckpoint) {
        match self.inner.store.restore_checkpoint(&checkpoint).await {
            Ok(updated) => self.mark_recovered(session_id, updated.recovery_attempts).await,
            Err(e) => {
                let retries = self.retry_count(session_id);
                self.escalate(session_id, &e.to_string(), Some(checkpoint), retries)
                    .await;
            }
        }
    }

    async fn mark_recovered(&self, session_id: &SessionId, recovery_attempts: u32) {
        if let Some((_, attempt)) = self.inner.sessions.remove(session_id) {
            attempt.breaker.reset().await;
        }
        let elapsed = self
            .inner
            .started
            .remove(session_id)
            .map(|(_, started)| started.elapsed())
            .unwrap_or_default();

        self.set_state(session_id, RecoveryState::Restored);
        self.inner.metrics.record_success(elapsed);
        info!(session = %session_id, elapsed = ?elapsed, "Voice session recovered");

        self.inner.notifier.schedule(
            session_id,
            NotificationType::SessionRecovered,
            json!({ "recoveryAttempts": recovery_attempts }),
            Severity::Info,
        );
    }

    async fn fallback(&self, session_id: &SessionId, reason: &str) {
        if !self.inner.config.fallback_to_text {
            let retries = self.retry_count(session_id);
            let error = format!("{reason}; text fallback disabled");
            self.escalate(session_id, &error, None, retries).await;
            return;
        }

        if let Err(e) = self.inner.transport.request_text_fallback(session_id).await {
            warn!(session = %session_id, error = %e, "Transport rejected text fallback");
        }
        match self
            .inner
            .store
            .refresh_tracked(session_id, self.error_count(session_id))
            .await
        {
            Ok(Some(_)) => {}
            Ok(None) => {
                debug!(session = %session_id, "Session cleaned up during fallback");
                return;
            }
            Err(e) => {
                debug!(session = %session_id, error = %e, "Keeping previous checkpoint for fallback")
            }
        }

        self.set_state(session_id, RecoveryState::FallbackText);
        self.inner.metrics.record_fallback();
        warn!(session = %session_id, reason, "Falling back to text mode");

        self.inner.notifier.schedule(
            session_id,
            NotificationType::FallbackToText,
            json!({ "canRetryVoice": true }),
            Severity::Warning,
        );
    }

    async fn escalate(
        &self,
        session_id: &SessionId,
        error: &str,
        checkpoint: Option<SessionCheckpoint>,
        retry_count: u32,
    ) {
        self.inner.active.remove(session_id);
        let circuit_breaker_open = self.is_circuit_open(session_id).await;
        let checkpoint = checkpoint.or_else(|| self.inner.store.get(session_id));

        self.set_state(session_id, RecoveryState::Escalated);
        self.inner.metrics.record_escalation();
        error!(
            session = %session_id,
            error,
            retry_count,
            circuit_breaker_open,
            "Voice recovery escalated"
        );

        if !self.inner.config.escalation_enabled {
            return;
        }

        let record = EscalationRecord {
            session_id: session_id.clone(),
            error: error.to_string(),
            retry_count,
            circuit_breaker_open,
            checkpoint,
            severity: Severity::Error,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.inner.diagnostics.report_escalation(record).await {
            warn!(session = %session_id, error = %e, "Diagnostics sink failed");
        }

        self.inner.notifier.schedule(
            session_id,
            NotificationType::EscalationRequired,
            json!({ "supportContact": true }),
            Severity::Error,
        );
    }

    // ============ Bookkeeping ============

    fn begin_recovery(&self, session_id: &SessionId) -> Option<u64> {
        match self.inner.active.entry(session_id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let epoch = self.inner.next_epoch.fetch_add(1, Ordering::SeqCst) + 1;
                slot.insert(epoch);
                Some(epoch)
            }
        }
    }

    fn is_current(&self, session_id: &SessionId, epoch: u64) -> bool {
        self.inner
            .active
            .get(session_id)
            .map(|e| *e.value() == epoch)
            .unwrap_or(false)
    }

    /// Releases the active slot; only the caller holding `epoch` wins
    fn finish_recovery(&self, session_id: &SessionId, epoch: u64) -> bool {
        self.inner
            .active
            .remove_if(session_id, |_, current| *current == epoch)
            .is_some()
    }

    fn attempt_state(&self, session_id: &SessionId) -> Arc<RecoveryAttemptState> {
        self.inner
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                Arc::new(RecoveryAttemptState {
                    retries: AtomicU32::new(0),
                    breaker: Arc::new(CircuitBreaker::new(
                        self.inner.config.breaker_config(session_id),
                    )),
                })
            })
            .clone()
    }

    fn retry_count(&self, session_id: &SessionId) -> u32 {
        self.inner
            .sessions
            .get(session_id)
            .map(|s| s.retries.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn error_count(&self, session_id: &SessionId) -> u32 {
        self.inner.errors.get(session_id).map(|e| *e.value()).unwrap_or(0)
    }

    fn set_state(&self, session_id: &SessionId, state: RecoveryState) {
        let previous = self.inner.states.insert(session_id.clone(), state);
        debug!(session = %session_id, from = ?previous, to = %state, "Recovery state changed");
    }

    /// Sets the state only while `epoch` owns the session.
    ///
    /// The active entry stays locked during the write, so a concurrent
    /// cleanup either runs first and wins or removes the state afterwards.
    fn set_state_if_current(&self, session_id: &SessionId, epoch: u64, state: RecoveryState) -> bool {
        let Some(active) = self.inner.active.get(session_id) else {
            return false;
        };
        if *active.value() != epoch {
            return false;
        }
        self.set_state(session_id, state);
        true
    }
}
