//! # Voice Recovery Testing Infrastructure
//!
//! Testing utilities for the voice session recovery workspace:
//! - Recording and scripted collaborator doubles
//! - Gates that park a collaborator call until the test releases it
//! - A ready-made mock environment
//! - Property-based testing strategies
//!
//! ## Usage
//!
//! ```rust,ignore
//! use voice_recovery_testing::*;
//!
//! let env = MockEnvironment::new().with_session("s1", sample_snapshot("student-1", "fractions"));
//! env.transport.push_pings([PingOutcome::Nack, PingOutcome::Ack]);
//!
//! proptest! {
//!     #[test]
//!     fn test_snapshot_roundtrip(snapshot in arb_session_snapshot()) {
//!         // ...
//!     }
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use proptest::prelude::*;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use voice_recovery_traits::{
    BufferHealth, CheckpointPersister, CollaboratorError, CollaboratorResult, ConnectionQuality,
    DiagnosticsSink, EscalationRecord, NotificationSink, NotificationType, RestorePayload,
    SessionId, SessionProgress, SessionRestorer, SessionSnapshot, SessionStateProvider,
    TransportControl, UserNotification, VoiceSessionState,
};
use voice_resilience::BackoffConfig;

// ============================================================================
// Fixtures
// ============================================================================

/// A mid-lesson snapshot with some progress and an active voice link
pub fn sample_snapshot(student_id: &str, topic: &str) -> SessionSnapshot {
    let mut progress = SessionProgress::new(topic);
    progress.complete_topic("warm-up");
    progress.questions_answered = 4;
    progress.total_duration_secs = 600;
    progress.increment("problems_completed", 3);
    progress.increment("voice_turns", 18);

    SessionSnapshot {
        student_id: student_id.to_string(),
        topic: topic.to_string(),
        progress,
        voice_state: VoiceSessionState {
            is_active: true,
            is_recording: true,
            last_audio_at: Some(Utc::now()),
            ..Default::default()
        },
    }
}

// ============================================================================
// Gate
// ============================================================================

/// Latch that holds collaborator calls until [`Gate::open`]
#[derive(Debug)]
pub struct Gate {
    open: watch::Sender<bool>,
}

impl Gate {
    /// Creates a closed gate
    pub fn closed() -> Self {
        let (open, _) = watch::channel(false);
        Self { open }
    }

    /// Releases every current and future waiter
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    /// True once opened
    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Resolves once the gate is open
    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

// ============================================================================
// Session State Provider
// ============================================================================

/// Canned session state keyed by session id
#[derive(Debug, Default)]
pub struct MockSessionProvider {
    states: DashMap<SessionId, SessionSnapshot>,
    gates: DashMap<SessionId, Arc<Gate>>,
    reads: AtomicUsize,
}

impl MockSessionProvider {
    /// Creates a provider with no sessions
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state returned for a session
    pub fn set_state(&self, session_id: &SessionId, snapshot: SessionSnapshot) {
        self.states.insert(session_id.clone(), snapshot);
    }

    /// Forgets a session; later reads fail with `UnknownSession`
    pub fn remove_state(&self, session_id: &SessionId) {
        self.states.remove(session_id);
    }

    /// Parks reads for a session until the returned gate opens
    pub fn hold(&self, session_id: &SessionId) -> Arc<Gate> {
        let gate = Arc::new(Gate::closed());
        self.gates.insert(session_id.clone(), gate.clone());
        gate
    }

    /// Number of state reads started, including parked ones
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStateProvider for MockSessionProvider {
    async fn current_session_state(&self, session_id: &SessionId) -> CollaboratorResult<SessionSnapshot> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let gate = self.gates.get(session_id).map(|g| g.value().clone());
        if let Some(gate) = gate {
            gate.wait().await;
        }
        self.states
            .get(session_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| CollaboratorError::UnknownSession(session_id.clone()))
    }
}

// ============================================================================
// Session Restorer
// ============================================================================

/// Records restore payloads; can be told to fail
#[derive(Debug, Default)]
pub struct RecordingRestorer {
    payloads: Mutex<Vec<RestorePayload>>,
    failure: Mutex<Option<String>>,
}

impl RecordingRestorer {
    /// Creates a restorer that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every following restore with `reason`
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
    }

    /// Accepts restores again
    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    /// Payloads accepted so far
    pub fn payloads(&self) -> Vec<RestorePayload> {
        self.payloads.lock().clone()
    }
}

#[async_trait]
impl SessionRestorer for RecordingRestorer {
    async fn restore_session(&self, payload: RestorePayload) -> CollaboratorResult<()> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(CollaboratorError::Rejected(reason));
        }
        self.payloads.lock().push(payload);
        Ok(())
    }
}

// ============================================================================
// Transport
// ============================================================================

/// How the scripted transport answers a ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingOutcome {
    /// Acknowledged
    Ack,
    /// Answered negatively
    Nack,
    /// Never answered
    Hang,
    /// Transport error
    Error,
}

/// Outbound command seen by the scripted transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    /// `request_reconnect`
    Reconnect(SessionId),
    /// `request_retry`
    Retry(SessionId),
    /// `ping`
    Ping(SessionId),
    /// `request_text_fallback`
    TextFallback(SessionId),
}

/// Transport double answering pings from a script
#[derive(Debug)]
pub struct ScriptedTransport {
    pings: Mutex<VecDeque<PingOutcome>>,
    default_ping: Mutex<PingOutcome>,
    reconnect_failure: Mutex<Option<String>>,
    calls: Mutex<Vec<TransportCall>>,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self {
            pings: Mutex::new(VecDeque::new()),
            default_ping: Mutex::new(PingOutcome::Nack),
            reconnect_failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedTransport {
    /// Creates a transport that nacks every ping
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues ping answers, consumed in order
    pub fn push_pings(&self, outcomes: impl IntoIterator<Item = PingOutcome>) {
        self.pings.lock().extend(outcomes);
    }

    /// Answer used once the queue is empty
    pub fn set_default_ping(&self, outcome: PingOutcome) {
        *self.default_ping.lock() = outcome;
    }

    /// Fails every following reconnect request
    pub fn fail_reconnects(&self, reason: impl Into<String>) {
        *self.reconnect_failure.lock() = Some(reason.into());
    }

    /// All commands received, in order
    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().clone()
    }

    /// Reconnect requests received
    pub fn reconnects(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Reconnect(_)))
    }

    /// Pings received
    pub fn pings(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Ping(_)))
    }

    /// Voice retry requests received
    pub fn retries(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::Retry(_)))
    }

    /// Text fallback requests received
    pub fn text_fallbacks(&self) -> usize {
        self.count(|c| matches!(c, TransportCall::TextFallback(_)))
    }

    fn count(&self, pred: impl Fn(&TransportCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    fn next_ping(&self) -> PingOutcome {
        let scripted = self.pings.lock().pop_front();
        scripted.unwrap_or_else(|| *self.default_ping.lock())
    }
}

#[async_trait]
impl TransportControl for ScriptedTransport {
    async fn request_reconnect(&self, session_id: &SessionId) -> CollaboratorResult<()> {
        self.calls.lock().push(TransportCall::Reconnect(session_id.clone()));
        match self.reconnect_failure.lock().clone() {
            Some(reason) => Err(CollaboratorError::Transport(reason)),
            None => Ok(()),
        }
    }

    async fn request_retry(&self, session_id: &SessionId) -> CollaboratorResult<()> {
        self.calls.lock().push(TransportCall::Retry(session_id.clone()));
        Ok(())
    }

    async fn ping(&self, session_id: &SessionId) -> CollaboratorResult<bool> {
        self.calls.lock().push(TransportCall::Ping(session_id.clone()));
        let outcome = self.next_ping();
        match outcome {
            PingOutcome::Ack => Ok(true),
            PingOutcome::Nack => Ok(false),
            PingOutcome::Error => Err(CollaboratorError::Transport("ping failed".into())),
            PingOutcome::Hang => std::future::pending().await,
        }
    }

    async fn request_text_fallback(&self, session_id: &SessionId) -> CollaboratorResult<()> {
        self.calls.lock().push(TransportCall::TextFallback(session_id.clone()));
        Ok(())
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Persister whose every operation fails
#[derive(Debug, Default)]
pub struct FailingPersister {
    attempts: AtomicUsize,
}

impl FailingPersister {
    /// Creates the persister
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations attempted
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> CollaboratorResult<T> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(CollaboratorError::Storage("quota exceeded".into()))
    }
}

#[async_trait]
impl CheckpointPersister for FailingPersister {
    async fn save(&self, _key: &str, _value: &str) -> CollaboratorResult<()> {
        self.fail()
    }

    async fn load(&self, _key: &str) -> CollaboratorResult<Option<String>> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> CollaboratorResult<()> {
        self.fail()
    }
}

/// In-memory persister whose saves can be parked mid-write
#[derive(Debug, Default)]
pub struct GatedPersister {
    entries: DashMap<String, String>,
    save_gate: Mutex<Option<Arc<Gate>>>,
    saves: AtomicUsize,
}

impl GatedPersister {
    /// Creates an empty persister with saves flowing
    pub fn new() -> Self {
        Self::default()
    }

    /// Parks every later save until the returned gate opens
    pub fn hold_saves(&self) -> Arc<Gate> {
        let gate = Arc::new(Gate::closed());
        *self.save_gate.lock() = Some(gate.clone());
        gate
    }

    /// Saves started, including parked ones
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// True when a value is stored under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl CheckpointPersister for GatedPersister {
    async fn save(&self, key: &str, value: &str) -> CollaboratorResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let gate = self.save_gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn load(&self, key: &str) -> CollaboratorResult<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    async fn delete(&self, key: &str) -> CollaboratorResult<()> {
        self.entries.remove(key);
        Ok(())
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Records delivered notifications
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    delivered: Mutex<Vec<UserNotification>>,
    failure: Mutex<Option<String>>,
}

impl RecordingNotificationSink {
    /// Creates an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every following notification
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.lock() = Some(reason.into());
    }

    /// Notifications delivered so far
    pub fn notifications(&self) -> Vec<UserNotification> {
        self.delivered.lock().clone()
    }

    /// Delivered notifications of one type
    pub fn count(&self, kind: NotificationType) -> usize {
        self.delivered.lock().iter().filter(|n| n.kind == kind).count()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn notify(&self, notification: UserNotification) -> CollaboratorResult<()> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(CollaboratorError::Unavailable(reason));
        }
        self.delivered.lock().push(notification);
        Ok(())
    }
}

/// Records escalation records
#[derive(Debug, Default)]
pub struct RecordingDiagnostics {
    records: Mutex<Vec<EscalationRecord>>,
}

impl RecordingDiagnostics {
    /// Creates an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Records received so far
    pub fn records(&self) -> Vec<EscalationRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl DiagnosticsSink for RecordingDiagnostics {
    async fn report_escalation(&self, record: EscalationRecord) -> CollaboratorResult<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

// ============================================================================
// Mock Environment
// ============================================================================

/// One of each collaborator double, shared through `Arc`s
#[derive(Debug, Clone, Default)]
pub struct MockEnvironment {
    /// Session state provider
    pub provider: Arc<MockSessionProvider>,
    /// Restoration sink
    pub restorer: Arc<RecordingRestorer>,
    /// Transport control
    pub transport: Arc<ScriptedTransport>,
    /// Notification sink
    pub notifications: Arc<RecordingNotificationSink>,
    /// Diagnostics sink
    pub diagnostics: Arc<RecordingDiagnostics>,
}

impl MockEnvironment {
    /// Creates fresh doubles
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers session state with the provider
    pub fn with_session(self, session_id: impl Into<SessionId>, snapshot: SessionSnapshot) -> Self {
        self.provider.set_state(&session_id.into(), snapshot);
        self
    }
}

// ============================================================================
// Property-Based Testing Strategies
// ============================================================================

/// Backoff settings within realistic bounds
pub fn arb_backoff_config() -> impl Strategy<Value = BackoffConfig> {
    (1u64..=5_000, 1u64..=20, 1.0f64..4.0, 1u32..=12, 0.0f64..=0.5).prop_map(
        |(initial_ms, ceiling_factor, multiplier, attempts, jitter)| {
            BackoffConfig::new()
                .with_initial_delay(Duration::from_millis(initial_ms))
                .with_max_delay(Duration::from_millis(initial_ms * ceiling_factor))
                .with_multiplier(multiplier)
                .with_max_attempts(attempts)
                .with_jitter(jitter)
        },
    )
}

/// Timestamps between 2020 and 2030
pub fn arb_timestamp() -> impl Strategy<Value = DateTime<Utc>> {
    (1_577_836_800i64..1_893_456_000i64, 0u32..1_000_000_000u32)
        .prop_filter_map("valid timestamp", |(secs, nanos)| {
            Utc.timestamp_opt(secs, nanos).single()
        })
}

/// Arbitrary learning progress
pub fn arb_session_progress() -> impl Strategy<Value = SessionProgress> {
    (
        "[a-z]{3,12}",
        prop::collection::vec("[a-z]{3,12}", 0..6),
        0u32..500,
        0u64..36_000,
        arb_timestamp(),
        prop::collection::btree_map("[a-z_]{3,16}", 0u64..10_000, 0..4),
    )
        .prop_map(
            |(current_topic, completed_topics, questions_answered, total_duration_secs, last_activity, counters)| {
                SessionProgress {
                    current_topic,
                    completed_topics,
                    questions_answered,
                    total_duration_secs,
                    last_activity,
                    counters,
                }
            },
        )
}

/// Arbitrary transport health
pub fn arb_voice_state() -> impl Strategy<Value = VoiceSessionState> {
    let quality = prop_oneof![
        Just(ConnectionQuality::Excellent),
        Just(ConnectionQuality::Good),
        Just(ConnectionQuality::Poor),
        Just(ConnectionQuality::Disconnected),
    ];
    let buffer = prop_oneof![
        Just(BufferHealth::Healthy),
        Just(BufferHealth::Degraded),
        Just(BufferHealth::Critical),
    ];
    (
        any::<bool>(),
        any::<bool>(),
        prop::option::of(arb_timestamp()),
        quality,
        arb_timestamp(),
        0u32..10,
        buffer,
    )
        .prop_map(
            |(is_active, is_recording, last_audio_at, connection_quality, last_stable_connection, reconnection_attempts, buffer_health)| {
                VoiceSessionState {
                    is_active,
                    is_recording,
                    last_audio_at,
                    connection_quality,
                    last_stable_connection,
                    reconnection_attempts,
                    buffer_health,
                }
            },
        )
}

/// Arbitrary session snapshot with a non-empty student id
pub fn arb_session_snapshot() -> impl Strategy<Value = SessionSnapshot> {
    ("student-[0-9]{1,6}", "[a-z]{3,12}", arb_session_progress(), arb_voice_state()).prop_map(
        |(student_id, topic, progress, voice_state)| SessionSnapshot {
            student_id,
            topic,
            progress,
            voice_state,
        },
    )
}

// ============================================================================
// Tests
// ============================================================================
