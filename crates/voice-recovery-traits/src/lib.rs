//! # Voice Recovery Traits
//!
//! Session data model and collaborator traits for the voice session
//! recovery subsystem. The recovery core never owns canonical session state;
//! it reads it, snapshots it and pushes it back through the traits defined
//! here.
//!
//! ## Collaborators
//!
//! - [`SessionStateProvider`] - read access to canonical session data
//! - [`SessionRestorer`] - applies a checkpoint back to the live session
//! - [`TransportControl`] - outbound commands to the realtime transport
//! - [`CheckpointPersister`] - durable key-value side-channel
//! - [`NotificationSink`] - user-facing notifications
//! - [`DiagnosticsSink`] - escalation records for monitoring
//!
//! ## Example
//!
//! ```ignore
//! use voice_recovery_traits::prelude::*;
//!
//! async fn is_reachable<T: TransportControl>(transport: &T, id: &SessionId) -> bool {
//!     transport.ping(id).await.unwrap_or(false)
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of a voice session
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Creates a new SessionId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Link quality reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// No audible degradation
    Excellent,
    /// Minor jitter
    Good,
    /// Audible degradation
    Poor,
    /// No link
    Disconnected,
}

/// Health of the audio buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferHealth {
    /// Buffer within bounds
    Healthy,
    /// Underruns observed
    Degraded,
    /// Buffer starving
    Critical,
}

/// Transport health snapshot, updated by the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSessionState {
    /// Voice session is active
    pub is_active: bool,
    /// Microphone is recording
    pub is_recording: bool,
    /// Last time audio was received
    pub last_audio_at: Option<DateTime<Utc>>,
    /// Current link quality
    pub connection_quality: ConnectionQuality,
    /// Last time the link was known to be stable
    pub last_stable_connection: DateTime<Utc>,
    /// Reconnects attempted by the transport itself
    pub reconnection_attempts: u32,
    /// Audio buffer health
    pub buffer_health: BufferHealth,
}

impl VoiceSessionState {
    /// Returns true unless the transport reports no link
    pub fn is_connected(&self) -> bool {
        self.connection_quality != ConnectionQuality::Disconnected
    }
}

impl Default for VoiceSessionState {
    fn default() -> Self {
        Self {
            is_active: false,
            is_recording: false,
            last_audio_at: None,
            connection_quality: ConnectionQuality::Good,
            last_stable_connection: Utc::now(),
            reconnection_attempts: 0,
            buffer_health: BufferHealth::Healthy,
        }
    }
}

/// Cumulative learning progress.
///
/// Opaque to the recovery subsystem: preserved and restored, never interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    /// Topic currently being studied
    pub current_topic: String,
    /// Completed topics, in completion order
    pub completed_topics: Vec<String>,
    /// Questions answered so far
    pub questions_answered: u32,
    /// Total session duration in seconds
    pub total_duration_secs: u64,
    /// Last learner activity
    pub last_activity: DateTime<Utc>,
    /// Domain counters such as `problems_completed` or `voice_turns`
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
}

impl SessionProgress {
    /// Creates empty progress for a topic
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            current_topic: topic.into(),
            completed_topics: Vec::new(),
            questions_answered: 0,
            total_duration_secs: 0,
            last_activity: Utc::now(),
            counters: BTreeMap::new(),
        }
    }

    /// Appends a completed topic
    pub fn complete_topic(&mut self, topic: impl Into<String>) {
        self.completed_topics.push(topic.into());
    }

    /// Increments a domain counter
    pub fn increment(&mut self, counter: &str, by: u64) {
        *self.counters.entry(counter.to_string()).or_insert(0) += by;
    }
}

/// Current canonical state of a session, as read for checkpointing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Student owning the session
    pub student_id: String,
    /// Session topic
    pub topic: String,
    /// Learning progress
    pub progress: SessionProgress,
    /// Transport health
    pub voice_state: VoiceSessionState,
}

/// Immutable-at-creation snapshot of a session.
///
/// One checkpoint per session is retained; a newer one overwrites the older.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCheckpoint {
    /// Session id
    pub session_id: SessionId,
    /// Student owning the session
    pub student_id: String,
    /// Session topic
    pub topic: String,
    /// Learning progress
    pub progress: SessionProgress,
    /// Transport health at capture time
    pub voice_state: VoiceSessionState,
    /// Capture time
    pub timestamp: DateTime<Utc>,
    /// Last stable connection at capture time
    pub last_stable_connection: DateTime<Utc>,
    /// Errors seen for the session so far
    pub error_count: u32,
    /// Times this checkpoint has been restored
    pub recovery_attempts: u32,
}

impl SessionCheckpoint {
    /// Assembles a checkpoint from a state snapshot
    pub fn from_snapshot(
        session_id: SessionId,
        snapshot: SessionSnapshot,
        error_count: u32,
        recovery_attempts: u32,
    ) -> Self {
        Self {
            session_id,
            student_id: snapshot.student_id,
            topic: snapshot.topic,
            last_stable_connection: snapshot.voice_state.last_stable_connection,
            progress: snapshot.progress,
            voice_state: snapshot.voice_state,
            timestamp: Utc::now(),
            error_count,
            recovery_attempts,
        }
    }

    /// Builds the payload sent to the restoration sink
    pub fn restore_payload(&self) -> RestorePayload {
        RestorePayload {
            session_id: self.session_id.clone(),
            student_id: self.student_id.clone(),
            topic: self.topic.clone(),
            progress: self.progress.clone(),
            voice_state: self.voice_state.clone(),
            resume_from_checkpoint: true,
        }
    }
}

/// Payload applied to the live session on restoration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestorePayload {
    /// Session id
    pub session_id: SessionId,
    /// Student owning the session
    pub student_id: String,
    /// Session topic
    pub topic: String,
    /// Learning progress to restore
    pub progress: SessionProgress,
    /// Transport state to restore
    pub voice_state: VoiceSessionState,
    /// Always true for checkpoint restores
    pub resume_from_checkpoint: bool,
}

/// Inbound lifecycle signal from the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The realtime connection dropped
    ConnectionLost {
        /// Session id
        session_id: SessionId,
        /// Optional reason
        reason: Option<String>,
    },
    /// The realtime connection came back
    ConnectionRestored {
        /// Session id
        session_id: SessionId,
    },
    /// The transport reported a session error
    SessionError {
        /// Session id
        session_id: SessionId,
        /// Error message
        error: String,
    },
    /// Live session state is no longer trustworthy
    StateCorrupted {
        /// Session id
        session_id: SessionId,
        /// Optional error message
        error: Option<String>,
    },
}

impl LifecycleSignal {
    /// Returns the session this signal is addressed to
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::ConnectionLost { session_id, .. }
            | Self::ConnectionRestored { session_id }
            | Self::SessionError { session_id, .. }
            | Self::StateCorrupted { session_id, .. } => session_id,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionLost { .. } => "connection_lost",
            Self::ConnectionRestored { .. } => "connection_restored",
            Self::SessionError { .. } => "session_error",
            Self::StateCorrupted { .. } => "state_corrupted",
        }
    }
}

/// User-facing notification kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    /// Voice session resumed from checkpoint
    SessionRecovered,
    /// Voice gave up, continuing in text mode
    FallbackToText,
    /// Human support has been alerted
    EscalationRequired,
    /// First reconnect attempt under way
    ConnectionUnstable,
}

impl NotificationType {
    /// Wire name of the notification type
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionRecovered => "session_recovered",
            Self::FallbackToText => "fallback_to_text",
            Self::EscalationRequired => "escalation_required",
            Self::ConnectionUnstable => "connection_unstable",
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity attached to notifications and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational
    Info,
    /// Degraded but functional
    Warning,
    /// Needs human attention
    Error,
}

/// Notification delivered to the user-facing sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserNotification {
    /// Session id
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    /// Notification type
    #[serde(rename = "type")]
    pub kind: NotificationType,
    /// Summarized, user-readable message
    pub message: String,
    /// Structured extras for the UI
    pub data: serde_json::Value,
    /// When the notification was emitted
    pub timestamp: DateTime<Utc>,
    /// Severity
    pub severity: Severity,
}

/// High-severity record emitted on escalation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRecord {
    /// Session id
    pub session_id: SessionId,
    /// Technical error summary
    pub error: String,
    /// Reconnect attempts made in the current recovery
    pub retry_count: u32,
    /// Breaker state at escalation time
    pub circuit_breaker_open: bool,
    /// Latest checkpoint, if any
    pub checkpoint: Option<SessionCheckpoint>,
    /// Severity, always [`Severity::Error`] for escalations
    pub severity: Severity,
    /// When the escalation happened
    pub timestamp: DateTime<Utc>,
}

/// Errors returned by collaborators
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// Collaborator cannot be reached
    #[error("Unavailable: {0}")]
    Unavailable(String),

    /// Session is unknown to the collaborator
    #[error("Unknown session: {0}")]
    UnknownSession(SessionId),

    /// Collaborator refused the request
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Transport-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Storage-level failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Result type for collaborator operations
pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Read access to canonical session data
#[async_trait]
pub trait SessionStateProvider: Send + Sync {
    /// Returns the current state of a session
    async fn current_session_state(&self, session_id: &SessionId) -> CollaboratorResult<SessionSnapshot>;
}

/// Applies a checkpoint to the live session
#[async_trait]
pub trait SessionRestorer: Send + Sync {
    /// Restores the session from the payload
    async fn restore_session(&self, payload: RestorePayload) -> CollaboratorResult<()>;
}

/// Outbound commands to the realtime transport
#[async_trait]
pub trait TransportControl: Send + Sync {
    /// Asks the transport to re-establish the connection
    async fn request_reconnect(&self, session_id: &SessionId) -> CollaboratorResult<()>;

    /// Asks the transport to retry voice after a text fallback
    async fn request_retry(&self, session_id: &SessionId) -> CollaboratorResult<()>;

    /// Ping round-trip; `Ok(true)` when acknowledged
    async fn ping(&self, session_id: &SessionId) -> CollaboratorResult<bool>;

    /// Switches the session to text-only mode
    async fn request_text_fallback(&self, session_id: &SessionId) -> CollaboratorResult<()>;
}

/// Durable key-value side-channel for checkpoints
#[async_trait]
pub trait CheckpointPersister: Send + Sync {
    /// Stores a value under a key
    async fn save(&self, key: &str, value: &str) -> CollaboratorResult<()>;

    /// Loads a value, `None` when absent
    async fn load(&self, key: &str) -> CollaboratorResult<Option<String>>;

    /// Deletes a key; deleting an absent key is not an error
    async fn delete(&self, key: &str) -> CollaboratorResult<()>;
}

/// User-facing notification sink
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Delivers a notification
    async fn notify(&self, notification: UserNotification) -> CollaboratorResult<()>;
}

/// Monitoring sink for escalations
#[async_trait]
pub trait DiagnosticsSink: Send + Sync {
    /// Records an escalation
    async fn report_escalation(&self, record: EscalationRecord) -> CollaboratorResult<()>;
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        BufferHealth, CheckpointPersister, CollaboratorError, CollaboratorResult,
        ConnectionQuality, DiagnosticsSink, EscalationRecord, LifecycleSignal,
        NotificationSink, NotificationType, RestorePayload, SessionCheckpoint, SessionId,
        SessionProgress, SessionRestorer, SessionSnapshot, SessionStateProvider, Severity,
        TransportControl, UserNotification, VoiceSessionState,
    };
}
