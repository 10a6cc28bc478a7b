//! # Voice Recovery Error
//!
//! Unified error types for the voice session recovery subsystem. Every
//! failure the recovery crates can observe is folded into [`RecoveryError`]
//! so the orchestrator can decide, in one place, whether it becomes a retry,
//! a text-mode fallback or an escalation.
//!
//! ## Error Categories
//!
//! - Retry and breaker gating ([`RecoveryError::RetryExhausted`], [`RecoveryError::CircuitOpen`])
//! - Checkpoint and restoration failures
//! - Transport failures (reconnect, stability check)
//! - Persistence, serialization and configuration errors
//!
//! ## Example
//!
//! ```
//! use voice_recovery_error::{RecoveryError, Result};
//!
//! fn require_student(student_id: &str) -> Result<()> {
//!     if student_id.is_empty() {
//!         return Err(RecoveryError::CheckpointCorrupted {
//!             session_id: "s-1".to_string(),
//!             reason: "empty student id".to_string(),
//!         });
//!     }
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use thiserror::Error;

/// The main error type for voice recovery operations.
#[derive(Error, Debug)]
pub enum RecoveryError {
    // ============ Retry Gating ============
    /// Backoff attempts exhausted
    #[error("Retry exhausted after {attempts} attempts")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// Circuit breaker is open for the session
    #[error("Circuit open for session {session_id}, retry after {retry_after_ms}ms")]
    CircuitOpen {
        /// Session the breaker belongs to
        session_id: String,
        /// Remaining cooldown in milliseconds
        retry_after_ms: u64,
    },

    // ============ Checkpoint Errors ============
    /// No checkpoint exists for the session
    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    /// Checkpoint failed validation
    #[error("Checkpoint for session {session_id} is corrupted: {reason}")]
    CheckpointCorrupted {
        /// Session id
        session_id: String,
        /// Why the checkpoint was rejected
        reason: String,
    },

    /// Restoration sink rejected the snapshot
    #[error("Restoration failed for session {session_id}: {reason}")]
    RestorationFailed {
        /// Session id
        session_id: String,
        /// Error reason
        reason: String,
    },

    /// Canonical session state could not be read
    #[error("Session state unavailable: {0}")]
    SessionStateUnavailable(String),

    // ============ Transport Errors ============
    /// Reconnect request failed
    #[error("Reconnect failed: {0}")]
    ReconnectFailed(String),

    /// Ping was answered negatively
    #[error("Stability check failed: {0}")]
    StabilityCheckFailed(String),

    /// Ping was not answered in time
    #[error("Stability check timed out after {millis}ms")]
    StabilityCheckTimeout {
        /// Timeout in milliseconds
        millis: u64,
    },

    /// Other transport-layer failure
    #[error("Transport error: {0}")]
    Transport(String),

    // ============ Storage / Config ============
    /// Durable side-channel failure
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// JSON encode/decode error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// File IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ============ Generic ============
    /// Unknown/other error
    #[error("{0}")]
    Other(String),

    /// Wrapped error from external source
    #[error("External error: {message}")]
    External {
        /// Error message
        message: String,
    },
}

/// Convenient Result type using RecoveryError
pub type Result<T> = std::result::Result<T, RecoveryError>;

/// Extension trait for adding context to errors
pub trait ErrorContext<T> {
    /// Adds context to an error
    fn context(self, ctx: impl Into<String>) -> Result<T>;

    /// Adds context using a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::error::Error> ErrorContext<T> for std::result::Result<T, E> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.map_err(|e| RecoveryError::External {
            message: format!("{}: {}", ctx.into(), e),
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| RecoveryError::External {
            message: format!("{}: {}", f(), e),
        })
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, ctx: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| RecoveryError::Other(ctx.into()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| RecoveryError::Other(f()))
    }
}

// ============ From implementations for common error types ============

impl From<std::io::Error> for RecoveryError {
    fn from(err: std::io::Error) -> Self {
        RecoveryError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RecoveryError {
    fn from(err: serde_json::Error) -> Self {
        RecoveryError::Serialization(err.to_string())
    }
}

/// Error codes for programmatic error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Unknown error
    Unknown = 0,
    /// Retry exhausted
    RetryExhausted = 1001,
    /// Circuit open
    CircuitOpen = 1002,
    /// Checkpoint not found
    CheckpointNotFound = 2001,
    /// Checkpoint corrupted
    CheckpointCorrupted = 2002,
    /// Restoration failed
    RestorationFailed = 2003,
    /// Session state unavailable
    SessionStateUnavailable = 2004,
    /// Reconnect failed
    ReconnectFailed = 3001,
    /// Stability check failed
    StabilityCheckFailed = 3002,
    /// Stability check timed out
    StabilityCheckTimeout = 3003,
    /// Transport error
    Transport = 3004,
    /// Persistence error
    Persistence = 4001,
    /// Serialization error
    Serialization = 4002,
    /// Configuration error
    Config = 9001,
}

impl RecoveryError {
    /// Returns the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            RecoveryError::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            RecoveryError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            RecoveryError::CheckpointNotFound(_) => ErrorCode::CheckpointNotFound,
            RecoveryError::CheckpointCorrupted { .. } => ErrorCode::CheckpointCorrupted,
            RecoveryError::RestorationFailed { .. } => ErrorCode::RestorationFailed,
            RecoveryError::SessionStateUnavailable(_) => ErrorCode::SessionStateUnavailable,
            RecoveryError::ReconnectFailed(_) => ErrorCode::ReconnectFailed,
            RecoveryError::StabilityCheckFailed(_) => ErrorCode::StabilityCheckFailed,
            RecoveryError::StabilityCheckTimeout { .. } => ErrorCode::StabilityCheckTimeout,
            RecoveryError::Transport(_) => ErrorCode::Transport,
            RecoveryError::Persistence(_) => ErrorCode::Persistence,
            RecoveryError::Serialization(_) => ErrorCode::Serialization,
            RecoveryError::Config(_) => ErrorCode::Config,
            _ => ErrorCode::Unknown,
        }
    }

    /// Returns true for transient transport failures handled by the backoff loop
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RecoveryError::ReconnectFailed(_)
                | RecoveryError::StabilityCheckFailed(_)
                | RecoveryError::StabilityCheckTimeout { .. }
                | RecoveryError::Transport(_)
        )
    }

    /// Returns true when the failure should go straight to escalation
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RecoveryError::CheckpointNotFound(_)
                | RecoveryError::CheckpointCorrupted { .. }
                | RecoveryError::RestorationFailed { .. }
        )
    }
}
