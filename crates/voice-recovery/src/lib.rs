//! # Voice Recovery
//!
//! Keeps realtime voice tutoring sessions alive across network loss,
//! transport errors and state corruption.
//!
//! - **Checkpointing**: periodic and on-loss snapshots, mirrored to a durable side-channel
//! - **Reconnection**: exponential backoff with jitter, verified by a bounded ping
//! - **Circuit breaking**: per-session latch that short-circuits straight to fallback
//! - **Degradation**: text-mode fallback, then escalation to human support
//! - **Notifications & metrics**: debounced user notifications and atomic counters
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use voice_recovery::prelude::*;
//!
//! let orchestrator = RecoveryOrchestrator::new(
//!     RecoveryConfig::load("recovery.json")?,
//!     Collaborators {
//!         state_provider: Arc::new(my_sessions),
//!         restorer: Arc::new(my_sessions),
//!         transport: Arc::new(my_transport),
//!         persister: Some(Arc::new(FilePersister::new("/var/lib/tutor/checkpoints"))),
//!         notifications: Arc::new(my_ui),
//!         diagnostics: Arc::new(my_monitoring),
//!     },
//! )?;
//!
//! let signals = orchestrator.start();
//! signals
//!     .send(LifecycleSignal::ConnectionLost { session_id: "s1".into(), reason: None })
//!     .await?;
//!
//! // on host shutdown
//! orchestrator.shutdown();
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod persist;

pub use checkpoint::CheckpointStore;
pub use config::{RecoveryConfig, JITTER_FACTOR, MAX_COOLDOWN_MULTIPLIER};
pub use metrics::{MetricsSnapshot, RecoveryMetrics};
pub use notify::Notifier;
pub use orchestrator::{Collaborators, RecoveryOrchestrator, RecoveryState, SIGNAL_BUFFER};
pub use persist::{checkpoint_key, FilePersister, MemoryPersister};

pub use voice_recovery_error::{RecoveryError, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        Collaborators, FilePersister, MemoryPersister, MetricsSnapshot, RecoveryConfig,
        RecoveryError, RecoveryOrchestrator, RecoveryState,
    };
    pub use voice_recovery_traits::prelude::*;
}
