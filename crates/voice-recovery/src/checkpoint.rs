//! Checkpoint store
//!
//! Keeps the latest [`SessionCheckpoint`] per session in memory and mirrors
//! it to an optional durable side-channel. Durable writes are best-effort:
//! a failing persister is logged and otherwise ignored.

use crate::persist::checkpoint_key;
use dashmap::{DashMap, DashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use voice_recovery_error::{RecoveryError, Result};
use voice_recovery_traits::{
    CheckpointPersister, SessionCheckpoint, SessionId, SessionRestorer, SessionStateProvider,
};

/// Latest-snapshot-wins checkpoint store
pub struct CheckpointStore {
    checkpoints: DashMap<SessionId, SessionCheckpoint>,
    tracked: DashSet<SessionId>,
    state_provider: Arc<dyn SessionStateProvider>,
    restorer: Arc<dyn SessionRestorer>,
    persister: Option<Arc<dyn CheckpointPersister>>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("checkpoints", &self.checkpoints.len())
            .field("tracked", &self.tracked.len())
            .field("durable", &self.persister.is_some())
            .finish()
    }
}

impl CheckpointStore {
    /// Creates a store; without a persister checkpoints live in memory only
    pub fn new(
        state_provider: Arc<dyn SessionStateProvider>,
        restorer: Arc<dyn SessionRestorer>,
        persister: Option<Arc<dyn CheckpointPersister>>,
    ) -> Self {
        Self {
            checkpoints: DashMap::new(),
            tracked: DashSet::new(),
            state_provider,
            restorer,
            persister,
        }
    }

    /// Adds a session to the periodic sweep
    pub fn track(&self, session_id: &SessionId) {
        self.tracked.insert(session_id.clone());
    }

    /// Removes a session from the periodic sweep
    pub fn untrack(&self, session_id: &SessionId) {
        self.tracked.remove(session_id);
    }

    /// True when the session is swept
    pub fn is_tracked(&self, session_id: &SessionId) -> bool {
        self.tracked.contains(session_id)
    }

    /// Sessions currently swept
    pub fn tracked_sessions(&self) -> Vec<SessionId> {
        self.tracked.iter().map(|id| id.key().clone()).collect()
    }

    /// In-memory checkpoint for a session
    pub fn get(&self, session_id: &SessionId) -> Option<SessionCheckpoint> {
        self.checkpoints.get(session_id).map(|cp| cp.value().clone())
    }

    /// True when an in-memory checkpoint exists
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.checkpoints.contains_key(session_id)
    }

    /// Snapshots the session and stores it, replacing any older checkpoint.
    ///
    /// Only a failing state provider is reported; persistence never fails the call.
    pub async fn create_checkpoint(
        &self,
        session_id: &SessionId,
        error_count: u32,
    ) -> Result<SessionCheckpoint> {
        let checkpoint = self.capture(session_id, error_count).await?;
        self.store(checkpoint.clone()).await;
        debug!(session = %session_id, error_count, "Checkpoint created");
        Ok(checkpoint)
    }

    /// Checkpoints a tracked session.
    ///
    /// Returns `Ok(None)` when the session is untracked before the checkpoint
    /// lands; whatever was written for it in the meantime is discarded.
    pub async fn refresh_tracked(
        &self,
        session_id: &SessionId,
        error_count: u32,
    ) -> Result<Option<SessionCheckpoint>> {
        let checkpoint = self.capture(session_id, error_count).await?;
        if !self.is_tracked(session_id) {
            return Ok(None);
        }

        self.store(checkpoint.clone()).await;

        // Removal may have raced the durable write.
        if !self.is_tracked(session_id) {
            self.discard(session_id).await;
            return Ok(None);
        }
        Ok(Some(checkpoint))
    }

    async fn capture(&self, session_id: &SessionId, error_count: u32) -> Result<SessionCheckpoint> {
        let snapshot = self
            .state_provider
            .current_session_state(session_id)
            .await
            .map_err(|e| RecoveryError::SessionStateUnavailable(format!("{session_id}: {e}")))?;

        let recovery_attempts = self
            .checkpoints
            .get(session_id)
            .map(|cp| cp.recovery_attempts)
            .unwrap_or(0);

        Ok(SessionCheckpoint::from_snapshot(
            session_id.clone(),
            snapshot,
            error_count,
            recovery_attempts,
        ))
    }

    async fn store(&self, checkpoint: SessionCheckpoint) {
        let session_id = checkpoint.session_id.clone();
        self.checkpoints.insert(session_id, checkpoint.clone());
        self.persist(&checkpoint).await;
    }

    async fn persist(&self, checkpoint: &SessionCheckpoint) {
        let Some(persister) = &self.persister else {
            return;
        };

        let json = match serde_json::to_string(checkpoint) {
            Ok(json) => json,
            Err(e) => {
                warn!(session = %checkpoint.session_id, error = %e, "Failed to encode checkpoint");
                return;
            }
        };

        if let Err(e) = persister.save(&checkpoint_key(&checkpoint.session_id), &json).await {
            warn!(
                session = %checkpoint.session_id,
                error = %e,
                "Failed to persist checkpoint, keeping in-memory copy only"
            );
        }
    }

    /// Checkpoint from memory, falling back to the durable side-channel.
    ///
    /// A persisted checkpoint that cannot be decoded or belongs to another
    /// session is reported as [`RecoveryError::CheckpointCorrupted`].
    pub async fn get_or_load(&self, session_id: &SessionId) -> Result<Option<SessionCheckpoint>> {
        if let Some(cp) = self.get(session_id) {
            return Ok(Some(cp));
        }

        let Some(persister) = &self.persister else {
            return Ok(None);
        };

        let raw = match persister.load(&checkpoint_key(session_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(session = %session_id, error = %e, "Durable checkpoint lookup failed");
                return Ok(None);
            }
        };

        let checkpoint: SessionCheckpoint =
            serde_json::from_str(&raw).map_err(|e| RecoveryError::CheckpointCorrupted {
                session_id: session_id.to_string(),
                reason: format!("undecodable persisted checkpoint: {e}"),
            })?;
        validate(&checkpoint, session_id)?;

        info!(session = %session_id, "Loaded checkpoint from durable storage");
        self.checkpoints.insert(session_id.clone(), checkpoint.clone());
        Ok(Some(checkpoint))
    }

    /// Pushes the checkpoint back into the live session.
    ///
    /// On success the checkpoint's `recovery_attempts` is incremented and the
    /// updated checkpoint is stored and returned.
    pub async fn restore_checkpoint(&self, checkpoint: &SessionCheckpoint) -> Result<SessionCheckpoint> {
        validate(checkpoint, &checkpoint.session_id)?;

        self.restorer
            .restore_session(checkpoint.restore_payload())
            .await
            .map_err(|e| RecoveryError::RestorationFailed {
                session_id: checkpoint.session_id.to_string(),
                reason: e.to_string(),
            })?;

        let mut updated = checkpoint.clone();
        updated.recovery_attempts += 1;
        self.store(updated.clone()).await;

        info!(
            session = %updated.session_id,
            recovery_attempts = updated.recovery_attempts,
            "Checkpoint restored"
        );
        Ok(updated)
    }

    /// Drops the checkpoint from memory and durable storage and stops sweeping
    pub async fn remove(&self, session_id: &SessionId) {
        self.untrack(session_id);
        self.discard(session_id).await;
    }

    async fn discard(&self, session_id: &SessionId) {
        self.checkpoints.remove(session_id);

        if let Some(persister) = &self.persister {
            if let Err(e) = persister.delete(&checkpoint_key(session_id)).await {
                warn!(session = %session_id, error = %e, "Failed to delete persisted checkpoint");
            }
        }
    }

    /// Refreshes the checkpoint of every tracked session.
    ///
    /// Sessions removed while the sweep runs are skipped and leave nothing
    /// behind. Returns the number of checkpoints refreshed.
    pub async fn sweep(&self) -> usize {
        let mut refreshed = 0;
        for session_id in self.tracked_sessions() {
            if !self.is_tracked(&session_id) {
                continue;
            }

            let error_count = self
                .checkpoints
                .get(&session_id)
                .map(|cp| cp.error_count)
                .unwrap_or(0);

            match self.refresh_tracked(&session_id, error_count).await {
                Ok(Some(_)) => refreshed += 1,
                Ok(None) => debug!(session = %session_id, "Session cleaned up during sweep"),
                Err(e) => debug!(session = %session_id, error = %e, "Skipping checkpoint refresh"),
            }
        }
        refreshed
    }

    /// Spawns the periodic sweep; abort the handle to stop it
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let refreshed = self.sweep().await;
                debug!(refreshed, "Checkpoint sweep finished");
            }
        })
    }
}

/// Rejects checkpoints that cannot belong to `expected`
pub fn validate(checkpoint: &SessionCheckpoint, expected: &SessionId) -> Result<()> {
    let corrupted = |reason: &str| RecoveryError::CheckpointCorrupted {
        session_id: expected.to_string(),
        reason: reason.to_string(),
    };

    if checkpoint.session_id.as_str().is_empty() {
        return Err(corrupted("empty session id"));
    }
    if &checkpoint.session_id != expected {
        return Err(corrupted("session id mismatch"));
    }
    if checkpoint.student_id.is_empty() {
        return Err(corrupted("empty student id"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemoryPersister;
    use voice_recovery_testing::{
        sample_snapshot, FailingPersister, GatedPersister, MockSessionProvider, RecordingRestorer,
    };
    use voice_recovery_traits::CheckpointPersister as _;

    struct Fixture {
        provider: Arc<MockSessionProvider>,
        restorer: Arc<RecordingRestorer>,
        persister: Arc<MemoryPersister>,
        store: Arc<CheckpointStore>,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(MockSessionProvider::new());
        let restorer = Arc::new(RecordingRestorer::new());
        let persister = Arc::new(MemoryPersister::new());
        let store = Arc::new(CheckpointStore::new(
            provider.clone(),
            restorer.clone(),
            Some(persister.clone()),
        ));
        Fixture {
            provider,
            restorer,
            persister,
            store,
        }
    }

    #[tokio::test]
    async fn test_create_checkpoint_stores_and_persists() {
        let fx = fixture();
        let id = SessionId::new("s1");
        fx.provider.set_state(&id, sample_snapshot("student-1", "fractions"));

        let cp = fx.store.create_checkpoint(&id, 2).await.unwrap();
        assert_eq!(cp.error_count, 2);
        assert_eq!(fx.store.get(&id), Some(cp));
        assert!(fx.persister.contains("voice_checkpoint_s1"));
    }

    #[tokio::test]
    async fn test_newer_checkpoint_overwrites_older() {
        let fx = fixture();
        let id = SessionId::new("s1");
        fx.provider.set_state(&id, sample_snapshot("student-1", "fractions"));
        fx.store.create_checkpoint(&id, 0).await.unwrap();

        fx.provider.set_state(&id, sample_snapshot("student-1", "decimals"));
        fx.store.create_checkpoint(&id, 0).await.unwrap();

        assert_eq!(fx.store.get(&id).unwrap().topic, "decimals");
        assert_eq!(fx.persister.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_session_state_is_reported() {
        let fx = fixture();
        let err = fx.store.create_checkpoint(&SessionId::new("ghost"), 0).await.unwrap_err();
        assert!(matches!(err, RecoveryError::SessionStateUnavailable(_)));
    }

    #[tokio::test]
    async fn test_persistence_failure_is_swallowed() {
        let provider = Arc::new(MockSessionProvider::new());
        let store = CheckpointStore::new(
            provider.clone(),
            Arc::new(RecordingRestorer::new()),
            Some(Arc::new(FailingPersister::new())),
        );
        let id = SessionId::new("s1");
        provider.set_state(&id, sample_snapshot("student-1", "fractions"));

        assert!(store.create_checkpoint(&id, 0).await.is_ok());
        assert!(store.contains(&id));
    }

    #[tokio::test]
    async fn test_restore_roundtrip_reproduces_payload() {
        let fx = fixture();
        let id = SessionId::new("s1");
        let snapshot = sample_snapshot("student-1", "fractions");
        fx.provider.set_state(&id, snapshot.clone());

        let cp = fx.store.create_checkpoint(&id, 0).await.unwrap();
        let restored = fx.store.restore_checkpoint(&cp).await.unwrap();

        let payloads = fx.restorer.payloads();
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].resume_from_checkpoint);
        assert_eq!(payloads[0].progress, snapshot.progress);
        assert_eq!(payloads[0].voice_state, snapshot.voice_state);
        assert_eq!(restored.recovery_attempts, 1);
        assert_eq!(fx.store.get(&id).unwrap().recovery_attempts, 1);
    }

    #[tokio::test]
    async fn test_restore_failure_maps_to_restoration_failed() {
        let fx = fixture();
        let id = SessionId::new("s1");
        fx.provider.set_state(&id, sample_snapshot("student-1", "fractions"));
        let cp = fx.store.create_checkpoint(&id, 0).await.unwrap();

        fx.restorer.fail_with("live session gone");
        let err = fx.store.restore_checkpoint(&cp).await.unwrap_err();
        assert!(matches!(err, RecoveryError::RestorationFailed { .. }));
        assert_eq!(fx.store.get(&id).unwrap().recovery_attempts, 0);
    }

    #[tokio::test]
    async fn test_invalid_checkpoint_is_corrupted() {
        let fx = fixture();
        let id = SessionId::new("s1");
        fx.provider.set_state(&id, sample_snapshot("", "fractions"));
        let cp = fx.store.create_checkpoint(&id, 0).await.unwrap();

        let err = fx.store.restore_checkpoint(&cp).await.unwrap_err();
        assert!(matches!(err, RecoveryError::CheckpointCorrupted { .. }));
        assert!(fx.restorer.payloads().is_empty());
    }

    #[tokio::test]
    async fn test_get_or_load_reads_durable_copy() {
        let fx = fixture();
        let id = SessionId::new("s1");
        fx.provider.set_state(&id, sample_snapshot("student-1", "fractions"));
        let cp = fx.store.create_checkpoint(&id, 0).await.unwrap();

        // A fresh store over the same durable backend simulates a reload.
        let reloaded = CheckpointStore::new(
            fx.provider.clone(),
            fx.restorer.clone(),
            Some(fx.persister.clone()),
        );
        assert_eq!(reloaded.get(&id), None);
        assert_eq!(reloaded.get_or_load(&id).await.unwrap(), Some(cp));
        assert!(reloaded.contains(&id));
    }

    #[tokio::test]
    async fn test_get_or_load_rejects_garbage() {
        let fx = fixture();
        fx.persister.save("voice_checkpoint_s1", "{not json").await.unwrap();

        let err = fx.store.get_or_load(&SessionId::new("s1")).await.unwrap_err();
        assert!(matches!(err, RecoveryError::CheckpointCorrupted { .. }));
    }

    #[tokio::test]
    async fn test_remove_clears_everything() {
        let fx = fixture();
        let id = SessionId::new("s1");
        fx.provider.set_state(&id, sample_snapshot("student-1", "fractions"));
        fx.store.track(&id);
        fx.store.create_checkpoint(&id, 0).await.unwrap();

        fx.store.remove(&id).await;
        assert!(!fx.store.contains(&id));
        assert!(!fx.store.is_tracked(&id));
        assert!(fx.persister.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_refreshes_tracked_and_skips_failures() {
        let fx = fixture();
        let live = SessionId::new("live");
        let gone = SessionId::new("gone");
        fx.provider.set_state(&live, sample_snapshot("student-1", "fractions"));
        fx.store.track(&live);
        fx.store.track(&gone);

        assert_eq!(fx.store.sweep().await, 1);
        assert!(fx.store.contains(&live));
        assert!(!fx.store.contains(&gone));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_runs_on_interval() {
        let fx = fixture();
        let id = SessionId::new("s1");
        fx.provider.set_state(&id, sample_snapshot("student-1", "fractions"));
        fx.store.track(&id);

        let handle = fx.store.clone().spawn_sweeper(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!fx.store.contains(&id));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(fx.store.contains(&id));
        handle.abort();
    }

    fn gated_store() -> (Arc<MockSessionProvider>, Arc<GatedPersister>, Arc<CheckpointStore>) {
        let provider = Arc::new(MockSessionProvider::new());
        let persister = Arc::new(GatedPersister::new());
        let store = Arc::new(CheckpointStore::new(
            provider.clone(),
            Arc::new(RecordingRestorer::new()),
            Some(persister.clone()),
        ));
        (provider, persister, store)
    }

    #[tokio::test]
    async fn test_refresh_tracked_skips_untracked_sessions() {
        let fx = fixture();
        let id = SessionId::new("s1");
        fx.provider.set_state(&id, sample_snapshot("student-1", "fractions"));

        assert_eq!(fx.store.refresh_tracked(&id, 0).await.unwrap(), None);
        assert!(!fx.store.contains(&id));
        assert!(fx.persister.is_empty());

        fx.store.track(&id);
        assert!(fx.store.refresh_tracked(&id, 0).await.unwrap().is_some());
        assert!(fx.store.contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_tolerates_removal_during_capture() {
        let (provider, persister, store) = gated_store();
        let id = SessionId::new("s1");
        provider.set_state(&id, sample_snapshot("student-1", "fractions"));
        store.track(&id);
        let gate = provider.hold(&id);

        let sweep = tokio::spawn({
            let store = store.clone();
            async move { store.sweep().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(provider.reads(), 1);

        store.remove(&id).await;
        gate.open();

        assert_eq!(sweep.await.unwrap(), 0);
        assert!(!store.contains(&id));
        assert_eq!(persister.saves(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_tolerates_removal_during_durable_write() {
        let (provider, persister, store) = gated_store();
        let id = SessionId::new("s1");
        provider.set_state(&id, sample_snapshot("student-1", "fractions"));
        store.track(&id);
        let gate = persister.hold_saves();

        let sweep = tokio::spawn({
            let store = store.clone();
            async move { store.sweep().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(persister.saves(), 1);

        // The delete lands before the parked write completes.
        store.remove(&id).await;
        gate.open();

        assert_eq!(sweep.await.unwrap(), 0);
        assert!(!store.contains(&id));
        assert!(!store.is_tracked(&id));
        assert!(!persister.contains(&checkpoint_key(&id)));
    }
}
