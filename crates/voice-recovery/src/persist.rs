//! Durable side-channel backends for checkpoints

use async_trait::async_trait;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use voice_recovery_traits::{CheckpointPersister, CollaboratorError, CollaboratorResult, SessionId};

/// Key under which a session's checkpoint is persisted
pub fn checkpoint_key(session_id: &SessionId) -> String {
    format!("voice_checkpoint_{}", session_id)
}

/// In-process key-value store
#[derive(Debug, Default)]
pub struct MemoryPersister {
    entries: DashMap<String, String>,
}

impl MemoryPersister {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the key is present
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }
}

#[async_trait]
impl CheckpointPersister for MemoryPersister {
    async fn save(&self, key: &str, value: &str) -> CollaboratorResult<()> {
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

/// One JSON file per key under a directory
#[derive(Debug, Clone)]
pub struct FilePersister {
    dir: PathBuf,
}

impl FilePersister {
    /// Uses `dir`, creating it on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> CollaboratorResult<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            return Err(CollaboratorError::Storage(format!("invalid key: {key}")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }
}

fn storage_err(err: std::io::Error) -> CollaboratorError {
    CollaboratorError::Storage(err.to_string())
}

#[async_trait]
impl CheckpointPersister for FilePersister {
    async fn save(&self, key: &str, value: &str) -> CollaboratorResult<()> {
        let path = self.path_for(key)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(storage_err)?;

        // Write-then-rename so a crash never leaves a half-written checkpoint.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, value).await.map_err(storage_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(storage_err)
    }

    async fn load(&self, key: &str) -> CollaboratorResult<Option<String>> {
        let path = self.path_for(key)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }

    async fn delete(&self, key: &str) -> CollaboratorResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err(e)),
        }
    }
}
