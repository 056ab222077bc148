//! Persistence of the last applied snapshot.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rolesync_core::{AppliedSnapshot, Error, Result};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Storage for the [`AppliedSnapshot`].
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the last snapshot; empty if none was ever saved.
    async fn load(&self) -> Result<AppliedSnapshot>;

    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &AppliedSnapshot) -> Result<()>;
}

/// JSON document on the local filesystem.
///
/// Saves write a sibling temp file and rename it over the target.
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(std::ffi::OsStr::to_os_string)
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl StateStore for JsonFileStateStore {
    async fn load(&self) -> Result<AppliedSnapshot> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No applied snapshot yet");
                return Ok(AppliedSnapshot::new());
            }
            Err(e) => {
                return Err(Error::state_store_unavailable(format!(
                    "cannot read {}: {e}",
                    self.path.display()
                )));
            }
        };

        match serde_json::from_str(&content) {
            Ok(snapshot) => Ok(snapshot),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Applied snapshot is corrupt, starting without one"
                );
                Ok(AppliedSnapshot::new())
            }
        }
    }

    async fn save(&self, snapshot: &AppliedSnapshot) -> Result<()> {
        let content = serde_json::to_string_pretty(snapshot)
            .map_err(|e| Error::state_store_unavailable(format!("cannot encode snapshot: {e}")))?;

        let temp = self.temp_path();
        tokio::fs::write(&temp, content).await.map_err(|e| {
            Error::state_store_unavailable(format!("cannot write {}: {e}", temp.display()))
        })?;
        tokio::fs::rename(&temp, &self.path).await.map_err(|e| {
            Error::state_store_unavailable(format!(
                "cannot move {} into place: {e}",
                temp.display()
            ))
        })?;

        debug!(path = %self.path.display(), users = snapshot.len(), "Saved applied snapshot");
        Ok(())
    }
}

/// Snapshot held in memory.
#[derive(Default)]
pub struct InMemoryStateStore {
    snapshot: RwLock<Option<AppliedSnapshot>>,
    fail_saves: RwLock<bool>,
}

impl InMemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing snapshot.
    #[must_use]
    pub fn with_snapshot(snapshot: AppliedSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Some(snapshot)),
            fail_saves: RwLock::new(false),
        }
    }

    /// The last saved snapshot, if any.
    pub async fn snapshot(&self) -> Option<AppliedSnapshot> {
        self.snapshot.read().await.clone()
    }

    /// Make every following save fail.
    pub async fn fail_saves(&self, fail: bool) {
        *self.fail_saves.write().await = fail;
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self) -> Result<AppliedSnapshot> {
        Ok(self.snapshot.read().await.clone().unwrap_or_default())
    }

    async fn save(&self, snapshot: &AppliedSnapshot) -> Result<()> {
        if *self.fail_saves.read().await {
            return Err(Error::state_store_unavailable("store is read-only"));
        }
        *self.snapshot.write().await = Some(snapshot.clone());
        Ok(())
    }
}
