//! Sources of desired state.

use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use rolesync_core::{parse_desired_yaml, DesiredState, Error, Result, UserSpec};
use tokio::sync::RwLock;

/// State provider trait for getting desired state.
#[async_trait]
pub trait DesiredStateProvider: Send + Sync {
    /// Get the current desired state.
    ///
    /// Fails with `SpecUnavailable` when the source cannot be read and
    /// `InvalidSpec` when it is malformed.
    async fn desired_state(&self) -> Result<DesiredState>;
}

/// Reads a `users.yaml` document on every call.
pub struct YamlFileProvider {
    path: PathBuf,
    default_database: String,
}

impl YamlFileProvider {
    /// `default_database` is used for entries without a `database` key.
    pub fn new(path: impl Into<PathBuf>, default_database: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            default_database: default_database.into(),
        }
    }
}

#[async_trait]
impl DesiredStateProvider for YamlFileProvider {
    async fn desired_state(&self) -> Result<DesiredState> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| match e.kind() {
                IoErrorKind::NotFound => Error::spec_unavailable(format!(
                    "{} does not exist",
                    self.path.display()
                )),
                _ => Error::spec_unavailable(format!("cannot read {}: {e}", self.path.display())),
            })?;

        parse_desired_yaml(&content, &self.default_database)
    }
}

/// Simple in-memory desired state provider.
pub struct InMemoryDesiredStateProvider {
    specs: RwLock<Result<Vec<UserSpec>>>,
}

impl InMemoryDesiredStateProvider {
    /// Create a new provider with initial users.
    #[must_use]
    pub fn new(specs: Vec<UserSpec>) -> Self {
        Self {
            specs: RwLock::new(Ok(specs)),
        }
    }

    /// Replace the desired users.
    pub async fn update(&self, specs: Vec<UserSpec>) {
        *self.specs.write().await = Ok(specs);
    }

    /// Make the provider fail until the next [`update`](Self::update).
    pub async fn fail_with(&self, error: Error) {
        *self.specs.write().await = Err(error);
    }
}

#[async_trait]
impl DesiredStateProvider for InMemoryDesiredStateProvider {
    async fn desired_state(&self) -> Result<DesiredState> {
        let specs = self.specs.read().await.clone()?;
        DesiredState::from_specs(specs)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_spec_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let provider = YamlFileProvider::new(dir.path().join("users.yaml"), "postgres");

        let result = provider.desired_state().await;
        assert!(matches!(result, Err(Error::SpecUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_reads_users_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yaml");
        std::fs::write(&path, "users:\n  - username: bob\n    roles: [writer]\n").unwrap();

        let provider = YamlFileProvider::new(path, "app");
        let desired = provider.desired_state().await.unwrap();
        assert_eq!(desired.get("bob").map(|u| u.database.as_str()), Some("app"));
    }

    #[tokio::test]
    async fn test_in_memory_provider_validates_and_updates() {
        let provider = InMemoryDesiredStateProvider::new(Vec::new());
        assert!(provider.desired_state().await.is_ok_and(|d| d.is_empty()));

        provider
            .update(vec![UserSpec::new("bob", "app"), UserSpec::new("bob", "app")])
            .await;
        assert!(matches!(
            provider.desired_state().await,
            Err(Error::InvalidSpec { .. })
        ));

        provider.fail_with(Error::spec_unavailable("configmap gone")).await;
        assert!(matches!(
            provider.desired_state().await,
            Err(Error::SpecUnavailable { .. })
        ));
    }
}
