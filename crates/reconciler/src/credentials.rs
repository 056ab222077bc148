//! Password lookup for managed users.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use rolesync_core::{Error, Password, Result};
use tokio::sync::RwLock;

/// Resolves the current password of a user.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    /// Fails with `CredentialUnavailable` if no password can be found.
    async fn resolve(&self, username: &str) -> Result<Password>;
}

/// Reads mounted secrets: `<dir>/user-<name>-secret/password`, with `_` in
/// the username replaced by `-`.
pub struct SecretsDirResolver {
    dir: PathBuf,
}

impl SecretsDirResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn password_path(&self, username: &str) -> PathBuf {
        self.dir
            .join(format!("user-{}-secret", username.replace('_', "-")))
            .join("password")
    }
}

#[async_trait]
impl CredentialResolver for SecretsDirResolver {
    async fn resolve(&self, username: &str) -> Result<Password> {
        let path = self.password_path(username);
        let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
            Error::credential_unavailable(username, format!("cannot read {}: {e}", path.display()))
        })?;

        let secret = content.trim_end_matches(['\n', '\r']);
        if secret.is_empty() {
            return Err(Error::credential_unavailable(
                username,
                format!("{} is empty", path.display()),
            ));
        }
        Ok(Password::new(secret))
    }
}

/// Fixed passwords held in memory.
#[derive(Default)]
pub struct InMemoryCredentialResolver {
    passwords: RwLock<HashMap<String, Password>>,
}

impl InMemoryCredentialResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_password(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.passwords
            .get_mut()
            .insert(username.into(), Password::new(password));
        self
    }

    pub async fn set(&self, username: impl Into<String>, password: impl Into<String>) {
        self.passwords
            .write()
            .await
            .insert(username.into(), Password::new(password));
    }
}

#[async_trait]
impl CredentialResolver for InMemoryCredentialResolver {
    async fn resolve(&self, username: &str) -> Result<Password> {
        self.passwords
            .read()
            .await
            .get(username)
            .cloned()
            .ok_or_else(|| Error::credential_unavailable(username, "no secret for user"))
    }
}
