//! Gateway wrapper that narrates writes instead of applying them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use rolesync_core::{Password, Result};
use tracing::info;

use crate::{DatabaseGateway, UserTransaction};

/// Reads go to the wrapped gateway; writes are logged and succeed.
pub struct DryRunGateway {
    inner: Arc<dyn DatabaseGateway>,
}

impl DryRunGateway {
    pub fn new(inner: Arc<dyn DatabaseGateway>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl DatabaseGateway for DryRunGateway {
    async fn list_roles(&self) -> Result<BTreeSet<String>> {
        self.inner.list_roles().await
    }

    async fn list_users(&self) -> Result<BTreeSet<String>> {
        self.inner.list_users().await
    }

    async fn list_memberships(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        self.inner.list_memberships().await
    }

    async fn create_role(&self, name: &str) -> Result<()> {
        info!(dry_run = true, role = %name, "Would create role");
        Ok(())
    }

    async fn drop_role(&self, name: &str) -> Result<()> {
        info!(dry_run = true, role = %name, "Would drop role");
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn UserTransaction>> {
        Ok(Box::new(DryRunTransaction))
    }
}

struct DryRunTransaction;

#[async_trait]
impl UserTransaction for DryRunTransaction {
    async fn create_user(&mut self, name: &str, _password: &Password) -> Result<()> {
        info!(dry_run = true, user = %name, "Would create user");
        Ok(())
    }

    async fn set_password(&mut self, name: &str, _password: &Password) -> Result<()> {
        info!(dry_run = true, user = %name, "Would reset password");
        Ok(())
    }

    async fn drop_user(&mut self, name: &str) -> Result<()> {
        info!(dry_run = true, user = %name, "Would drop user");
        Ok(())
    }

    async fn grant_role(&mut self, user: &str, role: &str) -> Result<()> {
        info!(dry_run = true, user = %user, role = %role, "Would grant role");
        Ok(())
    }

    async fn revoke_role(&mut self, user: &str, role: &str) -> Result<()> {
        info!(dry_run = true, user = %user, role = %role, "Would revoke role");
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
