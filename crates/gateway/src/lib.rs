//! Database gateway for rolesync.
//!
//! The gateway is the only component that talks SQL. It offers:
//!
//! - **Introspection**: managed roles, managed users and their memberships
//! - **Role operations**: idempotent `create_role` / `drop_role`
//! - **User transactions**: every change to one user runs in one
//!   [`UserTransaction`], committed as a unit
//!
//! Three implementations share the traits: [`PgGateway`] (sqlx),
//! [`InMemoryGateway`] (tests, with fault injection) and [`DryRunGateway`]
//! (reads delegate, writes are narrated).

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use rolesync_core::ident::is_builtin_role;
use rolesync_core::{Password, Result};

pub mod dry_run;
pub mod memory;
pub mod postgres;
pub mod sql;

pub use dry_run::DryRunGateway;
pub use memory::{FaultTarget, InMemoryGateway, Operation};
pub use postgres::{PgGateway, PgGatewayConfig};

/// Catalog reads and role-level DDL against one PostgreSQL endpoint.
#[async_trait]
pub trait DatabaseGateway: Send + Sync {
    /// Non-login roles visible to the engine.
    async fn list_roles(&self) -> Result<BTreeSet<String>>;

    /// Login roles visible to the engine.
    async fn list_users(&self) -> Result<BTreeSet<String>>;

    /// Role memberships of each visible login role.
    async fn list_memberships(&self) -> Result<BTreeMap<String, BTreeSet<String>>>;

    /// Create a `NOLOGIN` group role. An existing role is success.
    async fn create_role(&self, name: &str) -> Result<()>;

    /// Drop a group role. A missing role is success.
    async fn drop_role(&self, name: &str) -> Result<()>;

    /// Open a transaction for changes to one user.
    async fn begin(&self) -> Result<Box<dyn UserTransaction>>;
}

/// Statements for one user, applied atomically on [`UserTransaction::commit`].
///
/// Dropping the transaction without committing rolls it back.
#[async_trait]
pub trait UserTransaction: Send {
    async fn create_user(&mut self, name: &str, password: &Password) -> Result<()>;

    async fn set_password(&mut self, name: &str, password: &Password) -> Result<()>;

    /// Reassign and drop owned objects, then drop the login role.
    async fn drop_user(&mut self, name: &str) -> Result<()>;

    async fn grant_role(&mut self, user: &str, role: &str) -> Result<()>;

    async fn revoke_role(&mut self, user: &str, role: &str) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Decides which server-side roles the engine may see and touch.
///
/// Built-in `pg_*` roles, the configured protected list and the gateway's own
/// admin login are hidden from every listing.
#[derive(Debug, Clone, Default)]
pub struct RoleFilter {
    protected: BTreeSet<String>,
}

impl RoleFilter {
    pub fn new<I, S>(protected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            protected: protected.into_iter().map(Into::into).collect(),
        }
    }

    /// Add one more protected name.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>) -> Self {
        self.protected.insert(name.into());
        self
    }

    #[must_use]
    pub fn is_managed(&self, name: &str) -> bool {
        !is_builtin_role(name) && !self.protected.contains(name)
    }
}
