//! In-memory gateway with PostgreSQL-like semantics.
//!
//! Used as the database test double. Every committed change is appended to an
//! ordered operation log, and any operation can be made to fail a given
//! number of times.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rolesync_core::{Error, ObservedState, Password, Result};

use crate::postgres::classify_sqlstate;
use crate::{DatabaseGateway, RoleFilter, UserTransaction};

/// A change applied to the server, as recorded in the operation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    CreateRole(String),
    DropRole(String),
    CreateUser(String),
    SetPassword(String),
    DropUser(String),
    Grant { user: String, role: String },
    Revoke { user: String, role: String },
}

/// Where an injected fault fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FaultTarget {
    ListRoles,
    ListUsers,
    ListMemberships,
    CreateRole(String),
    DropRole(String),
    /// Opening a transaction.
    Begin,
    CreateUser(String),
    SetPassword(String),
    DropUser(String),
    Grant { user: String, role: String },
    Revoke { user: String, role: String },
    /// Committing the transaction of the named user.
    Commit(String),
}

#[derive(Debug)]
struct Fault {
    target: FaultTarget,
    error: Error,
    remaining: u32,
    hits: u32,
}

#[derive(Debug, Clone, Default)]
struct Server {
    roles: BTreeSet<String>,
    users: BTreeMap<String, Password>,
    memberships: BTreeMap<String, BTreeSet<String>>,
}

impl Server {
    fn role_exists(&self, name: &str) -> bool {
        self.roles.contains(name) || self.users.contains_key(name)
    }

    fn apply(&mut self, operation: &Operation, password: Option<&Password>) {
        match operation {
            Operation::CreateRole(name) => {
                self.roles.insert(name.clone());
            }
            Operation::DropRole(name) => {
                self.roles.remove(name);
                for roles in self.memberships.values_mut() {
                    roles.remove(name);
                }
            }
            Operation::CreateUser(name) | Operation::SetPassword(name) => {
                if let Some(password) = password {
                    self.users.insert(name.clone(), password.clone());
                }
            }
            Operation::DropUser(name) => {
                self.users.remove(name);
                self.memberships.remove(name);
            }
            Operation::Grant { user, role } => {
                self.memberships
                    .entry(user.clone())
                    .or_default()
                    .insert(role.clone());
            }
            Operation::Revoke { user, role } => {
                if let Some(roles) = self.memberships.get_mut(user) {
                    roles.remove(role);
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    server: Mutex<Server>,
    log: Mutex<Vec<Operation>>,
    faults: Mutex<Vec<Fault>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn check_fault(&self, target: &FaultTarget) -> Result<()> {
        let mut faults = lock(&self.faults);
        let fired = faults
            .iter_mut()
            .find(|fault| &fault.target == target && fault.remaining > 0);
        match fired {
            Some(fault) => {
                fault.remaining = fault.remaining.saturating_sub(1);
                fault.hits = fault.hits.saturating_add(1);
                Err(fault.error.clone())
            }
            None => Ok(()),
        }
    }

    fn record(&self, operation: Operation) {
        lock(&self.log).push(operation);
    }
}

fn undefined_role(name: &str) -> Error {
    classify_sqlstate("42704", format!("role \"{name}\" does not exist"))
}

fn duplicate_role(name: &str) -> Error {
    classify_sqlstate("42710", format!("role \"{name}\" already exists"))
}

/// In-memory [`DatabaseGateway`].
///
/// Clones share the same server.
#[derive(Debug, Clone, Default)]
pub struct InMemoryGateway {
    shared: Arc<Shared>,
    filter: RoleFilter,
}

impl InMemoryGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an existing group role.
    #[must_use]
    pub fn with_role(self, name: impl Into<String>) -> Self {
        lock(&self.shared.server).roles.insert(name.into());
        self
    }

    /// Seed an existing login role with memberships.
    #[must_use]
    pub fn with_user<I, S>(self, name: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        {
            let mut server = lock(&self.shared.server);
            let roles: BTreeSet<String> = roles.into_iter().map(Into::into).collect();
            server.roles.extend(roles.iter().cloned());
            server.users.insert(name.clone(), Password::new("seeded"));
            server.memberships.insert(name, roles);
        }
        self
    }

    /// Seed a login role the engine must never see.
    #[must_use]
    pub fn with_protected_user(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        lock(&self.shared.server)
            .users
            .insert(name.clone(), Password::new("protected"));
        self.filter = self.filter.with(name);
        self
    }

    /// Make the next `times` operations matching `target` fail with `error`.
    pub fn fail(&self, target: FaultTarget, error: Error, times: u32) {
        lock(&self.shared.faults).push(Fault {
            target,
            error,
            remaining: times,
            hits: 0,
        });
    }

    /// How many times faults on `target` have fired.
    #[must_use]
    pub fn fault_hits(&self, target: &FaultTarget) -> u32 {
        lock(&self.shared.faults)
            .iter()
            .filter(|fault| &fault.target == target)
            .map(|fault| fault.hits)
            .sum()
    }

    /// Revoke a membership behind the engine's back.
    pub fn revoke_out_of_band(&self, user: &str, role: &str) {
        if let Some(roles) = lock(&self.shared.server).memberships.get_mut(user) {
            roles.remove(role);
        }
    }

    /// Drop a login role behind the engine's back.
    pub fn drop_user_out_of_band(&self, user: &str) {
        let mut server = lock(&self.shared.server);
        server.users.remove(user);
        server.memberships.remove(user);
    }

    /// Committed operations, in order.
    #[must_use]
    pub fn operations(&self) -> Vec<Operation> {
        lock(&self.shared.log).clone()
    }

    pub fn clear_operations(&self) {
        lock(&self.shared.log).clear();
    }

    /// Full server state, protected roles included.
    #[must_use]
    pub fn server_state(&self) -> ObservedState {
        let server = lock(&self.shared.server);
        ObservedState {
            roles: server.roles.clone(),
            users: server.users.keys().cloned().collect(),
            memberships: server
                .memberships
                .iter()
                .filter(|(_, roles)| !roles.is_empty())
                .map(|(user, roles)| (user.clone(), roles.clone()))
                .collect(),
        }
    }

    /// Current password of a login role.
    #[must_use]
    pub fn password_of(&self, user: &str) -> Option<Password> {
        lock(&self.shared.server).users.get(user).cloned()
    }
}

#[async_trait]
impl DatabaseGateway for InMemoryGateway {
    async fn list_roles(&self) -> Result<BTreeSet<String>> {
        self.shared.check_fault(&FaultTarget::ListRoles)?;
        Ok(lock(&self.shared.server)
            .roles
            .iter()
            .filter(|name| self.filter.is_managed(name))
            .cloned()
            .collect())
    }

    async fn list_users(&self) -> Result<BTreeSet<String>> {
        self.shared.check_fault(&FaultTarget::ListUsers)?;
        Ok(lock(&self.shared.server)
            .users
            .keys()
            .filter(|name| self.filter.is_managed(name))
            .cloned()
            .collect())
    }

    async fn list_memberships(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        self.shared.check_fault(&FaultTarget::ListMemberships)?;
        let server = lock(&self.shared.server);
        Ok(server
            .memberships
            .iter()
            .filter(|(user, _)| self.filter.is_managed(user))
            .map(|(user, roles)| {
                let roles: BTreeSet<String> = roles
                    .iter()
                    .filter(|role| self.filter.is_managed(role))
                    .cloned()
                    .collect();
                (user.clone(), roles)
            })
            .filter(|(_, roles)| !roles.is_empty())
            .collect())
    }

    async fn create_role(&self, name: &str) -> Result<()> {
        self.shared
            .check_fault(&FaultTarget::CreateRole(name.to_string()))?;
        let mut server = lock(&self.shared.server);
        if server.role_exists(name) {
            return Ok(());
        }
        let operation = Operation::CreateRole(name.to_string());
        server.apply(&operation, None);
        drop(server);
        self.shared.record(operation);
        Ok(())
    }

    async fn drop_role(&self, name: &str) -> Result<()> {
        self.shared
            .check_fault(&FaultTarget::DropRole(name.to_string()))?;
        let mut server = lock(&self.shared.server);
        if !server.roles.contains(name) {
            return Ok(());
        }
        let operation = Operation::DropRole(name.to_string());
        server.apply(&operation, None);
        drop(server);
        self.shared.record(operation);
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn UserTransaction>> {
        self.shared.check_fault(&FaultTarget::Begin)?;
        let working = lock(&self.shared.server).clone();
        Ok(Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.shared),
            working,
            pending: Vec::new(),
            user: None,
        }))
    }
}

/// Buffers statements against a private copy of the server; replays them on
/// commit.
struct InMemoryTransaction {
    shared: Arc<Shared>,
    working: Server,
    pending: Vec<(Operation, Option<Password>)>,
    user: Option<String>,
}

impl InMemoryTransaction {
    fn touch(&mut self, user: &str) {
        if self.user.is_none() {
            self.user = Some(user.to_string());
        }
    }

    fn stage(&mut self, operation: Operation, password: Option<&Password>) {
        self.working.apply(&operation, password);
        self.pending.push((operation, password.cloned()));
    }
}

#[async_trait]
impl UserTransaction for InMemoryTransaction {
    async fn create_user(&mut self, name: &str, password: &Password) -> Result<()> {
        self.touch(name);
        self.shared
            .check_fault(&FaultTarget::CreateUser(name.to_string()))?;
        if self.working.role_exists(name) {
            return Err(duplicate_role(name));
        }
        self.stage(Operation::CreateUser(name.to_string()), Some(password));
        Ok(())
    }

    async fn set_password(&mut self, name: &str, password: &Password) -> Result<()> {
        self.touch(name);
        self.shared
            .check_fault(&FaultTarget::SetPassword(name.to_string()))?;
        if !self.working.users.contains_key(name) {
            return Err(undefined_role(name));
        }
        self.stage(Operation::SetPassword(name.to_string()), Some(password));
        Ok(())
    }

    async fn drop_user(&mut self, name: &str) -> Result<()> {
        self.touch(name);
        self.shared
            .check_fault(&FaultTarget::DropUser(name.to_string()))?;
        if !self.working.users.contains_key(name) {
            return Ok(());
        }
        self.stage(Operation::DropUser(name.to_string()), None);
        Ok(())
    }

    async fn grant_role(&mut self, user: &str, role: &str) -> Result<()> {
        self.touch(user);
        self.shared.check_fault(&FaultTarget::Grant {
            user: user.to_string(),
            role: role.to_string(),
        })?;
        if !self.working.roles.contains(role) {
            return Err(undefined_role(role));
        }
        if !self.working.users.contains_key(user) {
            return Err(undefined_role(user));
        }
        self.stage(
            Operation::Grant {
                user: user.to_string(),
                role: role.to_string(),
            },
            None,
        );
        Ok(())
    }

    async fn revoke_role(&mut self, user: &str, role: &str) -> Result<()> {
        self.touch(user);
        self.shared.check_fault(&FaultTarget::Revoke {
            user: user.to_string(),
            role: role.to_string(),
        })?;
        if !self.working.role_exists(role) {
            return Err(undefined_role(role));
        }
        self.stage(
            Operation::Revoke {
                user: user.to_string(),
                role: role.to_string(),
            },
            None,
        );
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self {
            shared,
            pending,
            user,
            ..
        } = *self;
        if let Some(user) = user {
            shared.check_fault(&FaultTarget::Commit(user))?;
        }

        let mut server = lock(&shared.server);
        let mut log = lock(&shared.log);
        for (operation, password) in pending {
            server.apply(&operation, password.as_ref());
            log.push(operation);
        }
        Ok(())
    }
}
