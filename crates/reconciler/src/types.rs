//! Core types for the reconciler.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use rolesync_core::{Error, ErrorKind};
use serde::{Deserialize, Serialize};

/// Actions the reconciler can take, in the order their phases run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileAction {
    /// Create a `NOLOGIN` group role.
    CreateRole { role: String },
    /// Create a login role, set its password and grant its roles.
    CreateUser { username: String, roles: BTreeSet<String> },
    /// Revoke then grant memberships; optionally reset the password.
    UpdateMemberships {
        username: String,
        grant: BTreeSet<String>,
        revoke: BTreeSet<String>,
        rotate_password: bool,
    },
    /// Reassign owned objects and drop a login role.
    DeleteUser { username: String },
    /// Drop a group role no user holds any more.
    DropRole { role: String },
}

impl ReconcileAction {
    /// The user or role this action targets.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::CreateRole { role } | Self::DropRole { role } => role,
            Self::CreateUser { username, .. }
            | Self::UpdateMemberships { username, .. }
            | Self::DeleteUser { username } => username,
        }
    }

    /// Stable snake_case action name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::CreateRole { .. } => "create_role",
            Self::CreateUser { .. } => "create_user",
            Self::UpdateMemberships { .. } => "update_memberships",
            Self::DeleteUser { .. } => "delete_user",
            Self::DropRole { .. } => "drop_role",
        }
    }

    /// Get a description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match self {
            Self::CreateRole { role } => format!("create role {role}"),
            Self::CreateUser { username, roles } if roles.is_empty() => {
                format!("create user {username}")
            }
            Self::CreateUser { username, roles } => {
                format!("create user {username} with roles [{}]", roles.iter().join(", "))
            }
            Self::UpdateMemberships {
                username,
                grant,
                revoke,
                rotate_password,
            } => {
                let mut parts = Vec::new();
                if !revoke.is_empty() {
                    parts.push(format!("revoke [{}]", revoke.iter().join(", ")));
                }
                if !grant.is_empty() {
                    parts.push(format!("grant [{}]", grant.iter().join(", ")));
                }
                if *rotate_password {
                    parts.push("reset password".to_string());
                }
                format!("update user {username}: {}", parts.join(", "))
            }
            Self::DeleteUser { username } => format!("delete user {username}"),
            Self::DropRole { role } => format!("drop role {role}"),
        }
    }
}

impl fmt::Display for ReconcileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// One unit of work that did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitFailure {
    /// User or role name, or `snapshot` for the persistence step.
    pub target: String,
    /// Action name, e.g. `create_user`.
    pub action: &'static str,
    pub kind: ErrorKind,
    pub message: String,
}

impl UnitFailure {
    pub fn new(target: impl Into<String>, action: &'static str, error: &Error) -> Self {
        Self {
            target: target.into(),
            action,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Summary of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationStats {
    pub users_created: usize,
    pub users_updated: usize,
    pub users_deleted: usize,
    pub roles_created: usize,
    pub roles_deleted: usize,
    /// Users whose server state diverged from the applied snapshot.
    pub drift_detected: usize,
    /// Number of failed units; equals `failures.len()`.
    pub errors: usize,
    pub failures: Vec<UnitFailure>,
    /// Roles left in place because a member still holds them.
    pub roles_deferred: usize,
    pub dry_run: bool,
    /// Shutdown interrupted the cycle; the snapshot was not written.
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl ReconciliationStats {
    #[must_use]
    pub fn new(dry_run: bool) -> Self {
        Self {
            users_created: 0,
            users_updated: 0,
            users_deleted: 0,
            roles_created: 0,
            roles_deleted: 0,
            drift_detected: 0,
            errors: 0,
            failures: Vec::new(),
            roles_deferred: 0,
            dry_run,
            cancelled: false,
            started_at: Utc::now(),
            duration: Duration::ZERO,
        }
    }

    /// Record a failed unit.
    pub fn record_failure(&mut self, failure: UnitFailure) {
        self.errors = self.errors.saturating_add(1);
        self.failures.push(failure);
    }

    /// Total changes applied (or, in dry-run, narrated).
    #[must_use]
    pub const fn changes(&self) -> usize {
        self.users_created
            .saturating_add(self.users_updated)
            .saturating_add(self.users_deleted)
            .saturating_add(self.roles_created)
            .saturating_add(self.roles_deleted)
    }

    /// Nothing changed and nothing failed.
    #[must_use]
    pub const fn converged(&self) -> bool {
        self.changes() == 0 && self.errors == 0 && self.roles_deferred == 0 && !self.cancelled
    }
}
