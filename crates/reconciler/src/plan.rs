//! Three-way diff of desired, observed and last-applied state.
//!
//! [`ReconcilePlan::compute`] is pure: the same inputs always give the same
//! plan, and a plan computed against the state it produces is empty.

use std::collections::BTreeSet;

use rolesync_core::{AppliedSnapshot, DesiredState, ObservedState, UserSpec};

use crate::types::ReconcileAction;

/// Membership (and password) changes for one existing user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipUpdate {
    pub username: String,
    /// Roles desired but not held.
    pub grant: BTreeSet<String>,
    /// Roles held but not desired.
    pub revoke: BTreeSet<String>,
    /// The credential revision changed since it was last applied.
    pub rotate_password: bool,
}

/// A user whose server state diverged from what was last applied, although
/// its desired roles did not change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftFinding {
    pub username: String,
    pub applied: BTreeSet<String>,
    /// Observed memberships; `None` if the user itself disappeared.
    pub observed: Option<BTreeSet<String>>,
}

/// Everything one cycle has to do, grouped by phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub roles_to_create: BTreeSet<String>,
    pub users_to_create: Vec<UserSpec>,
    pub users_to_update: Vec<MembershipUpdate>,
    pub users_to_delete: BTreeSet<String>,
    /// Candidates only: a role is dropped once no user still holds it.
    pub roles_to_drop: BTreeSet<String>,
    pub drift: Vec<DriftFinding>,
}

impl ReconcilePlan {
    /// Compute the plan for one cycle.
    #[must_use]
    pub fn compute(
        desired: &DesiredState,
        observed: &ObservedState,
        last_applied: &AppliedSnapshot,
    ) -> Self {
        let role_set = desired.role_set();

        let roles_to_create = role_set.difference(&observed.roles).cloned().collect();
        let roles_to_drop = observed.roles.difference(&role_set).cloned().collect();

        let users_to_create = desired
            .users()
            .filter(|spec| !observed.users.contains(&spec.username))
            .cloned()
            .collect();

        let users_to_delete = observed
            .users
            .iter()
            .filter(|user| !desired.contains(user))
            .cloned()
            .collect();

        let users_to_update = desired
            .users()
            .filter(|spec| observed.users.contains(&spec.username))
            .filter_map(|spec| membership_update(spec, observed, last_applied))
            .collect();

        let drift = desired
            .users()
            .filter_map(|spec| drift_finding(spec, observed, last_applied))
            .collect();

        Self {
            roles_to_create,
            users_to_create,
            users_to_update,
            users_to_delete,
            roles_to_drop,
            drift,
        }
    }

    /// Whether the plan changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roles_to_create.is_empty()
            && self.users_to_create.is_empty()
            && self.users_to_update.is_empty()
            && self.users_to_delete.is_empty()
            && self.roles_to_drop.is_empty()
    }

    /// The plan as actions, in phase order.
    #[must_use]
    pub fn actions(&self) -> Vec<ReconcileAction> {
        let create_roles = self
            .roles_to_create
            .iter()
            .map(|role| ReconcileAction::CreateRole { role: role.clone() });
        let create_users = self.users_to_create.iter().map(|spec| ReconcileAction::CreateUser {
            username: spec.username.clone(),
            roles: spec.roles.clone(),
        });
        let updates = self
            .users_to_update
            .iter()
            .map(|update| ReconcileAction::UpdateMemberships {
                username: update.username.clone(),
                grant: update.grant.clone(),
                revoke: update.revoke.clone(),
                rotate_password: update.rotate_password,
            });
        let deletes = self
            .users_to_delete
            .iter()
            .map(|user| ReconcileAction::DeleteUser {
                username: user.clone(),
            });
        let drops = self
            .roles_to_drop
            .iter()
            .map(|role| ReconcileAction::DropRole { role: role.clone() });

        create_roles
            .chain(create_users)
            .chain(updates)
            .chain(deletes)
            .chain(drops)
            .collect()
    }
}

fn membership_update(
    spec: &UserSpec,
    observed: &ObservedState,
    last_applied: &AppliedSnapshot,
) -> Option<MembershipUpdate> {
    let held = observed.memberships_of(&spec.username);
    let grant: BTreeSet<String> = spec.roles.difference(&held).cloned().collect();
    let revoke: BTreeSet<String> = held.difference(&spec.roles).cloned().collect();

    let rotate_password = spec.credential_revision.is_some()
        && last_applied
            .get(&spec.username)
            .is_some_and(|applied| applied.credential_revision != spec.credential_revision);

    if grant.is_empty() && revoke.is_empty() && !rotate_password {
        return None;
    }

    Some(MembershipUpdate {
        username: spec.username.clone(),
        grant,
        revoke,
        rotate_password,
    })
}

fn drift_finding(
    spec: &UserSpec,
    observed: &ObservedState,
    last_applied: &AppliedSnapshot,
) -> Option<DriftFinding> {
    let applied = last_applied.get(&spec.username)?;
    if applied.roles != spec.roles {
        // The desired roles changed; the difference is ours, not drift.
        return None;
    }

    if !observed.users.contains(&spec.username) {
        return Some(DriftFinding {
            username: spec.username.clone(),
            applied: applied.roles.clone(),
            observed: None,
        });
    }

    let held = observed.memberships_of(&spec.username);
    (held != applied.roles).then(|| DriftFinding {
        username: spec.username.clone(),
        applied: applied.roles.clone(),
        observed: Some(held),
    })
}
