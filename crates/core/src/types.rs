//! Domain types shared by the gateway and the reconciler.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::ident::validate_identifier;
use crate::result::Result;

/// Desired configuration of one managed user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSpec {
    /// Login role name.
    pub username: String,
    /// Database the user is associated with. Advisory only.
    pub database: String,
    /// Group roles the user must be a member of.
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Password rotation marker; a change triggers a password reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_revision: Option<String>,
}

impl UserSpec {
    /// Create a user spec without roles.
    pub fn new(username: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            database: database.into(),
            roles: BTreeSet::new(),
            credential_revision: None,
        }
    }

    /// Add a role membership.
    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Add several role memberships.
    #[must_use]
    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Set the credential revision.
    #[must_use]
    pub fn with_credential_revision(mut self, revision: impl Into<String>) -> Self {
        self.credential_revision = Some(revision.into());
        self
    }
}

/// Validated desired state, keyed by username.
///
/// Only constructible through [`DesiredState::from_specs`], so every value
/// seen by the reconciler has unique, well-formed names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    users: BTreeMap<String, UserSpec>,
}

impl DesiredState {
    /// Create an empty desired state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a list of user specs into a desired state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` on duplicate usernames, malformed identifiers,
    /// an empty database name, or a role name that is also a desired username.
    pub fn from_specs(specs: Vec<UserSpec>) -> Result<Self> {
        let mut users = BTreeMap::new();

        for spec in specs {
            validate_identifier("user", &spec.username)?;
            if spec.database.trim().is_empty() {
                return Err(Error::invalid_spec(format!(
                    "user '{}' has an empty database name",
                    spec.username
                )));
            }
            for role in &spec.roles {
                validate_identifier("role", role)?;
            }

            let username = spec.username.clone();
            if users.insert(username.clone(), spec).is_some() {
                return Err(Error::invalid_spec(format!(
                    "duplicate username '{username}'"
                )));
            }
        }

        let state = Self { users };

        let collisions = state
            .role_set()
            .into_iter()
            .filter(|role| state.users.contains_key(role))
            .collect_vec();
        if !collisions.is_empty() {
            return Err(Error::invalid_spec(format!(
                "names used both as user and role: {}",
                collisions.join(", ")
            )));
        }

        Ok(state)
    }

    /// All user specs, ordered by username.
    pub fn users(&self) -> impl Iterator<Item = &UserSpec> {
        self.users.values()
    }

    /// Look up one user.
    #[must_use]
    pub fn get(&self, username: &str) -> Option<&UserSpec> {
        self.users.get(username)
    }

    /// Whether a user is desired.
    #[must_use]
    pub fn contains(&self, username: &str) -> bool {
        self.users.contains_key(username)
    }

    /// Set of desired usernames.
    #[must_use]
    pub fn usernames(&self) -> BTreeSet<String> {
        self.users.keys().cloned().collect()
    }

    /// Union of all roles referenced by desired users.
    #[must_use]
    pub fn role_set(&self) -> BTreeSet<String> {
        self.users
            .values()
            .flat_map(|spec| spec.roles.iter().cloned())
            .collect()
    }

    /// Number of desired users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether no users are desired.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// Snapshot of the server, read fresh at the start of each cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedState {
    /// Existing non-login roles.
    pub roles: BTreeSet<String>,
    /// Existing login roles.
    pub users: BTreeSet<String>,
    /// Role memberships of each login role.
    pub memberships: BTreeMap<String, BTreeSet<String>>,
}

impl ObservedState {
    /// Create an empty observed state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Memberships of a user; empty if the user has none or does not exist.
    #[must_use]
    pub fn memberships_of(&self, username: &str) -> BTreeSet<String> {
        self.memberships.get(username).cloned().unwrap_or_default()
    }
}

/// What the reconciler recorded for one user when it last applied desired state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedUser {
    pub roles: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_revision: Option<String>,
}

/// Last desired state successfully reconciled, persisted between cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppliedSnapshot {
    users: BTreeMap<String, AppliedUser>,
}

impl AppliedSnapshot {
    /// Create an empty snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the desired state exactly as intended.
    #[must_use]
    pub fn from_desired(desired: &DesiredState) -> Self {
        let users = desired
            .users()
            .map(|spec| {
                (
                    spec.username.clone(),
                    AppliedUser {
                        roles: spec.roles.clone(),
                        credential_revision: spec.credential_revision.clone(),
                    },
                )
            })
            .collect();
        Self { users }
    }

    /// Insert or replace one user's entry.
    pub fn insert(&mut self, username: impl Into<String>, user: AppliedUser) {
        self.users.insert(username.into(), user);
    }

    /// Replace `username`'s credential revision with the one `previous`
    /// recorded, so a rotation that did not commit is attempted again.
    pub fn keep_credential_revision(&mut self, username: &str, previous: &Self) {
        if let Some(user) = self.users.get_mut(username) {
            user.credential_revision = previous
                .get(username)
                .and_then(|applied| applied.credential_revision.clone());
        }
    }

    /// Look up one user.
    #[must_use]
    pub fn get(&self, username: &str) -> Option<&AppliedUser> {
        self.users.get(username)
    }

    /// Number of recorded users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// Whether the snapshot is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

/// A resolved password.
///
/// Never printed: `Debug` is redacted and there is no `Display`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The clear-text secret, for the statement that consumes it.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}
