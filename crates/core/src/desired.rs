//! Parsing of the desired-state document.
//!
//! The document has the shape of the `users.yaml` key of a mounted ConfigMap:
//!
//! ```yaml
//! users:
//!   - username: bob
//!     database: app
//!     roles: [writer]
//! ```
//!
//! Parsing is all-or-nothing: one malformed entry rejects the document.

use serde::Deserialize;
use serde_yaml::Value;

use crate::error::Error;
use crate::result::Result;
use crate::types::{DesiredState, UserSpec};

#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    #[serde(default)]
    users: Option<Vec<RawUser>>,
}

/// `username` and `roles` stay untyped: a plain `true` or `null` would
/// otherwise deserialize into the string "true" or "null".
#[derive(Debug, Deserialize)]
struct RawUser {
    username: Option<Value>,
    database: Option<String>,
    #[serde(default)]
    roles: Option<Vec<Value>>,
    #[serde(default)]
    credential_revision: Option<String>,
}

/// Parse a YAML desired-state document.
///
/// Entries without `database` get `default_database`. An empty document is an
/// empty desired state.
///
/// # Errors
///
/// Returns `InvalidSpec` if the YAML is malformed, an entry lacks a username,
/// a role is not a string, or [`DesiredState::from_specs`] rejects the entries.
pub fn parse_desired_yaml(content: &str, default_database: &str) -> Result<DesiredState> {
    if content.trim().is_empty() {
        tracing::warn!("Desired-state document is empty, no users to manage");
        return Ok(DesiredState::new());
    }

    let raw: Option<RawDocument> = serde_yaml::from_str(content)
        .map_err(|e| Error::invalid_spec(format!("malformed users document: {e}")))?;

    let specs = raw
        .and_then(|doc| doc.users)
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(index, user)| into_spec(index, user, default_database))
        .collect::<Result<Vec<_>>>()?;

    DesiredState::from_specs(specs)
}

fn into_spec(index: usize, raw: RawUser, default_database: &str) -> Result<UserSpec> {
    let username = match raw.username {
        None | Some(Value::Null) => None,
        Some(value) => Some(as_string(value, || format!("users[{index}].username"))?),
    }
    .filter(|name| !name.is_empty())
    .ok_or_else(|| Error::invalid_spec(format!("users[{index}] is missing a username")))?;

    let roles = raw
        .roles
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(position, role)| as_string(role, || format!("users[{index}].roles[{position}]")))
        .collect::<Result<_>>()?;

    Ok(UserSpec {
        username,
        database: raw
            .database
            .unwrap_or_else(|| default_database.to_string()),
        roles,
        credential_revision: raw.credential_revision,
    })
}

fn as_string(value: Value, field: impl FnOnce() -> String) -> Result<String> {
    match value {
        Value::String(text) => Ok(text),
        other => Err(Error::invalid_spec(format!(
            "{} must be a string, got {other:?}",
            field()
        ))),
    }
}
