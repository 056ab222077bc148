//! Structural quoting for PostgreSQL utility statements.
//!
//! `CREATE ROLE`, `GRANT` and friends cannot take bind parameters, so names
//! and password literals are rendered through [`Ident`] and [`Literal`],
//! which apply the server's own quoting rules (`quote_ident` / `quote_literal`).
//! Statement text is only ever assembled from these two types and fixed
//! keywords.

use std::fmt;

use rolesync_core::{Error, Password, Result};

/// A quoted identifier: `"name"` with embedded quotes doubled.
#[derive(Debug, Clone, Copy)]
pub struct Ident<'a>(&'a str);

impl<'a> Ident<'a> {
    /// Wrap a name for quoting.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSpec` for an empty name or one containing a NUL byte,
    /// neither of which PostgreSQL can represent.
    pub fn new(name: &'a str) -> Result<Self> {
        if name.is_empty() || name.contains('\0') {
            return Err(Error::invalid_spec(format!(
                "identifier {name:?} cannot be quoted"
            )));
        }
        Ok(Self(name))
    }
}

impl fmt::Display for Ident<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0.replace('"', "\"\""))
    }
}

/// A quoted string literal, `E'...'` when backslashes are present.
#[derive(Clone, Copy)]
pub struct Literal<'a>(&'a str);

impl<'a> Literal<'a> {
    /// Wrap a password for quoting.
    ///
    /// # Errors
    ///
    /// Returns `CredentialUnavailable` if the password contains a NUL byte.
    pub fn password(username: &str, password: &'a Password) -> Result<Self> {
        let secret = password.expose();
        if secret.contains('\0') {
            return Err(Error::credential_unavailable(
                username,
                "password contains a NUL byte",
            ));
        }
        Ok(Self(secret))
    }
}

impl fmt::Display for Literal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quoted = self.0.replace('\'', "''");
        if quoted.contains('\\') {
            write!(f, "E'{}'", quoted.replace('\\', "\\\\"))
        } else {
            write!(f, "'{quoted}'")
        }
    }
}

impl fmt::Debug for Literal<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Literal(***)")
    }
}

// Statement builders. Each takes already-quoted parts.

pub fn create_role(role: Ident<'_>) -> String {
    format!("CREATE ROLE {role} NOLOGIN")
}

pub fn drop_role(role: Ident<'_>) -> String {
    format!("DROP ROLE IF EXISTS {role}")
}

pub fn create_user(user: Ident<'_>, password: Literal<'_>) -> String {
    format!("CREATE ROLE {user} WITH LOGIN PASSWORD {password}")
}

pub fn set_password(user: Ident<'_>, password: Literal<'_>) -> String {
    format!("ALTER ROLE {user} WITH PASSWORD {password}")
}

pub fn grant_role(role: Ident<'_>, user: Ident<'_>) -> String {
    format!("GRANT {role} TO {user}")
}

pub fn revoke_role(role: Ident<'_>, user: Ident<'_>) -> String {
    format!("REVOKE {role} FROM {user}")
}

pub fn reassign_owned(user: Ident<'_>, new_owner: Ident<'_>) -> String {
    format!("REASSIGN OWNED BY {user} TO {new_owner}")
}

pub fn drop_owned(user: Ident<'_>) -> String {
    format!("DROP OWNED BY {user}")
}
