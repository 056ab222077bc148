//! PostgreSQL identifier rules for managed users and roles.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::Error;
use crate::result::Result;

/// `NAMEDATALEN - 1` on a stock PostgreSQL build.
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Prefix reserved by PostgreSQL for built-in roles.
pub const RESERVED_PREFIX: &str = "pg_";

static IDENTIFIER: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_$]*$").ok());

/// Check that `name` is acceptable as a managed user or role name.
///
/// # Errors
///
/// Returns `InvalidSpec` if the name is empty, too long, not lower-case,
/// contains characters outside `[a-z0-9_$]` or uses the reserved `pg_` prefix.
pub fn validate_identifier(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid_spec(format!("{what} name must not be empty")));
    }

    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::invalid_spec(format!(
            "{what} name '{name}' exceeds {MAX_IDENTIFIER_LEN} bytes"
        )));
    }

    if name.starts_with(RESERVED_PREFIX) {
        return Err(Error::invalid_spec(format!(
            "{what} name '{name}' uses the reserved '{RESERVED_PREFIX}' prefix"
        )));
    }

    let valid = IDENTIFIER
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(name));
    if !valid {
        return Err(Error::invalid_spec(format!(
            "{what} name '{name}' must be lower-case and match [a-z_][a-z0-9_$]*"
        )));
    }

    Ok(())
}

/// Whether a server-side role name belongs to PostgreSQL itself.
#[must_use]
pub fn is_builtin_role(name: &str) -> bool {
    name.starts_with(RESERVED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_names() {
        assert!(validate_identifier("user", "bob").is_ok());
        assert!(validate_identifier("role", "app_reader").is_ok());
        assert!(validate_identifier("role", "_svc$1").is_ok());
    }

    #[test]
    fn test_rejects_upper_case() {
        let err = validate_identifier("user", "Bob").err();
        assert!(matches!(err, Some(Error::InvalidSpec { .. })));
    }

    #[test]
    fn test_rejects_injection_attempts() {
        for name in [
            "bob\"; DROP ROLE postgres; --",
            "a b",
            "x'y",
            "1abc",
            "",
        ] {
            assert!(validate_identifier("user", name).is_err(), "{name} accepted");
        }
    }

    #[test]
    fn test_rejects_reserved_prefix_and_long_names() {
        assert!(validate_identifier("role", "pg_monitor").is_err());
        let long = "a".repeat(MAX_IDENTIFIER_LEN + 1);
        assert!(validate_identifier("role", &long).is_err());
        let max = "a".repeat(MAX_IDENTIFIER_LEN);
        assert!(validate_identifier("role", &max).is_ok());
    }
}
