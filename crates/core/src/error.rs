//! Error taxonomy for rolesync operations.
//!
//! Every failure is classified into an [`ErrorKind`]. The kind decides how the
//! reconciler reacts: abort the cycle, skip a single user, retry the unit, or
//! record a permanent per-unit failure.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Core error type shared by every rolesync crate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    // Input errors
    #[error("desired state unavailable: {reason}")]
    SpecUnavailable { reason: String },

    #[error("invalid desired state: {reason}")]
    InvalidSpec { reason: String },

    #[error("credential for user '{username}' unavailable: {reason}")]
    CredentialUnavailable { username: String, reason: String },

    // Transient database errors
    #[error("database unavailable: {reason}")]
    DatabaseUnavailable { reason: String },

    #[error("connection pool exhausted after waiting {waited:?}")]
    PoolExhausted { waited: Duration },

    #[error("serialization conflict ({code}): {reason}")]
    SerializationConflict { code: String, reason: String },

    // Permanent database errors
    #[error("permission denied: {reason}")]
    PermissionDenied { reason: String },

    #[error("constraint violation ({code}): {reason}")]
    ConstraintViolation { code: String, reason: String },

    #[error("database error ({code}): {reason}")]
    Database { code: String, reason: String },

    // Persistence
    #[error("state store unavailable: {reason}")]
    StateStoreUnavailable { reason: String },

    // Process
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("operation cancelled by shutdown")]
    Cancelled,
}

/// Coarse classification of an [`Error`], used in summaries and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    SpecUnavailable,
    InvalidSpec,
    CredentialUnavailable,
    DatabaseUnavailable,
    PoolExhausted,
    SerializationConflict,
    PermissionDenied,
    ConstraintViolation,
    Database,
    StateStoreUnavailable,
    InvalidConfig,
    Cancelled,
}

impl ErrorKind {
    /// Stable snake_case name of the kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpecUnavailable => "spec_unavailable",
            Self::InvalidSpec => "invalid_spec",
            Self::CredentialUnavailable => "credential_unavailable",
            Self::DatabaseUnavailable => "database_unavailable",
            Self::PoolExhausted => "pool_exhausted",
            Self::SerializationConflict => "serialization_conflict",
            Self::PermissionDenied => "permission_denied",
            Self::ConstraintViolation => "constraint_violation",
            Self::Database => "database",
            Self::StateStoreUnavailable => "state_store_unavailable",
            Self::InvalidConfig => "invalid_config",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::SpecUnavailable { .. } => ErrorKind::SpecUnavailable,
            Self::InvalidSpec { .. } => ErrorKind::InvalidSpec,
            Self::CredentialUnavailable { .. } => ErrorKind::CredentialUnavailable,
            Self::DatabaseUnavailable { .. } => ErrorKind::DatabaseUnavailable,
            Self::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            Self::SerializationConflict { .. } => ErrorKind::SerializationConflict,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::ConstraintViolation { .. } => ErrorKind::ConstraintViolation,
            Self::Database { .. } => ErrorKind::Database,
            Self::StateStoreUnavailable { .. } => ErrorKind::StateStoreUnavailable,
            Self::InvalidConfig { .. } => ErrorKind::InvalidConfig,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether retrying the same unit of work may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DatabaseUnavailable
                | ErrorKind::PoolExhausted
                | ErrorKind::SerializationConflict
        )
    }

    /// Whether this error aborts a whole cycle before any mutation.
    #[must_use]
    pub const fn aborts_cycle(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::SpecUnavailable | ErrorKind::InvalidSpec
        )
    }

    /// Create a spec unavailable error.
    pub fn spec_unavailable(reason: impl Into<String>) -> Self {
        Self::SpecUnavailable {
            reason: reason.into(),
        }
    }

    /// Create an invalid spec error.
    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            reason: reason.into(),
        }
    }

    /// Create a credential unavailable error.
    pub fn credential_unavailable(username: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CredentialUnavailable {
            username: username.into(),
            reason: reason.into(),
        }
    }

    /// Create a database unavailable error.
    pub fn database_unavailable(reason: impl Into<String>) -> Self {
        Self::DatabaseUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a serialization conflict error.
    pub fn serialization_conflict(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SerializationConflict {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// Create a permission denied error.
    pub fn permission_denied(reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            reason: reason.into(),
        }
    }

    /// Create a constraint violation error.
    pub fn constraint_violation(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// Create a generic permanent database error.
    pub fn database(code: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Database {
            code: code.into(),
            reason: reason.into(),
        }
    }

    /// Create a state store error.
    pub fn state_store_unavailable(reason: impl Into<String>) -> Self {
        Self::StateStoreUnavailable {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::invalid_spec("duplicate username 'bob'");
        assert!(err.to_string().contains("duplicate username 'bob'"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::database_unavailable("connection reset").is_transient());
        assert!(
            Error::PoolExhausted {
                waited: Duration::from_secs(10)
            }
            .is_transient()
        );
        assert!(Error::serialization_conflict("40P01", "deadlock detected").is_transient());

        assert!(!Error::permission_denied("must be superuser").is_transient());
        assert!(!Error::constraint_violation("23505", "duplicate key").is_transient());
        assert!(!Error::credential_unavailable("bob", "missing").is_transient());
        assert!(!Error::invalid_spec("bad").is_transient());
    }

    #[test]
    fn test_input_errors_abort_cycle() {
        assert!(Error::spec_unavailable("file missing").aborts_cycle());
        assert!(Error::invalid_spec("bad").aborts_cycle());
        assert!(!Error::database_unavailable("down").aborts_cycle());
    }

    #[test]
    fn test_kind_names_are_snake_case() {
        assert_eq!(
            Error::credential_unavailable("bob", "x").kind().as_str(),
            "credential_unavailable"
        );
        assert_eq!(Error::Cancelled.kind().to_string(), "cancelled");
    }
}
