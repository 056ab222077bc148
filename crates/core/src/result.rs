//! Result type definition and extension traits.
//!
//! Provides combinators for degrading gracefully without unwrap/expect/panic.

use crate::error::Error;

/// The standard Result type for rolesync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait providing logged fallbacks for Results.
pub trait ResultExt<T> {
    /// Convert a Result to an Option, logging the error if present.
    fn into_option_logged(self, context: &str) -> Option<T>;

    /// Get the value or a fallback, logging the error at `warn` if present.
    fn or_else_logged<F: FnOnce() -> T>(self, context: &str, fallback: F) -> T;

    /// Inspect the error without consuming the Result.
    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self;
}

impl<T> ResultExt<T> for Result<T> {
    fn into_option_logged(self, context: &str) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(error = %e, kind = %e.kind(), "{context}");
                None
            }
        }
    }

    fn or_else_logged<F: FnOnce() -> T>(self, context: &str, fallback: F) -> T {
        match self {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, kind = %e.kind(), "{context}");
                fallback()
            }
        }
    }

    fn inspect_error<F: FnOnce(&Error)>(self, f: F) -> Self {
        if let Err(ref e) = self {
            f(e);
        }
        self
    }
}
