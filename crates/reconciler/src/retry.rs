//! Exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use rolesync_core::{Config, Error, Result};
use tracing::warn;

use crate::shutdown::ShutdownSignal;

/// Per-unit retry policy.
///
/// The delay before retry `n` (0-based) is `unit × base^n`, capped at
/// `max_delay`. Only errors with [`Error::is_transient`] are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: f64,
    pub unit: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base: 2.0,
            unit: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.reconcile.max_retries,
            base: config.reconcile.backoff_base,
            unit: config.backoff_unit(),
            max_delay: config.backoff_max(),
        }
    }

    /// Policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt`.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.unit.as_secs_f64() * self.base.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Run `op` until it succeeds, fails permanently, exhausts its retries
    /// or shutdown is requested.
    ///
    /// # Errors
    ///
    /// Returns the last error of `op`, or `Cancelled` if shutdown was
    /// requested before or during a backoff wait.
    pub async fn run<T, F, Fut>(&self, unit: &str, shutdown: &ShutdownSignal, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            if shutdown.is_shutdown() {
                return Err(Error::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    warn!(
                        unit = %unit,
                        error = %e,
                        attempt = attempt.saturating_add(1),
                        max_retries = self.max_retries,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Transient failure, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = shutdown.cancelled() => return Err(Error::Cancelled),
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => return Err(e),
            }
        }
    }
}
