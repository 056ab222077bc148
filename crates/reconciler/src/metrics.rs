//! Cycle metrics exposed through a `prometheus_client` registry.

use chrono::Utc;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use rolesync_core::Error;
use tracing::error;

use crate::types::ReconciliationStats;

/// Receives the outcome of every cycle.
pub trait MetricsSink: Send + Sync {
    /// A cycle ran to completion (possibly with per-unit failures).
    fn record_cycle(&self, stats: &ReconciliationStats, users_managed: usize, roles_managed: usize);

    /// A cycle was aborted before any change.
    fn record_aborted_cycle(&self, error: &Error);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_cycle(&self, _: &ReconciliationStats, _: usize, _: usize) {}

    fn record_aborted_cycle(&self, _: &Error) {}
}

/// Counters and gauges registered under the `rolesync` prefix.
///
/// Counters get the `_total` suffix from the encoder.
#[derive(Debug)]
pub struct PrometheusMetrics {
    registry: Registry,
    reconciliations: Counter,
    drift: Counter,
    errors: Counter,
    users_managed: Gauge,
    roles_managed: Gauge,
    last_success: Gauge,
    last_error: Gauge,
}

fn as_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn as_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl PrometheusMetrics {
    #[must_use]
    pub fn new() -> Self {
        let mut registry = Registry::with_prefix("rolesync");
        let reconciliations = Counter::default();
        let drift = Counter::default();
        let errors = Counter::default();
        let users_managed = Gauge::default();
        let roles_managed = Gauge::default();
        let last_success = Gauge::default();
        let last_error = Gauge::default();

        registry.register(
            "reconciliations",
            "Total number of reconciliation cycles",
            reconciliations.clone(),
        );
        registry.register("drift", "Total drift detections", drift.clone());
        registry.register("errors", "Total errors encountered", errors.clone());
        registry.register(
            "users_managed",
            "Current number of managed users",
            users_managed.clone(),
        );
        registry.register(
            "roles_managed",
            "Current number of managed roles",
            roles_managed.clone(),
        );
        registry.register(
            "last_success_timestamp_seconds",
            "Unix time of the last cycle without errors",
            last_success.clone(),
        );
        registry.register(
            "last_error_timestamp_seconds",
            "Unix time of the last cycle with errors",
            last_error.clone(),
        );

        Self {
            registry,
            reconciliations,
            drift,
            errors,
            users_managed,
            roles_managed,
            last_success,
            last_error,
        }
    }

    pub fn reconciliations_total(&self) -> u64 {
        self.reconciliations.get()
    }

    pub fn drift_total(&self) -> u64 {
        self.drift.get()
    }

    pub fn errors_total(&self) -> u64 {
        self.errors.get()
    }

    /// Encode the registry in the OpenMetrics text format.
    ///
    /// # Errors
    ///
    /// Returns the formatter error when encoding fails.
    pub fn render(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry).inspect_err(|e| {
            error!(error = %e, "Failed to encode metrics");
        })?;
        Ok(buf)
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn record_cycle(&self, stats: &ReconciliationStats, users_managed: usize, roles_managed: usize) {
        let now = Utc::now().timestamp();
        self.reconciliations.inc();
        self.drift.inc_by(as_u64(stats.drift_detected));
        self.errors.inc_by(as_u64(stats.errors));
        self.users_managed.set(as_i64(users_managed));
        self.roles_managed.set(as_i64(roles_managed));

        if stats.errors == 0 {
            self.last_success.set(now);
        } else {
            self.last_error.set(now);
        }
    }

    fn record_aborted_cycle(&self, _error: &Error) {
        self.reconciliations.inc();
        self.errors.inc();
        self.last_error.set(Utc::now().timestamp());
    }
}
