//! Reconciler implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use rolesync_core::{
    AppliedSnapshot, Config, DesiredState, Error, ObservedState, Password, Result, ResultExt,
    UserSpec,
};
use rolesync_gateway::{DatabaseGateway, DryRunGateway};
use tracing::{debug, error, info, warn};

use crate::credentials::CredentialResolver;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::plan::{MembershipUpdate, ReconcilePlan};
use crate::provider::DesiredStateProvider;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownSignal;
use crate::store::{InMemoryStateStore, StateStore};
use crate::types::{ReconciliationStats, UnitFailure};

/// Configuration for the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Narrate writes instead of applying them; never persist the snapshot.
    pub dry_run: bool,
    /// Retry policy applied to every unit.
    pub retry: RetryPolicy,
    /// Maximum user transactions in flight at once.
    pub max_concurrency: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            retry: RetryPolicy::default(),
            max_concurrency: 5,
        }
    }
}

impl ReconcilerConfig {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            dry_run: config.reconcile.dry_run,
            retry: RetryPolicy::from_config(config),
            max_concurrency: usize::try_from(config.pool.max_connections).unwrap_or(1),
        }
    }
}

/// Memberships each user will hold once this cycle's user phases settle.
type Memberships = BTreeMap<String, BTreeSet<String>>;

/// What the phases learn while they run.
struct Progress {
    effective: Memberships,
    /// Roles whose creation failed; no unit may grant them this cycle.
    failed_roles: BTreeSet<String>,
    /// Users whose password rotation did not commit.
    unrotated: BTreeSet<String>,
}

impl Progress {
    fn new(effective: Memberships) -> Self {
        Self {
            effective,
            failed_roles: BTreeSet::new(),
            unrotated: BTreeSet::new(),
        }
    }

    fn uncreated_role<'r>(&self, grants: &'r BTreeSet<String>) -> Option<&'r String> {
        grants.iter().find(|role| self.failed_roles.contains(*role))
    }

    /// The snapshot to persist: desired state, except that a rotation which
    /// did not commit keeps its previous revision so it is attempted again.
    fn snapshot(&self, desired: &DesiredState, last_applied: &AppliedSnapshot) -> AppliedSnapshot {
        self.unrotated
            .iter()
            .fold(AppliedSnapshot::from_desired(desired), |mut snapshot, username| {
                snapshot.keep_credential_revision(username, last_applied);
                snapshot
            })
    }
}

/// Result of the password half of a membership update.
enum Rotation {
    NotRequested,
    Applied,
    /// No secret could be resolved; the membership delta was still applied.
    Skipped(Error),
}

/// Control loop body: diff, ordered apply, snapshot, metrics.
pub struct Reconciler {
    gateway: Arc<dyn DatabaseGateway>,
    desired: Arc<dyn DesiredStateProvider>,
    credentials: Arc<dyn CredentialResolver>,
    store: Arc<dyn StateStore>,
    metrics: Arc<dyn MetricsSink>,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Run one reconciliation cycle.
    ///
    /// Per-unit failures are recorded in the returned stats; the cycle itself
    /// only fails when it cannot start.
    ///
    /// # Errors
    ///
    /// Returns `SpecUnavailable` / `InvalidSpec` from the desired-state
    /// provider, or the last error of an introspection query that exhausted
    /// its retries. No change has been made to the database in either case.
    pub async fn reconcile_once(&self, shutdown: &ShutdownSignal) -> Result<ReconciliationStats> {
        let started = Instant::now();
        let mut stats = ReconciliationStats::new(self.config.dry_run);

        let desired = self
            .desired
            .desired_state()
            .await
            .inspect_error(|e| self.metrics.record_aborted_cycle(e))?;

        let observed = match self.observe(shutdown).await {
            Ok(observed) => observed,
            Err(Error::Cancelled) => {
                stats.cancelled = true;
                stats.duration = started.elapsed();
                return Ok(stats);
            }
            Err(e) => {
                self.metrics.record_aborted_cycle(&e);
                return Err(e);
            }
        };

        let last_applied = self.store.load().await.or_else_logged(
            "Applied snapshot unreadable, drift detection disabled this cycle",
            AppliedSnapshot::new,
        );

        info!(
            desired_users = desired.len(),
            observed_users = observed.users.len(),
            observed_roles = observed.roles.len(),
            dry_run = self.config.dry_run,
            "Starting reconciliation"
        );

        let plan = ReconcilePlan::compute(&desired, &observed, &last_applied);

        stats.drift_detected = plan.drift.len();
        for finding in &plan.drift {
            warn!(
                user = %finding.username,
                applied = ?finding.applied,
                observed = ?finding.observed,
                "Drift detected, restoring desired memberships"
            );
        }
        for action in plan.actions() {
            debug!(action = %action, "Planned action");
        }

        let mut progress = Progress::new(observed.memberships.clone());
        self.apply(&plan, &desired, &mut progress, &mut stats, shutdown)
            .await;

        if stats.cancelled {
            info!("Shutdown requested, applied snapshot not saved for this cycle");
        } else if self.config.dry_run {
            debug!("Dry run, applied snapshot not saved");
        } else if let Err(e) = self.store.save(&progress.snapshot(&desired, &last_applied)).await {
            error!(error = %e, "Failed to save applied snapshot");
            stats.record_failure(UnitFailure::new("snapshot", "save_snapshot", &e));
        }

        stats.duration = started.elapsed();
        self.metrics
            .record_cycle(&stats, desired.len(), desired.role_set().len());
        log_summary(&stats);

        Ok(stats)
    }

    /// Read roles, users and memberships, each under the retry policy.
    async fn observe(&self, shutdown: &ShutdownSignal) -> Result<ObservedState> {
        let retry = &self.config.retry;
        let gateway = &self.gateway;

        let roles = retry
            .run("list_roles", shutdown, move || gateway.list_roles())
            .await?;
        let users = retry
            .run("list_users", shutdown, move || gateway.list_users())
            .await?;
        let memberships = retry
            .run("list_memberships", shutdown, move || gateway.list_memberships())
            .await?;

        Ok(ObservedState {
            roles,
            users,
            memberships,
        })
    }

    /// Run the phases in order. Each phase starts only after the previous one
    /// has settled; shutdown skips every phase not yet started.
    async fn apply(
        &self,
        plan: &ReconcilePlan,
        desired: &DesiredState,
        progress: &mut Progress,
        stats: &mut ReconciliationStats,
        shutdown: &ShutdownSignal,
    ) {
        // (a) roles before any user references them
        for role in &plan.roles_to_create {
            let gateway = &self.gateway;
            let outcome = self
                .config
                .retry
                .run(role, shutdown, move || gateway.create_role(role))
                .await;
            match outcome {
                Ok(()) => {
                    info!(role = %role, "Created role");
                    stats.roles_created = stats.roles_created.saturating_add(1);
                }
                Err(e) => {
                    if !matches!(e, Error::Cancelled) {
                        progress.failed_roles.insert(role.clone());
                    }
                    record(stats, role, "create_role", &e);
                }
            }
            if stats.cancelled {
                return;
            }
        }

        // (b) new users, one transaction each
        let mut creates = Vec::with_capacity(plan.users_to_create.len());
        for spec in &plan.users_to_create {
            match progress.uncreated_role(&spec.roles) {
                Some(role) => {
                    record(stats, &spec.username, "create_user", &role_not_created(role));
                }
                None => creates.push(spec),
            }
        }
        let outcomes = self
            .concurrently(creates.into_iter(), move |spec| async move {
                (spec, self.create_user(spec, shutdown).await)
            })
            .await;
        for (spec, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    info!(user = %spec.username, roles = ?spec.roles, "Created user");
                    stats.users_created = stats.users_created.saturating_add(1);
                    progress
                        .effective
                        .insert(spec.username.clone(), spec.roles.clone());
                }
                Err(e) => record(stats, &spec.username, "create_user", &e),
            }
        }
        if stats.cancelled {
            return;
        }

        // (c) membership deltas and password rotations
        let mut updates = Vec::with_capacity(plan.users_to_update.len());
        for update in &plan.users_to_update {
            match progress.uncreated_role(&update.grant) {
                Some(role) => {
                    if update.rotate_password {
                        progress.unrotated.insert(update.username.clone());
                    }
                    record(stats, &update.username, "update_memberships", &role_not_created(role));
                }
                None => updates.push(update),
            }
        }
        let outcomes = self
            .concurrently(updates.into_iter(), move |update| async move {
                (update, self.update_user(update, shutdown).await)
            })
            .await;
        for (update, outcome) in outcomes {
            match outcome {
                Ok(rotation) => {
                    if let Rotation::Skipped(e) = &rotation {
                        progress.unrotated.insert(update.username.clone());
                        record(stats, &update.username, "rotate_password", e);
                    }
                    let rotated = matches!(rotation, Rotation::Applied);
                    if rotated || !update.grant.is_empty() || !update.revoke.is_empty() {
                        info!(
                            user = %update.username,
                            granted = ?update.grant,
                            revoked = ?update.revoke,
                            password_reset = rotated,
                            "Updated user"
                        );
                        stats.users_updated = stats.users_updated.saturating_add(1);
                    }
                    let roles = desired
                        .get(&update.username)
                        .map(|spec| spec.roles.clone())
                        .unwrap_or_default();
                    progress.effective.insert(update.username.clone(), roles);
                }
                Err(e) => {
                    if update.rotate_password {
                        progress.unrotated.insert(update.username.clone());
                    }
                    record(stats, &update.username, "update_memberships", &e);
                }
            }
        }
        if stats.cancelled {
            return;
        }

        // (d) users no longer desired
        let outcomes = self
            .concurrently(plan.users_to_delete.iter(), move |username| async move {
                (username, self.delete_user(username, shutdown).await)
            })
            .await;
        for (username, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    info!(user = %username, "Deleted user");
                    stats.users_deleted = stats.users_deleted.saturating_add(1);
                    progress.effective.remove(username);
                }
                Err(e) => record(stats, username, "delete_user", &e),
            }
        }
        if stats.cancelled {
            return;
        }

        // (e) roles nobody holds any more
        for role in &plan.roles_to_drop {
            let holders = progress
                .effective
                .iter()
                .filter(|(_, roles)| roles.contains(role))
                .map(|(user, _)| user.as_str())
                .collect::<Vec<_>>();
            if !holders.is_empty() {
                info!(role = %role, holders = ?holders, "Role still held, drop deferred");
                stats.roles_deferred = stats.roles_deferred.saturating_add(1);
                continue;
            }

            let gateway = &self.gateway;
            let outcome = self
                .config
                .retry
                .run(role, shutdown, move || gateway.drop_role(role))
                .await;
            match outcome {
                Ok(()) => {
                    info!(role = %role, "Dropped role");
                    stats.roles_deleted = stats.roles_deleted.saturating_add(1);
                }
                Err(e) => record(stats, role, "drop_role", &e),
            }
            if stats.cancelled {
                return;
            }
        }
    }

    /// Run `unit` over `items` with at most `max_concurrency` in flight.
    async fn concurrently<'a, I, T, F, Fut, R>(&self, items: I, unit: F) -> Vec<R>
    where
        I: Iterator<Item = &'a T>,
        T: 'a,
        F: FnMut(&'a T) -> Fut,
        Fut: std::future::Future<Output = R>,
    {
        stream::iter(items)
            .map(unit)
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await
    }

    async fn create_user(&self, spec: &UserSpec, shutdown: &ShutdownSignal) -> Result<()> {
        if shutdown.is_shutdown() {
            return Err(Error::Cancelled);
        }
        let password = self.credentials.resolve(&spec.username).await?;
        let password = &password;
        self.config
            .retry
            .run(&spec.username, shutdown, move || {
                self.apply_create_user(spec, password)
            })
            .await
    }

    async fn apply_create_user(&self, spec: &UserSpec, password: &Password) -> Result<()> {
        let mut tx = self.gateway.begin().await?;
        tx.create_user(&spec.username, password).await?;
        for role in &spec.roles {
            tx.grant_role(&spec.username, role).await?;
        }
        tx.commit().await
    }

    async fn update_user(
        &self,
        update: &MembershipUpdate,
        shutdown: &ShutdownSignal,
    ) -> Result<Rotation> {
        if shutdown.is_shutdown() {
            return Err(Error::Cancelled);
        }
        let (password, rotation) = if update.rotate_password {
            match self.credentials.resolve(&update.username).await {
                Ok(password) => (Some(password), Rotation::Applied),
                Err(e) => (None, Rotation::Skipped(e)),
            }
        } else {
            (None, Rotation::NotRequested)
        };
        if password.is_none() && update.grant.is_empty() && update.revoke.is_empty() {
            return Ok(rotation);
        }

        let password = password.as_ref();
        self.config
            .retry
            .run(&update.username, shutdown, move || {
                self.apply_update(update, password)
            })
            .await?;
        Ok(rotation)
    }

    async fn apply_update(&self, update: &MembershipUpdate, password: Option<&Password>) -> Result<()> {
        let mut tx = self.gateway.begin().await?;
        for role in &update.revoke {
            tx.revoke_role(&update.username, role).await?;
        }
        for role in &update.grant {
            tx.grant_role(&update.username, role).await?;
        }
        if let Some(password) = password {
            tx.set_password(&update.username, password).await?;
        }
        tx.commit().await
    }

    async fn delete_user(&self, username: &str, shutdown: &ShutdownSignal) -> Result<()> {
        if shutdown.is_shutdown() {
            return Err(Error::Cancelled);
        }
        self.config
            .retry
            .run(username, shutdown, move || self.apply_delete(username))
            .await
    }

    async fn apply_delete(&self, username: &str) -> Result<()> {
        let mut tx = self.gateway.begin().await?;
        tx.drop_user(username).await?;
        tx.commit().await
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }
}

fn role_not_created(role: &str) -> Error {
    Error::database("42704", format!("role \"{role}\" could not be created this cycle"))
}

fn record(stats: &mut ReconciliationStats, target: &str, action: &'static str, error: &Error) {
    if matches!(error, Error::Cancelled) {
        stats.cancelled = true;
        return;
    }
    warn!(
        target_name = %target,
        action = action,
        kind = %error.kind(),
        error = %error,
        "Unit failed"
    );
    stats.record_failure(UnitFailure::new(target, action, error));
}

fn log_summary(stats: &ReconciliationStats) {
    info!(
        users_created = stats.users_created,
        users_updated = stats.users_updated,
        users_deleted = stats.users_deleted,
        roles_created = stats.roles_created,
        roles_deleted = stats.roles_deleted,
        roles_deferred = stats.roles_deferred,
        drift_detected = stats.drift_detected,
        errors = stats.errors,
        dry_run = stats.dry_run,
        cancelled = stats.cancelled,
        duration_ms = u64::try_from(stats.duration.as_millis()).unwrap_or(u64::MAX),
        "Reconciliation complete"
    );
}

/// Builder for Reconciler.
pub struct ReconcilerBuilder {
    gateway: Option<Arc<dyn DatabaseGateway>>,
    desired: Option<Arc<dyn DesiredStateProvider>>,
    credentials: Option<Arc<dyn CredentialResolver>>,
    store: Option<Arc<dyn StateStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            gateway: None,
            desired: None,
            credentials: None,
            store: None,
            metrics: None,
            config: ReconcilerConfig::default(),
        }
    }

    #[must_use]
    pub fn with_gateway(mut self, gateway: Arc<dyn DatabaseGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    #[must_use]
    pub fn with_desired_provider(mut self, provider: Arc<dyn DesiredStateProvider>) -> Self {
        self.desired = Some(provider);
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialResolver>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Defaults to an in-memory store.
    #[must_use]
    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Defaults to discarding metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.config.dry_run = enabled;
        self
    }

    #[must_use]
    pub fn max_concurrency(mut self, max: usize) -> Self {
        self.config.max_concurrency = max;
        self
    }

    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    /// Build the reconciler. In dry-run mode the gateway is wrapped so that
    /// writes never reach the database.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the gateway, desired-state provider or
    /// credential resolver is missing, or the concurrency limit is zero.
    pub fn build(self) -> Result<Reconciler> {
        let gateway = self
            .gateway
            .ok_or_else(|| Error::invalid_config("database gateway is required"))?;
        let desired = self
            .desired
            .ok_or_else(|| Error::invalid_config("desired-state provider is required"))?;
        let credentials = self
            .credentials
            .ok_or_else(|| Error::invalid_config("credential resolver is required"))?;
        if self.config.max_concurrency == 0 {
            return Err(Error::invalid_config("max_concurrency must be at least 1"));
        }

        let gateway: Arc<dyn DatabaseGateway> = if self.config.dry_run {
            Arc::new(DryRunGateway::new(gateway))
        } else {
            gateway
        };

        Ok(Reconciler {
            gateway,
            desired,
            credentials,
            store: self
                .store
                .unwrap_or_else(|| Arc::new(InMemoryStateStore::new())),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
            config: self.config,
        })
    }
}

impl Default for ReconcilerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
