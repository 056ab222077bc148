//! Behaviour of full reconciliation cycles against the in-memory gateway.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rolesync_core::{
    AppliedSnapshot, AppliedUser, DesiredState, Error, ErrorKind, Password, Result, UserSpec,
};
use rolesync_gateway::{DatabaseGateway, FaultTarget, InMemoryGateway, Operation, UserTransaction};
use rolesync_reconciler::shutdown;
use rolesync_reconciler::{
    InMemoryCredentialResolver, InMemoryDesiredStateProvider, InMemoryStateStore,
    PrometheusMetrics, ReconcilerBuilder, ReconciliationStats, RetryPolicy, ShutdownSignal,
};

struct Harness {
    gateway: InMemoryGateway,
    provider: Arc<InMemoryDesiredStateProvider>,
    credentials: Arc<InMemoryCredentialResolver>,
    store: Arc<InMemoryStateStore>,
    metrics: Arc<PrometheusMetrics>,
    dry_run: bool,
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        base: 2.0,
        unit: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
    }
}

fn bob_writer() -> UserSpec {
    UserSpec::new("bob", "app").with_role("writer")
}

fn grant(user: &str, role: &str) -> Operation {
    Operation::Grant {
        user: user.to_string(),
        role: role.to_string(),
    }
}

fn revoke(user: &str, role: &str) -> Operation {
    Operation::Revoke {
        user: user.to_string(),
        role: role.to_string(),
    }
}

fn position(ops: &[Operation], wanted: &Operation) -> Option<usize> {
    ops.iter().position(|op| op == wanted)
}

impl Harness {
    /// Every desired user gets a password.
    fn new(gateway: InMemoryGateway, specs: Vec<UserSpec>) -> Self {
        let users: Vec<String> = specs.iter().map(|s| s.username.clone()).collect();
        let users: Vec<&str> = users.iter().map(String::as_str).collect();
        Self::with_passwords(gateway, specs, &users)
    }

    fn with_passwords(gateway: InMemoryGateway, specs: Vec<UserSpec>, users: &[&str]) -> Self {
        let credentials = users
            .iter()
            .fold(InMemoryCredentialResolver::new(), |resolver, user| {
                resolver.with_password(*user, format!("{user}-pw"))
            });
        Self {
            gateway,
            provider: Arc::new(InMemoryDesiredStateProvider::new(specs)),
            credentials: Arc::new(credentials),
            store: Arc::new(InMemoryStateStore::new()),
            metrics: Arc::new(PrometheusMetrics::new()),
            dry_run: false,
        }
    }

    fn with_snapshot(mut self, snapshot: AppliedSnapshot) -> Self {
        self.store = Arc::new(InMemoryStateStore::with_snapshot(snapshot));
        self
    }

    fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    fn builder(&self) -> ReconcilerBuilder {
        ReconcilerBuilder::new()
            .with_gateway(Arc::new(self.gateway.clone()))
            .with_desired_provider(self.provider.clone())
            .with_credentials(self.credentials.clone())
            .with_state_store(self.store.clone())
            .with_metrics(self.metrics.clone())
            .retry(fast_retry())
            .dry_run(self.dry_run)
    }

    async fn cycle(&self) -> Result<ReconciliationStats> {
        self.builder()
            .build()?
            .reconcile_once(&ShutdownSignal::never())
            .await
    }
}

fn applied_bob(roles: &[&str], revision: &str) -> AppliedSnapshot {
    let mut applied = AppliedSnapshot::new();
    applied.insert(
        "bob",
        AppliedUser {
            roles: roles.iter().map(|r| (*r).to_string()).collect(),
            credential_revision: Some(revision.to_string()),
        },
    );
    applied
}

/// Releases its slot when the transaction commits or is dropped.
struct OpenSlot(Arc<AtomicUsize>);

impl Drop for OpenSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory gateway that tracks how many user transactions are open at once.
#[derive(Clone, Default)]
struct CountingGateway {
    inner: InMemoryGateway,
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct CountingTransaction {
    inner: Box<dyn UserTransaction>,
    slot: OpenSlot,
}

#[async_trait]
impl DatabaseGateway for CountingGateway {
    async fn list_roles(&self) -> Result<BTreeSet<String>> {
        self.inner.list_roles().await
    }

    async fn list_users(&self) -> Result<BTreeSet<String>> {
        self.inner.list_users().await
    }

    async fn list_memberships(&self) -> Result<BTreeMap<String, BTreeSet<String>>> {
        self.inner.list_memberships().await
    }

    async fn create_role(&self, name: &str) -> Result<()> {
        self.inner.create_role(name).await
    }

    async fn drop_role(&self, name: &str) -> Result<()> {
        self.inner.drop_role(name).await
    }

    async fn begin(&self) -> Result<Box<dyn UserTransaction>> {
        let inner = self.inner.begin().await?;
        let open = self.open.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        self.peak.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(CountingTransaction {
            inner,
            slot: OpenSlot(self.open.clone()),
        }))
    }
}

#[async_trait]
impl UserTransaction for CountingTransaction {
    async fn create_user(&mut self, name: &str, password: &Password) -> Result<()> {
        // Hold the transaction open long enough for others to start.
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.inner.create_user(name, password).await
    }

    async fn set_password(&mut self, name: &str, password: &Password) -> Result<()> {
        self.inner.set_password(name, password).await
    }

    async fn drop_user(&mut self, name: &str) -> Result<()> {
        self.inner.drop_user(name).await
    }

    async fn grant_role(&mut self, user: &str, role: &str) -> Result<()> {
        self.inner.grant_role(user, role).await
    }

    async fn revoke_role(&mut self, user: &str, role: &str) -> Result<()> {
        self.inner.revoke_role(user, role).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { inner, slot } = *self;
        let result = inner.commit().await;
        drop(slot);
        result
    }
}

fn snapshot_of(specs: Vec<UserSpec>) -> AppliedSnapshot {
    AppliedSnapshot::from_desired(&DesiredState::from_specs(specs).unwrap())
}

// ===== Behavior-Driven Tests =====

/// Given an empty server and a desired user bob with role writer
/// When one cycle runs
/// Then the role, the user and the grant are applied in that order
/// And the snapshot records bob with writer
#[tokio::test]
async fn new_user_end_to_end() {
    let harness = Harness::new(InMemoryGateway::new(), vec![bob_writer()]);

    let stats = harness.cycle().await.unwrap();

    assert_eq!(stats.users_created, 1);
    assert_eq!(stats.roles_created, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(
        harness.gateway.operations(),
        vec![
            Operation::CreateRole("writer".to_string()),
            Operation::CreateUser("bob".to_string()),
            grant("bob", "writer"),
        ]
    );
    assert_eq!(
        harness.store.snapshot().await,
        Some(snapshot_of(vec![bob_writer()]))
    );
    assert_eq!(
        harness.gateway.password_of("bob").map(|p| p.expose().to_string()),
        Some("bob-pw".to_string())
    );
}

/// Given a converged system
/// When a second cycle runs
/// Then it issues no statements and reports converged
#[tokio::test]
async fn second_cycle_is_idempotent() {
    let harness = Harness::new(InMemoryGateway::new(), vec![bob_writer()]);
    assert!(harness.cycle().await.is_ok());
    harness.gateway.clear_operations();

    let stats = harness.cycle().await;
    assert!(stats.as_ref().is_ok_and(ReconciliationStats::converged), "{stats:?}");
    assert!(harness.gateway.operations().is_empty());
}

/// Given several users sharing new roles
/// When one cycle runs
/// Then every role is created before any grant of it
#[tokio::test]
async fn roles_exist_before_any_grant() {
    let harness = Harness::new(
        InMemoryGateway::new(),
        vec![
            UserSpec::new("alice", "app").with_roles(["reader", "writer"]),
            UserSpec::new("bob", "app").with_role("writer"),
            UserSpec::new("carol", "app").with_roles(["auditor", "reader"]),
        ],
    );
    assert!(harness.cycle().await.is_ok());

    let ops = harness.gateway.operations();
    for op in &ops {
        if let Operation::Grant { role, .. } = op {
            let created = position(&ops, &Operation::CreateRole(role.clone()));
            let granted = position(&ops, op);
            assert!(created.is_some());
            assert!(created < granted, "{role} granted before created");
        }
    }
}

/// Given a grant that fails permanently
/// When bob is created
/// Then bob does not exist at all: create and grant commit together
#[tokio::test]
async fn user_creation_is_atomic() {
    let harness = Harness::new(InMemoryGateway::new(), vec![bob_writer()]);
    harness.gateway.fail(
        FaultTarget::Grant {
            user: "bob".to_string(),
            role: "writer".to_string(),
        },
        Error::permission_denied("permission denied to grant role"),
        1,
    );

    let stats = harness.cycle().await.unwrap();

    assert_eq!(stats.users_created, 0);
    assert_eq!(stats.errors, 1);
    assert!(!harness.gateway.server_state().users.contains("bob"));
    assert_eq!(
        harness.gateway.operations(),
        vec![Operation::CreateRole("writer".to_string())]
    );

    // The next cycle picks bob up again.
    let stats = harness.cycle().await;
    assert_eq!(stats.map(|s| s.users_created).ok(), Some(1));
    assert!(harness.gateway.server_state().users.contains("bob"));
}

/// Given three new users and no credential for carol
/// When one cycle runs
/// Then alice and bob are created, carol is skipped
/// And exactly one error is reported against carol
#[tokio::test]
async fn missing_credential_is_isolated() {
    let specs = vec![
        UserSpec::new("alice", "app").with_role("reader"),
        UserSpec::new("bob", "app").with_role("reader"),
        UserSpec::new("carol", "app").with_role("reader"),
    ];
    let harness = Harness::with_passwords(InMemoryGateway::new(), specs, &["alice", "bob"]);

    let stats = harness.cycle().await.unwrap();

    assert_eq!(stats.users_created, 2);
    assert_eq!(stats.errors, 1);
    let failure = stats.failures.first();
    assert_eq!(failure.map(|f| f.target.as_str()), Some("carol"));
    assert_eq!(failure.map(|f| f.kind), Some(ErrorKind::CredentialUnavailable));

    let users = harness.gateway.server_state().users;
    assert!(users.contains("alice") && users.contains("bob"));
    assert!(!users.contains("carol"));

    // Once the secret appears carol converges.
    harness.credentials.set("carol", "carol-pw").await;
    let stats = harness.cycle().await;
    assert_eq!(stats.map(|s| (s.users_created, s.errors)).ok(), Some((1, 0)));
}

/// Given alice applied with reader
/// And reader revoked out-of-band
/// When one cycle runs
/// Then drift is counted once and reader is granted again
#[tokio::test]
async fn out_of_band_revoke_is_corrected() {
    let specs = vec![UserSpec::new("alice", "app").with_role("reader")];
    let gateway = InMemoryGateway::new().with_user("alice", ["reader"]);
    gateway.revoke_out_of_band("alice", "reader");
    let harness = Harness::new(gateway, specs.clone()).with_snapshot(snapshot_of(specs));

    let stats = harness.cycle().await.unwrap();

    assert_eq!(stats.drift_detected, 1);
    assert_eq!(stats.users_updated, 1);
    assert_eq!(harness.gateway.operations(), vec![grant("alice", "reader")]);
    assert_eq!(
        harness.gateway.server_state().memberships.get("alice").cloned(),
        Some(["reader".to_string()].into())
    );
}

/// Given alice applied with reader
/// And alice dropped out-of-band
/// When one cycle runs
/// Then drift is counted and alice is recreated with reader
#[tokio::test]
async fn out_of_band_drop_is_corrected() {
    let specs = vec![UserSpec::new("alice", "app").with_role("reader")];
    let gateway = InMemoryGateway::new().with_user("alice", ["reader"]);
    gateway.drop_user_out_of_band("alice");
    let harness = Harness::new(gateway, specs.clone()).with_snapshot(snapshot_of(specs));

    let stats = harness.cycle().await;
    assert_eq!(
        stats.map(|s| (s.drift_detected, s.users_created)).ok(),
        Some((1, 1))
    );
}

/// Given alice holds legacy and should hold reader instead
/// When one cycle runs
/// Then legacy is revoked before it is dropped
#[tokio::test]
async fn legacy_role_dropped_after_revoke() {
    let gateway = InMemoryGateway::new().with_user("alice", ["legacy"]);
    let harness = Harness::new(gateway, vec![UserSpec::new("alice", "app").with_role("reader")]);

    let stats = harness.cycle().await.unwrap();

    assert_eq!(stats.roles_created, 1);
    assert_eq!(stats.roles_deleted, 1);
    assert_eq!(stats.users_updated, 1);

    let ops = harness.gateway.operations();
    assert_eq!(
        ops,
        vec![
            Operation::CreateRole("reader".to_string()),
            revoke("alice", "legacy"),
            grant("alice", "reader"),
            Operation::DropRole("legacy".to_string()),
        ]
    );
}

/// Given the revoke of legacy fails
/// When one cycle runs
/// Then legacy is not dropped while alice still holds it
#[tokio::test]
async fn role_drop_deferred_while_still_held() {
    let gateway = InMemoryGateway::new().with_user("alice", ["legacy"]);
    gateway.fail(
        FaultTarget::Revoke {
            user: "alice".to_string(),
            role: "legacy".to_string(),
        },
        Error::permission_denied("must have admin option on role"),
        1,
    );
    let harness = Harness::new(gateway, vec![UserSpec::new("alice", "app")]);

    let stats = harness.cycle().await.unwrap();

    assert_eq!(stats.errors, 1);
    assert_eq!(stats.roles_deferred, 1);
    assert_eq!(stats.roles_deleted, 0);
    assert!(harness.gateway.server_state().roles.contains("legacy"));
}

/// Given a user that is no longer desired and a protected login role
/// When one cycle runs
/// Then the user is dropped and the protected role is left alone
#[tokio::test]
async fn undesired_user_is_deleted() {
    let gateway = InMemoryGateway::new()
        .with_protected_user("postgres")
        .with_user("mallory", ["reader"]);
    let harness = Harness::new(gateway, Vec::new());

    let stats = harness.cycle().await.unwrap();

    assert_eq!(stats.users_deleted, 1);
    assert_eq!(stats.roles_deleted, 1);
    let ops = harness.gateway.operations();
    assert!(
        position(&ops, &Operation::DropUser("mallory".to_string()))
            < position(&ops, &Operation::DropRole("reader".to_string()))
    );
    assert!(harness.gateway.server_state().users.contains("postgres"));
}

/// Given role creation fails transiently twice
/// When one cycle runs
/// Then the unit is retried and the cycle succeeds
#[tokio::test]
async fn transient_failure_is_retried() {
    let harness = Harness::new(InMemoryGateway::new(), vec![bob_writer()]);
    let target = FaultTarget::CreateRole("writer".to_string());
    harness
        .gateway
        .fail(target.clone(), Error::database_unavailable("connection reset"), 2);

    let stats = harness.cycle().await;
    assert_eq!(stats.map(|s| (s.roles_created, s.errors)).ok(), Some((1, 0)));
    assert_eq!(harness.gateway.fault_hits(&target), 2);
}

/// Given user creation fails with a permission error
/// When one cycle runs
/// Then the unit is tried once and reported as permission denied
#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let harness = Harness::new(InMemoryGateway::new(), vec![bob_writer()]);
    let target = FaultTarget::CreateUser("bob".to_string());
    harness
        .gateway
        .fail(target.clone(), Error::permission_denied("permission denied to create role"), 5);

    let stats = harness.cycle().await.unwrap();

    assert_eq!(harness.gateway.fault_hits(&target), 1);
    assert_eq!(stats.errors, 1);
    assert_eq!(
        stats.failures.first().map(|f| (f.kind, f.action)),
        Some((ErrorKind::PermissionDenied, "create_user"))
    );
}

/// Given a desired state with a duplicate username
/// When one cycle runs
/// Then the cycle aborts with InvalidSpec before any statement
#[tokio::test]
async fn invalid_spec_makes_no_changes() {
    let gateway = InMemoryGateway::new().with_user("mallory", ["legacy"]);
    let harness = Harness::new(gateway, vec![bob_writer(), bob_writer()]);

    let result = harness.cycle().await;
    assert!(matches!(result, Err(Error::InvalidSpec { .. })));
    assert!(harness.gateway.operations().is_empty());
    assert_eq!(harness.store.snapshot().await, None);
    assert_eq!(harness.metrics.errors_total(), 1);
}

/// Given an unavailable desired-state source
/// When one cycle runs
/// Then the cycle aborts without touching the database
#[tokio::test]
async fn unavailable_spec_makes_no_changes() {
    let gateway = InMemoryGateway::new().with_user("mallory", ["legacy"]);
    let harness = Harness::new(gateway, Vec::new());
    harness
        .provider
        .fail_with(Error::spec_unavailable("users.yaml missing"))
        .await;

    let result = harness.cycle().await;
    assert!(matches!(result, Err(Error::SpecUnavailable { .. })));
    assert!(harness.gateway.operations().is_empty());
}

/// Given dry-run mode
/// When one cycle runs
/// Then the stats describe the changes but nothing is written or saved
#[tokio::test]
async fn dry_run_writes_nothing() {
    let specs = vec![bob_writer(), UserSpec::new("carol", "app")];
    let harness = Harness::with_passwords(InMemoryGateway::new(), specs, &["bob"]).dry_run();

    let stats = harness.cycle().await.unwrap();

    assert!(stats.dry_run);
    assert_eq!(stats.roles_created, 1);
    assert_eq!(stats.users_created, 1);
    // Missing secrets are still reported.
    assert_eq!(
        stats.failures.first().map(|f| f.kind),
        Some(ErrorKind::CredentialUnavailable)
    );
    assert!(harness.gateway.operations().is_empty());
    assert_eq!(harness.store.snapshot().await, None);
}

/// Given role creation keeps failing transiently with long backoff
/// When shutdown is requested during the backoff
/// Then the cycle ends cancelled, no user is created and no snapshot saved
#[tokio::test]
async fn shutdown_cancels_backoff() {
    let harness = Harness::new(InMemoryGateway::new(), vec![bob_writer()]);
    harness.gateway.fail(
        FaultTarget::CreateRole("writer".to_string()),
        Error::database_unavailable("connection refused"),
        10,
    );
    let reconciler = harness
        .builder()
        .retry(RetryPolicy {
            max_retries: 5,
            base: 2.0,
            unit: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
        })
        .build()
        .unwrap();

    let (stopper, signal) = shutdown::channel();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stopper.stop();
    });

    let stats = tokio::time::timeout(Duration::from_secs(5), reconciler.reconcile_once(&signal))
        .await
        .expect("cycle did not stop on shutdown")
        .unwrap();

    assert!(stats.cancelled);
    assert_eq!(stats.errors, 0);
    assert!(harness.gateway.operations().is_empty());
    assert_eq!(harness.store.snapshot().await, None);
}

/// Given bob exists and his credential revision changes
/// When one cycle runs
/// Then his password is reset from the current secret
#[tokio::test]
async fn credential_revision_change_resets_password() {
    let gateway = InMemoryGateway::new().with_user("bob", ["writer"]);
    let harness = Harness::new(gateway, vec![bob_writer().with_credential_revision("2")])
        .with_snapshot(applied_bob(&["writer"], "1"));

    let stats = harness.cycle().await;
    assert_eq!(stats.map(|s| s.users_updated).ok(), Some(1));
    assert_eq!(
        harness.gateway.operations(),
        vec![Operation::SetPassword("bob".to_string())]
    );
    assert_eq!(
        harness.gateway.password_of("bob").map(|p| p.expose().to_string()),
        Some("bob-pw".to_string())
    );

    // The new revision is recorded, so the next cycle leaves the password alone.
    harness.gateway.clear_operations();
    assert!(harness.cycle().await.is_ok());
    assert!(harness.gateway.operations().is_empty());
}

/// Given a state store that rejects writes
/// When one cycle runs
/// Then database changes stand and the save failure is reported
#[tokio::test]
async fn snapshot_save_failure_is_reported() {
    let harness = Harness::new(InMemoryGateway::new(), vec![bob_writer()]);
    harness.store.fail_saves(true).await;

    let stats = harness.cycle().await.unwrap();

    assert_eq!(stats.users_created, 1);
    assert_eq!(
        stats.failures.first().map(|f| (f.target.as_str(), f.kind)),
        Some(("snapshot", ErrorKind::StateStoreUnavailable))
    );
    assert!(harness.gateway.server_state().users.contains("bob"));
}

/// Given a completed cycle
/// When metrics are rendered
/// Then the cycle and managed counts are exposed
#[tokio::test]
async fn metrics_reflect_cycle() {
    let harness = Harness::new(InMemoryGateway::new(), vec![bob_writer()]);
    assert!(harness.cycle().await.is_ok());

    assert_eq!(harness.metrics.reconciliations_total(), 1);
    let text = harness.metrics.render().unwrap();
    assert!(text.contains("rolesync_users_managed 1\n"));
    assert!(text.contains("rolesync_roles_managed 1\n"));
    assert!(text.contains("rolesync_errors_total 0\n"));
}

/// Given introspection fails transiently once
/// When one cycle runs
/// Then the query is retried and the cycle proceeds
#[tokio::test]
async fn introspection_is_retried() {
    let harness = Harness::new(InMemoryGateway::new(), vec![bob_writer()]);
    harness.gateway.fail(
        FaultTarget::ListMemberships,
        Error::serialization_conflict("40001", "could not serialize access"),
        1,
    );

    let stats = harness.cycle().await;
    assert_eq!(stats.map(|s| s.users_created).ok(), Some(1));
    assert_eq!(harness.gateway.fault_hits(&FaultTarget::ListMemberships), 1);
}

/// Given a users.yaml, a mounted secret and a JSON state file
/// When one cycle runs against the file adapters
/// Then app_reader is created from the mounted password
/// And the state file holds the applied snapshot
#[tokio::test]
async fn file_adapters_end_to_end() {
    use rolesync_reconciler::{JsonFileStateStore, SecretsDirResolver, StateStore, YamlFileProvider};

    let dir = tempfile::tempdir().unwrap();

    let users_file = dir.path().join("users.yaml");
    let secrets = dir.path().join("secrets");
    let secret_dir = secrets.join("user-app-reader-secret");
    let state_file = dir.path().join("users_state.json");
    tokio::fs::write(&users_file, "users:\n  - username: app_reader\n    roles: [reader]\n")
        .await
        .unwrap();
    tokio::fs::create_dir_all(&secret_dir).await.unwrap();
    tokio::fs::write(secret_dir.join("password"), "r3ad\n").await.unwrap();

    let gateway = InMemoryGateway::new();
    let store = Arc::new(JsonFileStateStore::new(&state_file));
    let reconciler = ReconcilerBuilder::new()
        .with_gateway(Arc::new(gateway.clone()))
        .with_desired_provider(Arc::new(YamlFileProvider::new(&users_file, "app")))
        .with_credentials(Arc::new(SecretsDirResolver::new(&secrets)))
        .with_state_store(store.clone())
        .retry(fast_retry())
        .build()
        .unwrap();

    let stats = reconciler.reconcile_once(&ShutdownSignal::never()).await;
    assert_eq!(
        stats.map(|s| (s.users_created, s.roles_created, s.errors)).ok(),
        Some((1, 1, 0))
    );
    assert_eq!(
        gateway.password_of("app_reader").map(|p| p.expose().to_string()),
        Some("r3ad".to_string())
    );

    let saved = store.load().await;
    assert_eq!(
        saved.ok().and_then(|s| s.get("app_reader").map(|u| u.roles.clone())),
        Some(["reader".to_string()].into())
    );
}

/// Given role writer cannot be created
/// And bob is new and alice already exists, both wanting writer
/// When one cycle runs
/// Then no grant of writer is attempted and both units are reported
/// And carol, who only wants reader, is created
#[tokio::test]
async fn grants_wait_for_role_creation() {
    let gateway = InMemoryGateway::new().with_user("alice", ["reader"]);
    let specs = vec![
        bob_writer(),
        UserSpec::new("alice", "app").with_roles(["reader", "writer"]),
        UserSpec::new("carol", "app").with_role("reader"),
    ];
    let harness = Harness::new(gateway, specs);
    let create_writer = FaultTarget::CreateRole("writer".to_string());
    harness.gateway.fail(
        create_writer.clone(),
        Error::permission_denied("permission denied to create role"),
        1,
    );
    // Transient, so the grants succeed on retry once they are attempted.
    let grants = [
        FaultTarget::Grant {
            user: "bob".to_string(),
            role: "writer".to_string(),
        },
        FaultTarget::Grant {
            user: "alice".to_string(),
            role: "writer".to_string(),
        },
    ];
    for target in &grants {
        harness
            .gateway
            .fail(target.clone(), Error::database_unavailable("connection reset"), 1);
    }

    let stats = harness.cycle().await.unwrap();

    assert_eq!(harness.gateway.fault_hits(&create_writer), 1);
    for target in &grants {
        assert_eq!(harness.gateway.fault_hits(target), 0, "{target:?} attempted");
    }
    assert_eq!(stats.users_created, 1);
    assert_eq!(stats.users_updated, 0);
    assert_eq!(stats.errors, 3);
    for (user, action) in [("bob", "create_user"), ("alice", "update_memberships")] {
        let failure = stats.failures.iter().find(|f| f.target == user).unwrap();
        assert_eq!(failure.action, action);
        assert!(failure.message.contains("writer"), "{}", failure.message);
    }
    let users = harness.gateway.server_state().users;
    assert!(users.contains("carol"));
    assert!(!users.contains("bob"));

    // The role can be created now; both users converge.
    let stats = harness.cycle().await.unwrap();
    assert_eq!(
        (stats.roles_created, stats.users_created, stats.users_updated, stats.errors),
        (1, 1, 1, 0)
    );
    for target in &grants {
        assert_eq!(harness.gateway.fault_hits(target), 1);
    }
}

/// Given bob's credential revision changed and his secret is missing
/// And bob should also gain reader
/// When one cycle runs
/// Then reader is granted and only the rotation is reported
/// And once the secret appears the next cycle rotates the password
#[tokio::test]
async fn rotation_without_secret_still_applies_memberships() {
    let gateway = InMemoryGateway::new().with_user("bob", ["writer"]);
    let specs = vec![
        UserSpec::new("bob", "app")
            .with_roles(["reader", "writer"])
            .with_credential_revision("2"),
    ];
    let harness = Harness::with_passwords(gateway, specs, &[])
        .with_snapshot(applied_bob(&["writer"], "1"));

    let stats = harness.cycle().await.unwrap();

    assert_eq!(stats.users_updated, 1);
    assert_eq!(stats.errors, 1);
    assert_eq!(
        stats.failures.first().map(|f| (f.target.as_str(), f.action, f.kind)),
        Some(("bob", "rotate_password", ErrorKind::CredentialUnavailable))
    );
    assert_eq!(
        harness.gateway.operations(),
        vec![Operation::CreateRole("reader".to_string()), grant("bob", "reader")]
    );
    assert_eq!(
        harness.gateway.password_of("bob").map(|p| p.expose().to_string()),
        Some("seeded".to_string())
    );
    let saved = harness.store.snapshot().await.unwrap();
    let bob = saved.get("bob").unwrap();
    assert_eq!(bob.credential_revision.as_deref(), Some("1"));
    assert_eq!(bob.roles.len(), 2);

    harness.credentials.set("bob", "new-pw").await;
    harness.gateway.clear_operations();
    let stats = harness.cycle().await.unwrap();

    assert_eq!((stats.users_updated, stats.errors), (1, 0));
    assert_eq!(
        harness.gateway.operations(),
        vec![Operation::SetPassword("bob".to_string())]
    );
    assert_eq!(
        harness.gateway.password_of("bob").map(|p| p.expose().to_string()),
        Some("new-pw".to_string())
    );
    let saved = harness.store.snapshot().await.unwrap();
    assert_eq!(
        saved.get("bob").and_then(|u| u.credential_revision.as_deref()),
        Some("2")
    );
}

/// Given bob's rotation transaction fails to commit
/// When one cycle runs
/// Then the previous revision is kept and the next cycle rotates again
#[tokio::test]
async fn failed_rotation_is_attempted_again() {
    let gateway = InMemoryGateway::new().with_user("bob", ["writer"]);
    let harness = Harness::new(gateway, vec![bob_writer().with_credential_revision("2")])
        .with_snapshot(applied_bob(&["writer"], "1"));
    harness.gateway.fail(
        FaultTarget::Commit("bob".to_string()),
        Error::permission_denied("must be superuser to alter superuser roles"),
        1,
    );

    let stats = harness.cycle().await.unwrap();
    assert_eq!((stats.users_updated, stats.errors), (0, 1));
    let saved = harness.store.snapshot().await.unwrap();
    assert_eq!(
        saved.get("bob").and_then(|u| u.credential_revision.as_deref()),
        Some("1")
    );

    let stats = harness.cycle().await.unwrap();
    assert_eq!((stats.users_updated, stats.errors), (1, 0));
    assert_eq!(
        harness.gateway.password_of("bob").map(|p| p.expose().to_string()),
        Some("bob-pw".to_string())
    );
}

/// Given six new users and a concurrency limit of two
/// When one cycle runs
/// Then never more than two user transactions are open at once
#[tokio::test]
async fn user_transactions_respect_concurrency_limit() {
    let specs = (0..6)
        .map(|n| UserSpec::new(format!("user{n}"), "app").with_role("reader"))
        .collect::<Vec<_>>();
    let harness = Harness::new(InMemoryGateway::new(), specs);
    let counting = CountingGateway {
        inner: harness.gateway.clone(),
        ..CountingGateway::default()
    };

    let stats = harness
        .builder()
        .with_gateway(Arc::new(counting.clone()))
        .max_concurrency(2)
        .build()
        .unwrap()
        .reconcile_once(&ShutdownSignal::never())
        .await
        .unwrap();

    assert_eq!((stats.users_created, stats.errors), (6, 0));
    assert_eq!(counting.peak.load(Ordering::SeqCst), 2);
    assert_eq!(counting.open.load(Ordering::SeqCst), 0);
}

/// Given the pool is exhausted for the first two transactions
/// When one cycle runs
/// Then the unit is retried and bob is created without errors
#[tokio::test]
async fn pool_exhaustion_is_retried() {
    let harness = Harness::new(InMemoryGateway::new(), vec![bob_writer()]);
    harness.gateway.fail(
        FaultTarget::Begin,
        Error::PoolExhausted {
            waited: Duration::from_secs(5),
        },
        2,
    );

    let stats = harness.cycle().await.unwrap();

    assert_eq!((stats.users_created, stats.errors), (1, 0));
    assert_eq!(harness.gateway.fault_hits(&FaultTarget::Begin), 2);
    assert!(harness.gateway.server_state().users.contains("bob"));
}
