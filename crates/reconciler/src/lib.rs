//! Reconciliation of PostgreSQL users and roles against a declared state.
//!
//! Each cycle follows the same pattern:
//!
//! - **Desired State**: the users, their databases and roles, from a provider
//! - **Observed State**: roles, login roles and memberships read from the server
//! - **Applied Snapshot**: what the previous cycle applied, for drift detection
//! - **Plan**: a pure three-way diff of the three
//! - **Apply**: ordered phases of independently retried units
//!
//! # Phases
//!
//! 1. Create missing group roles
//! 2. Create missing users (password and grants in one transaction)
//! 3. Update memberships of existing users (revoke, then grant)
//! 4. Delete users no longer desired
//! 5. Drop group roles no user holds any more
//!
//! A failed unit never rolls back another; it is listed in the cycle's
//! [`ReconciliationStats`] and retried naturally on the next cycle.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use rolesync_core::UserSpec;
//! use rolesync_gateway::InMemoryGateway;
//! use rolesync_reconciler::{
//!     InMemoryCredentialResolver, InMemoryDesiredStateProvider, LoopConfig,
//!     ReconcilerBuilder, ReconciliationLoop,
//! };
//!
//! #[tokio::main]
//! async fn main() -> rolesync_core::Result<()> {
//!     let reconciler = ReconcilerBuilder::new()
//!         .with_gateway(Arc::new(InMemoryGateway::new()))
//!         .with_desired_provider(Arc::new(InMemoryDesiredStateProvider::new(vec![
//!             UserSpec::new("bob", "app").with_role("writer"),
//!         ])))
//!         .with_credentials(Arc::new(
//!             InMemoryCredentialResolver::new().with_password("bob", "s3cret"),
//!         ))
//!         .build()?;
//!
//!     let loop_runner = ReconciliationLoop::new(Arc::new(reconciler), LoopConfig::default());
//!     // loop_runner.run().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod credentials;
pub mod r#loop;
pub mod metrics;
pub mod plan;
pub mod provider;
pub mod reconciler;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod types;

// Re-export main types
pub use credentials::{CredentialResolver, InMemoryCredentialResolver, SecretsDirResolver};
pub use metrics::{MetricsSink, NoopMetrics, PrometheusMetrics};
pub use plan::{DriftFinding, MembershipUpdate, ReconcilePlan};
pub use provider::{DesiredStateProvider, InMemoryDesiredStateProvider, YamlFileProvider};
pub use r#loop::{LoopConfig, ReconciliationLoop};
pub use reconciler::{Reconciler, ReconcilerBuilder, ReconcilerConfig};
pub use retry::RetryPolicy;
pub use shutdown::{LoopStopper, ShutdownSignal};
pub use store::{InMemoryStateStore, JsonFileStateStore, StateStore};
pub use types::{ReconcileAction, ReconciliationStats, UnitFailure};
