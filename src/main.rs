//! # rolesync
//!
//! Keeps a PostgreSQL server's users and group roles in line with a declared
//! desired state.
//!
//! ## Startup
//!
//! 1. **Configuration** - TOML file plus `ROLESYNC_*` overrides
//! 2. **Database** - lazy pool, verified with a retried `SELECT 1`
//! 3. **Adapters** - YAML desired state, secrets directory, JSON snapshot file
//! 4. **Metrics** - optional `GET /metrics` endpoint
//! 5. **Reconciliation loop** - one cycle per interval until SIGTERM/SIGINT
//!
//! The in-flight cycle is cancelled at its next unit boundary on shutdown and
//! the pool is closed before exit.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod server;

use std::sync::Arc;

use anyhow::{Context, Result};
use rolesync_core::{Config, Error, ResultExt};
use rolesync_gateway::{PgGateway, PgGatewayConfig};
use rolesync_reconciler::{
    JsonFileStateStore, LoopConfig, LoopStopper, PrometheusMetrics, ReconcilerBuilder,
    ReconcilerConfig, ReconciliationLoop, RetryPolicy, SecretsDirResolver, YamlFileProvider,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const LOG_FORMAT_ENV: &str = "ROLESYNC_LOG_FORMAT";

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::load().context("Failed to load configuration")?;
    info!(
        host = %config.database.host,
        port = config.database.port,
        database = %config.database.name,
        user = %config.database.user,
        interval_secs = config.reconcile.interval_secs,
        dry_run = config.reconcile.dry_run,
        "rolesync starting"
    );

    let gateway = Arc::new(
        PgGateway::new(&PgGatewayConfig::from_config(&config))
            .context("Failed to configure database pool")?,
    );
    let metrics = Arc::new(PrometheusMetrics::new());

    let reconciler = ReconcilerBuilder::new()
        .with_gateway(gateway.clone())
        .with_desired_provider(Arc::new(YamlFileProvider::new(
            &config.sources.users_file,
            &config.database.name,
        )))
        .with_credentials(Arc::new(SecretsDirResolver::new(&config.sources.secrets_dir)))
        .with_state_store(Arc::new(JsonFileStateStore::new(&config.sources.state_file)))
        .with_metrics(metrics.clone())
        .with_config(ReconcilerConfig::from_config(&config))
        .build()
        .context("Failed to build reconciler")?;

    let reconciliation = ReconciliationLoop::new(Arc::new(reconciler), LoopConfig::from_config(&config));
    let stopper = reconciliation.stopper();
    tokio::spawn(wait_for_shutdown(stopper.clone()));

    let pg = gateway.as_ref();
    match RetryPolicy::from_config(&config)
        .run("connect", &stopper.signal(), move || pg.ping())
        .await
    {
        Ok(()) => info!("Database reachable"),
        Err(Error::Cancelled) => {
            info!("Shutdown requested before the database became reachable");
            gateway.close().await;
            return Ok(());
        }
        Err(e) => {
            gateway.close().await;
            return Err(e).context("Database unreachable");
        }
    }

    if let Some(listen_addr) = config.metrics.listen_addr.clone() {
        let signal = stopper.signal();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            server::serve_metrics(&listen_addr, metrics, signal)
                .await
                .into_option_logged("Metrics endpoint stopped");
        });
    }

    reconciliation.run().await;

    gateway.close().await;
    info!("rolesync stopped");
    Ok(())
}

/// `info,rolesync=debug` unless `RUST_LOG` says otherwise; JSON lines when
/// `ROLESYNC_LOG_FORMAT=json`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rolesync=debug"));
    let json = std::env::var(LOG_FORMAT_ENV).is_ok_and(|format| format.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Stop the loop on SIGTERM or SIGINT.
async fn wait_for_shutdown(stopper: LoopStopper) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => info!("Received SIGINT, shutting down"),
                Err(e) => {
                    warn!(error = %e, "Failed to listen for SIGINT");
                    return;
                }
            },
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received Ctrl+C, shutting down");
    }

    stopper.stop();
}
