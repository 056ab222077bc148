//! Continuous reconciliation loop.

use std::sync::Arc;
use std::time::Duration;

use rolesync_core::Config;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::reconciler::Reconciler;
use crate::shutdown::{self, LoopStopper, ShutdownSignal};

/// Configuration for the reconciliation loop.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Interval between reconciliation cycles.
    pub interval: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

impl LoopConfig {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            interval: config.interval(),
        }
    }
}

/// Continuous reconciliation loop.
///
/// Runs one cycle per tick, inline, so cycles never overlap. Ticks missed
/// while a slow cycle runs are skipped rather than bunched up.
pub struct ReconciliationLoop {
    reconciler: Arc<Reconciler>,
    config: LoopConfig,
    stopper: LoopStopper,
    signal: ShutdownSignal,
}

impl ReconciliationLoop {
    /// Create a new reconciliation loop.
    pub fn new(reconciler: Arc<Reconciler>, config: LoopConfig) -> Self {
        let (stopper, signal) = shutdown::channel();
        Self {
            reconciler,
            config,
            stopper,
            signal,
        }
    }

    /// Run until stopped. Cycle failures are logged and the next tick runs
    /// as usual.
    pub async fn run(&self) {
        info!(
            interval_ms = u64::try_from(self.config.interval.as_millis()).unwrap_or(u64::MAX),
            dry_run = self.reconciler.config().dry_run,
            "Starting reconciliation loop"
        );

        let mut consecutive_errors = 0usize;
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.reconciler.reconcile_once(&self.signal).await {
                        Ok(stats) if stats.cancelled => {
                            info!("Reconciliation cycle cancelled");
                        }
                        Ok(stats) => {
                            consecutive_errors = 0;
                            if stats.converged() {
                                debug!("System converged");
                            }
                        }
                        Err(e) => {
                            consecutive_errors = consecutive_errors.saturating_add(1);
                            error!(
                                error = %e,
                                kind = %e.kind(),
                                consecutive = consecutive_errors,
                                "Reconciliation cycle aborted"
                            );
                        }
                    }
                    if self.signal.is_shutdown() {
                        info!("Reconciliation loop stopped");
                        return;
                    }
                }
                () = self.signal.cancelled() => {
                    info!("Reconciliation loop stopped");
                    return;
                }
            }
        }
    }

    /// Stop the loop.
    pub fn stop(&self) {
        self.stopper.stop();
    }

    /// Get a stopper handle.
    #[must_use]
    pub fn stopper(&self) -> LoopStopper {
        self.stopper.clone()
    }
}
