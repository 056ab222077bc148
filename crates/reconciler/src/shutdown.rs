//! Shutdown signalling shared by the loop, retries and in-flight units.

use tokio::sync::watch;

/// Create a connected stopper/signal pair.
#[must_use]
pub fn channel() -> (LoopStopper, ShutdownSignal) {
    let (stop_tx, stop_rx) = watch::channel(false);
    (LoopStopper { stop_tx }, ShutdownSignal { stop_rx })
}

/// Handle to stop a reconciliation loop.
#[derive(Clone)]
pub struct LoopStopper {
    stop_tx: watch::Sender<bool>,
}

impl LoopStopper {
    /// Stop the loop.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// A new receiver for this stopper.
    #[must_use]
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            stop_rx: self.stop_tx.subscribe(),
        }
    }
}

/// Receiving side of a [`LoopStopper`].
#[derive(Clone)]
pub struct ShutdownSignal {
    stop_rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// A signal that never fires.
    #[must_use]
    pub fn never() -> Self {
        let (stopper, signal) = channel();
        // A dropped sender leaves the last value in place.
        drop(stopper);
        signal
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Resolve once shutdown is requested. Pends forever if the stopper is
    /// gone without stopping.
    pub async fn cancelled(&self) {
        let mut stop_rx = self.stop_rx.clone();
        if stop_rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
