//! The liveness monitor: periodic sweeps that probe every tracked
//! connection and evict the ones whose peer vanished without a clean
//! close. A connection that misses one full sweep is asked to close,
//! which drives the normal disconnect path including the presence
//! broadcast.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::registry::ConnectionRegistry;

pub struct LivenessMonitor {
    registry: Arc<ConnectionRegistry>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub probed: usize,
    pub evicted: usize,
}

impl LivenessMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    pub fn spawn(
        self: Arc<Self>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = self.sweep().await;
                        if outcome.evicted > 0 {
                            tracing::info!(
                                evicted = outcome.evicted,
                                probed = outcome.probed,
                                "evicted unresponsive connections"
                            );
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("liveness monitor stopped");
        })
    }

    /// One sweep: connections that answered the previous probe get their
    /// flag cleared and a fresh probe; the rest are closed.
    pub async fn sweep(&self) -> SweepOutcome {
        let mut outcome = SweepOutcome::default();
        for connection in self.registry.snapshot().await {
            if connection.take_alive() {
                connection.send_probe();
                outcome.probed += 1;
            } else {
                tracing::debug!(
                    user_id = %connection.user_id,
                    "connection missed liveness probe; closing"
                );
                connection.request_close();
                outcome.evicted += 1;
            }
        }
        outcome
    }
}
