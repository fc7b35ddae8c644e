// Retention Sweeper
// Periodically purges terminal executions older than the retention window

use crate::application::engine::ExecutionEngine;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Retention sweeper
///
/// Runs in the background until the shutdown token fires
pub struct RetentionSweeper {
    engine: ExecutionEngine,
    period: Duration,
}

impl RetentionSweeper {
    /// Create a new retention sweeper
    ///
    /// # Arguments
    /// * `engine` - Engine whose registry is swept
    /// * `period` - How often to sweep
    pub fn new(engine: ExecutionEngine, period: Duration) -> Self {
        Self { engine, period }
    }

    /// Run sweep loop (background task)
    ///
    /// Should be spawned in tokio::spawn
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            period_secs = self.period.as_secs(),
            retention_secs = self.engine.config().retention.as_secs(),
            "Retention sweeper started"
        );

        let mut tick = interval(self.period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            let purged = self.sweep_now();
            if purged > 0 {
                info!(purged, "Expired executions purged");
            } else {
                debug!("Retention sweep found nothing to purge");
            }
        }

        info!("Retention sweeper stopped");
    }

    /// Sweep immediately (for manual trigger)
    pub fn sweep_now(&self) -> usize {
        self.engine.purge_expired()
    }
}
