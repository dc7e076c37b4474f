use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregate::Aggregator;
use crate::store::Store;

/// Minute-aligned flush loop: waits for the next wall-clock minute mark,
/// drains the aggregator and persists the result, then reschedules.
///
/// The delay is recomputed from the clock after every cycle, so a slow
/// flush shortens the next wait instead of drifting the schedule. A cycle
/// that is already running finishes even when shutdown is requested; the
/// loop only exits between cycles.
pub struct FlushWorker {
    aggregator: Arc<Aggregator>,
    store: Store,
    cancel: CancellationToken,
}

impl FlushWorker {
    pub fn new(aggregator: Arc<Aggregator>, store: Store, cancel: CancellationToken) -> Self {
        Self {
            aggregator,
            store,
            cancel,
        }
    }

    /// Runs the flush loop until cancelled.
    pub async fn run(mut self) {
        info!("flush worker started");

        loop {
            let delay = next_minute_delay(Utc::now());
            debug!(delay_ms = delay.as_millis() as u64, "scheduling next flush");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            self.tick().await;

            if self.cancel.is_cancelled() {
                break;
            }
        }

        info!("flush worker stopped");
    }

    /// One flush cycle: drain the buffer, persist at minute granularity.
    ///
    /// A persistence failure drops the batch; the buffer was already reset
    /// and the next cycle starts clean.
    async fn tick(&mut self) {
        let metrics = self.aggregator.flush_and_reset();
        debug!(entities = metrics.len(), "flushing aggregated metrics");

        if let Err(e) = self.store.insert_metrics(&metrics, Utc::now(), true).await {
            error!(error = %e, "flush cycle failed to persist");
        }
    }
}

/// Time until the next wall-clock minute mark, at millisecond resolution.
/// Exactly on a mark, the full minute is returned.
fn next_minute_delay(now: DateTime<Utc>) -> Duration {
    let into_minute = now.timestamp_millis().rem_euclid(60_000);
    Duration::from_millis((60_000 - into_minute) as u64)
}
