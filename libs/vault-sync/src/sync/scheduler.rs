//! Interval-based gap repair.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::historical::{HistoricalSyncEngine, SyncOutcome};
use crate::chain::{ChainError, ChainProvider, ConnectionManager};
use crate::executor::{endpoints, RequestExecutor};

pub struct PeriodicScheduler {
    interval: Duration,
    engine: Arc<HistoricalSyncEngine>,
    connection: Arc<ConnectionManager>,
    provider: Arc<dyn ChainProvider>,
    executor: Arc<RequestExecutor>,
}

impl PeriodicScheduler {
    pub fn new(
        interval: Duration,
        engine: Arc<HistoricalSyncEngine>,
        connection: Arc<ConnectionManager>,
        provider: Arc<dyn ChainProvider>,
        executor: Arc<RequestExecutor>,
    ) -> Self {
        Self {
            interval,
            engine,
            connection,
            provider,
            executor,
        }
    }

    /// Run gap repair every `interval` until cancelled. The first run happens
    /// one full interval after start.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Gap repair scheduler started");

        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the immediate first tick
        timer.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Gap repair scheduler stopped");
                    break;
                }
                _ = timer.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// One gap-repair pass. Skipped while the connection is not ready.
    pub async fn tick(&self) -> Option<SyncOutcome> {
        if !self.connection.is_ready() {
            tracing::debug!(state = ?self.connection.state(), "Connection not ready, skipping gap repair");
            return None;
        }

        match self.repair().await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!(error = %e, "Gap repair failed, will retry next interval");
                None
            }
        }
    }

    async fn repair(&self) -> Result<SyncOutcome, ChainError> {
        let provider = self.provider.as_ref();
        let head = self
            .executor
            .execute(endpoints::BLOCK_NUMBER, || async move { provider.block_number().await })
            .await?;
        self.engine.catch_up(head).await
    }
}
