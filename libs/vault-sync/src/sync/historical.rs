//! Windowed historical replay.
//!
//! Replays `[from_block, to_block]` in fixed windows, applying events in chain
//! order, and advances the checkpoint only once the whole range is consumed.

use alloy_primitives::Address;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::applier::EventApplier;
use crate::chain::{ChainError, ChainLog, ChainProvider, EventTopic};
use crate::checkpoint::CheckpointTracker;
use crate::executor::{endpoints, pause, RequestExecutor};

#[derive(Debug, Clone)]
pub struct HistoricalSyncConfig {
    /// Blocks per `eth_getLogs` window
    pub batch_size: u64,
    /// Ranges wider than `batch_size * max_range_multiplier` are skipped
    pub max_range_multiplier: u64,
    /// Settling delay between windows
    pub window_delay: Duration,
    /// Extra wait added per retry when a window stays rate limited after the
    /// executor's own retries
    pub rate_limit_wait: Duration,
    pub max_window_retries: u32,
}

impl Default for HistoricalSyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 1_000,
            max_range_multiplier: 10,
            window_delay: Duration::from_millis(200),
            rate_limit_wait: Duration::from_secs(5),
            max_window_retries: 3,
        }
    }
}

impl HistoricalSyncConfig {
    pub fn range_ceiling(&self) -> u64 {
        self.batch_size.saturating_mul(self.max_range_multiplier)
    }
}

/// A range the engine jumped over without replaying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedGap {
    pub from_block: u64,
    pub to_block: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub from_block: u64,
    pub to_block: u64,
    pub windows: u64,
    pub logs_seen: usize,
    pub events_applied: usize,
    pub events_failed: usize,
    /// Set when the range exceeded the ceiling and was skipped
    pub skipped: Option<SkippedGap>,
    /// Stopped early on shutdown; the checkpoint was not advanced
    pub interrupted: bool,
}

pub struct HistoricalSyncEngine {
    config: HistoricalSyncConfig,
    contract: Address,
    provider: Arc<dyn ChainProvider>,
    executor: Arc<RequestExecutor>,
    applier: Arc<EventApplier>,
    checkpoint: Arc<CheckpointTracker>,
    gaps: Mutex<Vec<SkippedGap>>,
    /// Serializes overlapping catch-up and scheduled runs
    running: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

impl HistoricalSyncEngine {
    pub fn new(
        config: HistoricalSyncConfig,
        contract: Address,
        provider: Arc<dyn ChainProvider>,
        executor: Arc<RequestExecutor>,
        applier: Arc<EventApplier>,
        checkpoint: Arc<CheckpointTracker>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            contract,
            provider,
            executor,
            applier,
            checkpoint,
            gaps: Mutex::new(Vec::new()),
            running: tokio::sync::Mutex::new(()),
            cancel,
        }
    }

    pub fn config(&self) -> &HistoricalSyncConfig {
        &self.config
    }

    pub fn skipped_gaps(&self) -> Vec<SkippedGap> {
        self.gaps.lock().clone()
    }

    /// Replay everything after the checkpoint up to `head`.
    pub async fn catch_up(&self, head: u64) -> Result<SyncOutcome, ChainError> {
        let from_block = self.checkpoint.current().saturating_add(1);
        if from_block > head {
            tracing::debug!(checkpoint = from_block - 1, head, "Already caught up");
            return Ok(SyncOutcome {
                from_block,
                to_block: head,
                ..Default::default()
            });
        }
        self.sync_range(from_block, head).await
    }

    /// Replay `[from_block, to_block]`.
    pub async fn sync_range(&self, from_block: u64, to_block: u64) -> Result<SyncOutcome, ChainError> {
        let _guard = self.running.lock().await;

        let mut outcome = SyncOutcome {
            from_block,
            to_block,
            ..Default::default()
        };
        if from_block > to_block {
            return Ok(outcome);
        }

        let span = to_block - from_block;
        let ceiling = self.config.range_ceiling();
        if span > ceiling {
            let gap = SkippedGap {
                from_block,
                to_block,
                recorded_at: Utc::now(),
            };
            tracing::warn!(
                from_block,
                to_block,
                span,
                ceiling,
                "Range exceeds replay ceiling, skipping to head without replay"
            );
            self.gaps.lock().push(gap.clone());
            self.checkpoint.advance_to(to_block);
            outcome.skipped = Some(gap);
            return Ok(outcome);
        }

        tracing::info!(from_block, to_block, "Starting historical sync");

        let batch_size = self.config.batch_size.max(1);
        let mut window_start = from_block;
        while window_start <= to_block {
            if self.cancel.is_cancelled() {
                tracing::info!(
                    window_start,
                    to_block,
                    "Historical sync interrupted by shutdown"
                );
                outcome.interrupted = true;
                return Ok(outcome);
            }

            let window_end = window_start.saturating_add(batch_size - 1).min(to_block);
            let logs = self.fetch_window(window_start, window_end).await?;

            tracing::debug!(
                from = window_start,
                to = window_end,
                logs = logs.len(),
                "Processing window"
            );

            outcome.windows += 1;
            outcome.logs_seen += logs.len();
            for log in &logs {
                match self.applier.apply_log(log).await {
                    Some(_) => outcome.events_applied += 1,
                    None => outcome.events_failed += 1,
                }
            }

            if window_end == to_block {
                break;
            }
            window_start = window_end + 1;
            pause(self.config.window_delay).await;
        }

        self.checkpoint.advance_to(to_block);
        tracing::info!(
            from_block,
            to_block,
            windows = outcome.windows,
            applied = outcome.events_applied,
            failed = outcome.events_failed,
            "Historical sync complete"
        );
        Ok(outcome)
    }

    /// All logs for every topic in one window, sorted into chain order.
    async fn fetch_window(&self, from: u64, to: u64) -> Result<Vec<ChainLog>, ChainError> {
        let mut logs = Vec::new();
        for topic in EventTopic::ALL {
            logs.extend(self.fetch_topic(topic, from, to).await?);
        }
        logs.sort_by_key(|log| log.ordering_key());
        Ok(logs)
    }

    async fn fetch_topic(&self, topic: EventTopic, from: u64, to: u64) -> Result<Vec<ChainLog>, ChainError> {
        let provider = self.provider.as_ref();
        let contract = self.contract;
        let signature = topic.signature();
        let mut retries = 0;

        loop {
            let result = self
                .executor
                .execute(endpoints::GET_LOGS, || async move {
                    provider.query_logs(contract, signature, from, to).await
                })
                .await;

            match result {
                Ok(logs) => return Ok(logs),
                Err(e) if e.is_rate_limit() && retries < self.config.max_window_retries => {
                    retries += 1;
                    let wait = self.config.rate_limit_wait * retries;
                    tracing::warn!(
                        event = topic.name(),
                        from,
                        to,
                        retry = retries,
                        wait_ms = wait.as_millis() as u64,
                        "Window still rate limited, extending wait"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(e),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
