//! Live event delivery.
//!
//! All topic subscriptions are merged into one stream consumed by a single
//! task. Live delivery never advances the checkpoint; overlap with historical
//! replay is absorbed by idempotent application.

use alloy_primitives::Address;
use futures_util::stream::{self, select_all, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::applier::EventApplier;
use crate::chain::{ChainError, ChainLog, ChainProvider, EventTopic, LogSubscription};
use crate::executor::{endpoints, RequestExecutor};

/// Why the live loop returned.
#[derive(Debug, Clone)]
pub enum LiveExit {
    Cancelled,
    /// `delivered` counts events received before the session dropped
    Disconnected { error: ChainError, delivered: u64 },
}

pub struct LiveSubscriber {
    contract: Address,
    provider: Arc<dyn ChainProvider>,
    executor: Arc<RequestExecutor>,
    applier: Arc<EventApplier>,
    /// Head polling interval when the transport cannot stream
    poll_interval: Duration,
}

impl LiveSubscriber {
    pub fn new(
        contract: Address,
        provider: Arc<dyn ChainProvider>,
        executor: Arc<RequestExecutor>,
        applier: Arc<EventApplier>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            contract,
            provider,
            executor,
            applier,
            poll_interval,
        }
    }

    /// Consume live events until cancelled or the session drops.
    ///
    /// An event already being applied when cancellation arrives is allowed to
    /// finish.
    pub async fn run(&self, cancel: CancellationToken) -> LiveExit {
        let mut events = tokio::select! {
            _ = cancel.cancelled() => return LiveExit::Cancelled,
            opened = self.open() => match opened {
                Ok(events) => events,
                Err(error) => return LiveExit::Disconnected { error, delivered: 0 },
            },
        };

        tracing::info!(contract = %self.contract, "Live subscription active");
        let mut received: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(received, "Live subscription cancelled");
                    return LiveExit::Cancelled;
                }
                next = events.next() => next,
            };

            match next {
                Some(Ok(log)) => {
                    received += 1;
                    self.applier.apply_log(&log).await;
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, received, "Live subscription lost");
                    return LiveExit::Disconnected {
                        error: e,
                        delivered: received,
                    };
                }
                None => {
                    tracing::warn!(received, "Live subscription stream ended");
                    return LiveExit::Disconnected {
                        error: ChainError::SubscriptionError("stream ended".to_string()),
                        delivered: received,
                    };
                }
            }
        }
    }

    /// Subscribe every topic, falling back to head polling when the transport
    /// cannot stream.
    async fn open(&self) -> Result<LogSubscription, ChainError> {
        let provider = self.provider.as_ref();
        let contract = self.contract;
        let mut subscriptions = Vec::with_capacity(EventTopic::ALL.len());

        for topic in EventTopic::ALL {
            let signature = topic.signature();
            let subscribed = self
                .executor
                .execute(endpoints::SUBSCRIBE, || async move {
                    provider.subscribe(contract, signature).await
                })
                .await;

            match subscribed {
                Ok(subscription) => {
                    tracing::debug!(event = topic.name(), "Subscribed");
                    subscriptions.push(subscription);
                }
                Err(ChainError::SubscriptionUnsupported) => {
                    tracing::info!(
                        interval_ms = self.poll_interval.as_millis() as u64,
                        "Streaming unavailable, polling for new logs"
                    );
                    return Ok(self.poll_stream());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(select_all(subscriptions).boxed())
    }

    fn poll_stream(&self) -> LogSubscription {
        let poller = Poller {
            contract: self.contract,
            provider: self.provider.clone(),
            executor: self.executor.clone(),
            interval: self.poll_interval,
            next_block: None,
            buffer: VecDeque::new(),
        };

        stream::unfold(poller, |mut poller| async move {
            loop {
                if let Some(log) = poller.buffer.pop_front() {
                    return Some((Ok(log), poller));
                }
                tokio::time::sleep(poller.interval).await;
                if let Err(e) = poller.poll().await {
                    return Some((Err(e), poller));
                }
            }
        })
        .boxed()
    }
}

/// Polling fallback state: fetches `[next_block, head]` on each tick.
struct Poller {
    contract: Address,
    provider: Arc<dyn ChainProvider>,
    executor: Arc<RequestExecutor>,
    interval: Duration,
    /// `None` until the first poll pins the starting height
    next_block: Option<u64>,
    buffer: VecDeque<ChainLog>,
}

impl Poller {
    async fn poll(&mut self) -> Result<(), ChainError> {
        let provider = self.provider.as_ref();
        let contract = self.contract;

        let head = self
            .executor
            .execute(endpoints::BLOCK_NUMBER, || async move { provider.block_number().await })
            .await?;

        let from = match self.next_block {
            Some(next) => next,
            None => {
                self.next_block = Some(head + 1);
                return Ok(());
            }
        };
        if head < from {
            return Ok(());
        }

        let mut logs = Vec::new();
        for topic in EventTopic::ALL {
            let signature = topic.signature();
            let found = self
                .executor
                .execute(endpoints::GET_LOGS, || async move {
                    provider.query_logs(contract, signature, from, head).await
                })
                .await?;
            logs.extend(found);
        }
        logs.sort_by_key(|log| log.ordering_key());

        self.buffer.extend(logs);
        self.next_block = Some(head + 1);
        Ok(())
    }
}
