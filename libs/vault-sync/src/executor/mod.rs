//! Rate-limited request executor.
//!
//! Every outbound provider call goes through [`RequestExecutor::execute`],
//! keyed by an endpoint name. Each key owns a token bucket and a backoff
//! state; admission is serialized per key while distinct keys run
//! independently.
//!
//! # Example
//! ```ignore
//! let executor = RequestExecutor::new(ExecutorConfig::default());
//! let head = executor
//!     .execute(endpoints::BLOCK_NUMBER, || async move { provider.block_number().await })
//!     .await?;
//! ```

mod bucket;
mod classify;

pub use bucket::EndpointConfig;
pub use classify::{classify_rate_limit, parse_retry_hint, RateLimitSignal, RetryClassify};

use bucket::BucketState;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Endpoint keys used by the pipeline.
pub mod endpoints {
    pub const BLOCK_NUMBER: &str = "eth_blockNumber";
    pub const GET_CODE: &str = "eth_getCode";
    pub const GET_LOGS: &str = "eth_getLogs";
    pub const CONTRACT_CALL: &str = "eth_call";
    pub const SUBSCRIBE: &str = "eth_subscribe";
}

/// Endpoint policies, keyed by endpoint name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub endpoints: HashMap<String, EndpointConfig>,
    /// Policy for endpoint keys missing from `endpoints`
    pub fallback: EndpointConfig,
}

impl ExecutorConfig {
    pub fn with_endpoint(mut self, key: impl Into<String>, config: EndpointConfig) -> Self {
        self.endpoints.insert(key.into(), config);
        self
    }

    pub fn endpoint(&self, key: &str) -> &EndpointConfig {
        self.endpoints.get(key).unwrap_or(&self.fallback)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let base = EndpointConfig::conservative();
        let mut policies = HashMap::new();
        policies.insert(
            endpoints::GET_LOGS.to_string(),
            base.clone()
                .with_rate(2.0, 3.0)
                .with_backoff(2_000, 60_000, 2.0)
                .with_max_retries(5),
        );
        policies.insert(
            endpoints::CONTRACT_CALL.to_string(),
            base.clone().with_rate(5.0, 10.0).with_backoff(500, 15_000, 2.0),
        );
        policies.insert(
            endpoints::BLOCK_NUMBER.to_string(),
            base.clone().with_rate(2.0, 5.0).with_backoff(500, 10_000, 2.0),
        );
        policies.insert(
            endpoints::GET_CODE.to_string(),
            base.clone().with_rate(1.0, 2.0),
        );
        policies.insert(
            endpoints::SUBSCRIBE.to_string(),
            base.clone().with_rate(1.0, 5.0),
        );

        Self {
            endpoints: policies,
            fallback: base,
        }
    }
}

/// Point-in-time view of one endpoint's pacing state.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub endpoint: String,
    pub tokens: f64,
    pub consecutive_errors: u32,
    pub rate_limited: bool,
    pub cooldown_remaining_ms: u64,
}

struct Endpoint {
    config: EndpointConfig,
    state: tokio::sync::Mutex<BucketState>,
}

/// Paces and retries outbound calls per endpoint key.
pub struct RequestExecutor {
    config: ExecutorConfig,
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
}

impl RequestExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn endpoint(&self, key: &str) -> Arc<Endpoint> {
        let mut endpoints = self.endpoints.lock();
        endpoints
            .entry(key.to_string())
            .or_insert_with(|| {
                let config = self.config.endpoint(key).clone();
                let state = BucketState::new(&config);
                Arc::new(Endpoint {
                    config,
                    state: tokio::sync::Mutex::new(state),
                })
            })
            .clone()
    }

    /// Run `call` under the pacing policy of `endpoint_key`.
    ///
    /// Rate-limited failures are retried with backoff up to `max_retries`
    /// times; the last rate-limit error is returned once attempts run out.
    /// Any other error is returned as-is on the first occurrence.
    pub async fn execute<T, E, F, Fut>(&self, endpoint_key: &str, mut call: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClassify + std::fmt::Display,
    {
        let endpoint = self.endpoint(endpoint_key);
        let mut attempt: u32 = 0;

        loop {
            self.admit(endpoint_key, &endpoint).await;

            match call().await {
                Ok(value) => {
                    endpoint.state.lock().await.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    let Some(signal) = err.rate_limit_signal() else {
                        return Err(err);
                    };

                    let wait = {
                        let mut state = endpoint.state.lock().await;
                        let wait = signal.retry_after.unwrap_or_else(|| {
                            let sample = rand::thread_rng().gen_range(0.0..=1.0);
                            endpoint
                                .config
                                .backoff_with_jitter(state.consecutive_errors, sample)
                        });
                        state.record_rate_limit(wait, Instant::now());
                        wait
                    };

                    if attempt >= endpoint.config.max_retries {
                        tracing::error!(
                            endpoint = endpoint_key,
                            attempts = attempt + 1,
                            error = %err,
                            "Rate limit retries exhausted"
                        );
                        return Err(err);
                    }

                    attempt += 1;
                    tracing::warn!(
                        endpoint = endpoint_key,
                        attempt,
                        max_retries = endpoint.config.max_retries,
                        wait_ms = wait.as_millis() as u64,
                        error = %err,
                        "Rate limited, backing off"
                    );
                }
            }
        }
    }

    /// Wait out any cool-down, then take one token.
    async fn admit(&self, endpoint_key: &str, endpoint: &Endpoint) {
        let mut state = endpoint.state.lock().await;

        if let Some(remaining) = state.cooldown_remaining(Instant::now()) {
            tracing::debug!(
                endpoint = endpoint_key,
                wait_ms = remaining.as_millis() as u64,
                "Waiting for rate-limit cool-down"
            );
            tokio::time::sleep(remaining).await;
        }
        state.reset_at = None;

        loop {
            state.refill(&endpoint.config, Instant::now());
            let wait = state.time_until_token(&endpoint.config);
            if wait.is_zero() {
                state.tokens -= 1.0;
                return;
            }
            tracing::trace!(
                endpoint = endpoint_key,
                wait_ms = wait.as_millis() as u64,
                "Token bucket empty, pacing"
            );
            tokio::time::sleep(wait).await;
        }
    }

    /// Snapshot of every endpoint that has been used so far.
    pub fn snapshot(&self) -> Vec<EndpointSnapshot> {
        let endpoints: Vec<(String, Arc<Endpoint>)> = self
            .endpoints
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let now = Instant::now();
        let mut snapshots: Vec<EndpointSnapshot> = endpoints
            .into_iter()
            .filter_map(|(key, endpoint)| {
                // Skip endpoints that are mid-admission rather than waiting on them.
                let state = endpoint.state.try_lock().ok()?;
                Some(EndpointSnapshot {
                    endpoint: key,
                    tokens: state.tokens,
                    consecutive_errors: state.consecutive_errors,
                    rate_limited: state.rate_limited,
                    cooldown_remaining_ms: state
                        .cooldown_remaining(now)
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                })
            })
            .collect();
        snapshots.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        snapshots
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }
}

impl Default for RequestExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

/// Convenience for call sites that only need a fixed pause between steps.
pub(crate) async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}
