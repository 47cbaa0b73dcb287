//! Node session lifecycle: connect, verify the contract binding, reconnect.

use alloy_primitives::Address;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{ChainError, ChainProvider};
use crate::executor::{endpoints, RequestExecutor};

/// Default cap on consecutive failed connection attempts
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Connection state for the node session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Verifying,
    Ready,
    Reconnecting { attempt: u32 },
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub contract_address: Address,
    /// Delay before reconnect attempt `n` is `n * reconnect_base_delay`
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

impl ConnectionConfig {
    pub fn new(contract_address: Address) -> Self {
        Self {
            contract_address,
            reconnect_base_delay: Duration::from_secs(5),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Owns the node session and the contract binding.
pub struct ConnectionManager {
    config: ConnectionConfig,
    provider: Arc<dyn ChainProvider>,
    executor: Arc<RequestExecutor>,
    state: RwLock<ConnectionState>,
    /// Consecutive failed attempts since the last successful connect
    failures: AtomicU32,
    /// Consecutive live sessions that dropped without delivering an event.
    /// Survives successful reconnects so a session that dies at once cannot
    /// loop forever.
    session_failures: AtomicU32,
    /// Set once attempts are exhausted or a non-transient failure occurs
    halted: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(
        config: ConnectionConfig,
        provider: Arc<dyn ChainProvider>,
        executor: Arc<RequestExecutor>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            provider,
            executor,
            state: RwLock::new(ConnectionState::Disconnected),
            failures: AtomicU32::new(0),
            session_failures: AtomicU32::new(0),
            halted: AtomicBool::new(false),
            cancel,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Whether automatic reconnection is suspended until [`Self::reinitialize`]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// The larger of failed connects and failed live sessions in a row
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
            .load(Ordering::SeqCst)
            .max(self.session_failures.load(Ordering::SeqCst))
    }

    pub fn contract_address(&self) -> Address {
        self.config.contract_address
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Connection state changed");
        }
    }

    /// Single connection attempt: read the head, then verify byte-code at the
    /// contract address. Returns the current chain height on success.
    pub async fn connect(&self) -> Result<u64, ChainError> {
        self.set_state(ConnectionState::Connecting);
        let provider = self.provider.as_ref();

        let head = match self
            .executor
            .execute(endpoints::BLOCK_NUMBER, || async move { provider.block_number().await })
            .await
        {
            Ok(head) => head,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        self.set_state(ConnectionState::Verifying);
        let address = self.config.contract_address;
        let code = match self
            .executor
            .execute(endpoints::GET_CODE, || async move { provider.code_at(address).await })
            .await
        {
            Ok(code) => code,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if code.is_empty() {
            self.set_state(ConnectionState::Disconnected);
            return Err(ChainError::ContractAbsent { address });
        }

        self.set_state(ConnectionState::Ready);
        tracing::info!(head, contract = %address, "Connected to node, contract verified");
        Ok(head)
    }

    /// Connect, retrying with a linear delay until the attempt cap is reached.
    ///
    /// A non-transient failure halts immediately. Exhausting attempts also
    /// halts; both require [`Self::reinitialize`] before trying again.
    pub async fn connect_with_retry(&self) -> Result<u64, ChainError> {
        if self.is_halted() {
            return Err(ChainError::ReconnectHalted {
                attempts: self.consecutive_failures(),
            });
        }

        loop {
            match self.connect().await {
                Ok(head) => {
                    self.failures.store(0, Ordering::SeqCst);
                    return Ok(head);
                }
                Err(e) => {
                    let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;

                    if !e.is_transient() {
                        tracing::error!(error = %e, "Non-transient connection failure, not reconnecting");
                        self.halted.store(true, Ordering::SeqCst);
                        self.set_state(ConnectionState::Disconnected);
                        return Err(e);
                    }

                    if failures >= self.config.max_reconnect_attempts {
                        tracing::error!(
                            attempts = failures,
                            error = %e,
                            "Connection attempts exhausted, automatic reconnect halted"
                        );
                        self.halted.store(true, Ordering::SeqCst);
                        self.set_state(ConnectionState::Disconnected);
                        return Err(ChainError::ConnectionLost {
                            retry_count: failures,
                        });
                    }

                    let delay = self.config.reconnect_base_delay * failures;
                    self.set_state(ConnectionState::Reconnecting { attempt: failures });
                    tracing::warn!(
                        attempt = failures,
                        max_attempts = self.config.max_reconnect_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Connection failed, retrying"
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.set_state(ConnectionState::Disconnected);
                            return Err(e);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Record a dropped live session and return the delay before the next
    /// reconnect. A session that delivered events starts the count over.
    ///
    /// Halts, like [`Self::connect_with_retry`], on a non-transient error or
    /// once `max_reconnect_attempts` sessions in a row have failed.
    pub fn session_lost(&self, error: &ChainError, delivered: u64) -> Result<Duration, ChainError> {
        if delivered > 0 {
            self.session_failures.store(0, Ordering::SeqCst);
        }
        let failures = self.session_failures.fetch_add(1, Ordering::SeqCst) + 1;

        if !error.is_transient() || failures >= self.config.max_reconnect_attempts {
            tracing::error!(
                attempts = failures,
                error = %error,
                "Live session keeps failing, automatic reconnect halted"
            );
            self.halted.store(true, Ordering::SeqCst);
            self.set_state(ConnectionState::Disconnected);
            return Err(ChainError::ReconnectHalted { attempts: failures });
        }

        self.set_state(ConnectionState::Reconnecting { attempt: failures });
        Ok(self.config.reconnect_base_delay * failures)
    }

    /// Called when the live session drops.
    pub async fn reconnect(&self) -> Result<u64, ChainError> {
        if self.is_halted() {
            self.set_state(ConnectionState::Disconnected);
            return Err(ChainError::ReconnectHalted {
                attempts: self.consecutive_failures(),
            });
        }
        self.set_state(ConnectionState::Reconnecting {
            attempt: self.consecutive_failures(),
        });
        self.connect_with_retry().await
    }

    /// Explicit operator reset: clears the failure counter and the halt flag,
    /// then connects again.
    pub async fn reinitialize(&self) -> Result<u64, ChainError> {
        tracing::info!("Reinitializing connection");
        self.failures.store(0, Ordering::SeqCst);
        self.session_failures.store(0, Ordering::SeqCst);
        self.halted.store(false, Ordering::SeqCst);
        self.connect_with_retry().await
    }

    /// Release the session. The manager stays halted until reinitialized.
    pub fn shutdown(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }
}
