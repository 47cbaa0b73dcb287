//! Blockchain provider seam.
//!
//! The pipeline talks to the node only through [`ChainProvider`]. Calls are
//! raw: pacing and retries are applied by the caller through the request
//! executor.

use alloy_primitives::{Address, Bytes, B256, U256};
use futures_util::stream::BoxStream;
use serde::Serialize;

use super::{ChainError, ChainLog};

/// Live log stream for one topic. Ends (or yields an error) when the
/// underlying session is lost.
pub type LogSubscription = BoxStream<'static, Result<ChainLog, ChainError>>;

/// Vault record as stored by the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainVault {
    pub owner: Address,
    pub token: Address,
    /// Raw token units
    pub balance: U256,
    /// Unix seconds
    pub unlock_time: U256,
    pub active: bool,
}

/// Contract-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContractMetadata {
    /// Platform fee in basis points
    pub platform_fee_bps: U256,
    pub fee_recipient: Address,
}

#[async_trait::async_trait]
pub trait ChainProvider: Send + Sync {
    /// Current chain height
    async fn block_number(&self) -> Result<u64, ChainError>;

    /// Deployed byte-code at `address` (empty when no contract is deployed)
    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError>;

    /// Logs emitted by `contract` with `topic` as topic0, in `[from_block, to_block]`
    async fn query_logs(
        &self,
        contract: Address,
        topic: B256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<ChainLog>, ChainError>;

    /// Open a live subscription for one topic.
    ///
    /// Returns [`ChainError::SubscriptionUnsupported`] when the transport
    /// cannot stream, in which case callers fall back to polling.
    async fn subscribe(&self, contract: Address, topic: B256) -> Result<LogSubscription, ChainError>;

    /// ERC-20 `symbol()`
    async fn token_symbol(&self, token: Address) -> Result<String, ChainError>;

    /// ERC-20 `decimals()`
    async fn token_decimals(&self, token: Address) -> Result<u8, ChainError>;

    /// Contract `getVault(id)`
    async fn vault_by_id(&self, contract: Address, vault_id: U256) -> Result<OnChainVault, ChainError>;

    /// Contract `platformFee()` and `feeRecipient()`
    async fn contract_metadata(&self, contract: Address) -> Result<ContractMetadata, ChainError>;
}
